// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#[derive(Debug, onlyerror::Error)]
pub enum AllocError {
    /// The OS refused to map the region.
    #[error("failed to map {0} bytes of executable memory: {1}")]
    MapFailed(usize, std::io::Error),
    /// The requested size can't be rounded to whole pages.
    #[error("code region of {0} bytes is too large")]
    SizeOverflow(usize),
    /// Every slot index is taken.
    #[error("too many live code regions")]
    TooManyRegions,
}
