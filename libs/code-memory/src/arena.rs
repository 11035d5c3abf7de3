// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::AllocError;
use crate::mmap::{Mmap, page_round_up};
use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};
use parking_lot::Mutex;

static NEXT_ARENA_ID: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Smallest region the arena will map, before rounding to whole pages.
    pub min_region_size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            min_region_size: 4096,
        }
    }
}

/// A handle to one region of executable memory inside a [`CodeArena`].
///
/// Handles are plain values: copying one does not copy the region. A handle
/// is only valid until the region is freed or expanded, after which the arena
/// rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeBlob {
    arena: u32,
    index: u32,
    generation: u32,
    base: NonNull<u8>,
    size: usize,
}

// Safety: the handle itself is just an address and a few integers, all access
// to the memory behind it goes through the arena or the owning `Assembler`.
unsafe impl Send for CodeBlob {}
// Safety: see above
unsafe impl Sync for CodeBlob {}

impl CodeBlob {
    /// The address of the first byte of the region. Compiled functions start here.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// The capacity of the region in bytes, always a multiple of the page size.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Slot {
    generation: u32,
    mmap: Option<Mmap>,
}

#[derive(Default)]
struct ArenaInner {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
}

impl ArenaInner {
    fn insert(&mut self, arena: u32, mmap: Mmap) -> Result<CodeBlob, AllocError> {
        let index = if let Some(index) = self.free_slots.pop() {
            index
        } else {
            let index = u32::try_from(self.slots.len()).map_err(|_| AllocError::TooManyRegions)?;
            self.slots.push(Slot {
                generation: 0,
                mmap: None,
            });
            index
        };

        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.mmap.is_none());
        let blob = blob_for(arena, index, slot.generation, &mmap);
        slot.mmap = Some(mmap);
        Ok(blob)
    }

    fn get(&self, blob: &CodeBlob) -> Option<&Slot> {
        self.slots
            .get(blob.index as usize)
            .filter(|slot| slot.generation == blob.generation && slot.mmap.is_some())
    }

    fn live_slot_mut(&mut self, arena: u32, blob: &CodeBlob) -> &mut Slot {
        assert_eq!(
            blob.arena, arena,
            "{blob:?} was allocated by a different arena"
        );
        match self
            .slots
            .get_mut(blob.index as usize)
            .filter(|slot| slot.generation == blob.generation && slot.mmap.is_some())
        {
            Some(slot) => slot,
            None => panic!("stale {blob:?}, its region was freed or relocated"),
        }
    }
}

fn blob_for(arena: u32, index: u32, generation: u32, mmap: &Mmap) -> CodeBlob {
    CodeBlob {
        arena,
        index,
        generation,
        base: mmap.as_non_null(),
        size: mmap.len(),
    }
}

/// Owner of every executable region handed out as a [`CodeBlob`].
///
/// The slot table is behind a mutex so many threads can allocate, grow and
/// free concurrently. Writing into a region is not synchronised, each region
/// is expected to have a single writer (its [`Assembler`](crate::Assembler)).
pub struct CodeArena {
    id: u32,
    config: ArenaConfig,
    inner: Mutex<ArenaInner>,
}

impl Default for CodeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodeArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeArena")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("live_regions", &self.live_regions())
            .finish_non_exhaustive()
    }
}

impl CodeArena {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ArenaConfig::default())
    }

    #[must_use]
    pub fn with_config(config: ArenaConfig) -> Self {
        Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            config,
            inner: Mutex::new(ArenaInner::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    fn region_len(&self, size: usize) -> Result<usize, AllocError> {
        page_round_up(size.max(self.config.min_region_size).max(1))
            .ok_or(AllocError::SizeOverflow(size))
    }

    /// Maps a fresh zero-filled region of at least `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size overflows when rounded to pages or the OS
    /// refuses the mapping.
    pub fn allocate(&self, size: usize) -> Result<CodeBlob, AllocError> {
        let len = self.region_len(size)?;
        let mmap = Mmap::new_executable(len).map_err(|err| AllocError::MapFailed(len, err))?;

        let blob = self.inner.lock().insert(self.id, mmap)?;
        log::trace!("allocated code region {blob:?}");
        Ok(blob)
    }

    /// Grows `blob`, at least doubling its size.
    ///
    /// See [`expand_to`](Self::expand_to).
    ///
    /// # Errors
    ///
    /// Returns an error if the bigger region can't be mapped. `blob` stays
    /// valid in that case.
    ///
    /// # Panics
    ///
    /// Panics if `blob` is stale or belongs to a different arena.
    pub fn expand(&self, blob: CodeBlob) -> Result<CodeBlob, AllocError> {
        self.expand_to(blob, blob.size.saturating_mul(2))
    }

    /// Grows `blob` to hold at least `min_size` bytes and never less than
    /// twice its current size.
    ///
    /// The contents are copied to a new region and the old one is unmapped,
    /// so the returned handle usually has a different base address. Either
    /// way it carries a new generation and `blob` becomes stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the bigger region can't be mapped. `blob` stays
    /// valid in that case.
    ///
    /// # Panics
    ///
    /// Panics if `blob` is stale or belongs to a different arena.
    pub fn expand_to(&self, blob: CodeBlob, min_size: usize) -> Result<CodeBlob, AllocError> {
        let mut inner = self.inner.lock();
        let slot = inner.live_slot_mut(self.id, &blob);

        let len = self.region_len(min_size.max(blob.size.saturating_mul(2)))?;
        let new = Mmap::new_executable(len).map_err(|err| AllocError::MapFailed(len, err))?;

        let old = slot.mmap.take();
        if let Some(old) = &old {
            // Safety: both mappings are live, `new` is larger than `old` and
            // they don't overlap because they are distinct mappings.
            unsafe {
                ptr::copy_nonoverlapping(old.as_ptr(), new.as_mut_ptr(), old.len());
            }
        }

        slot.generation = slot.generation.wrapping_add(1);
        let expanded = blob_for(self.id, blob.index, slot.generation, &new);
        slot.mmap = Some(new);
        drop(inner);
        drop(old);

        log::trace!("expanded code region {blob:?} => {expanded:?}");
        Ok(expanded)
    }

    /// Unmaps the region behind `blob`.
    ///
    /// # Panics
    ///
    /// Panics if `blob` is stale or belongs to a different arena.
    pub fn free(&self, blob: CodeBlob) {
        let mut inner = self.inner.lock();
        let slot = inner.live_slot_mut(self.id, &blob);
        let mmap = slot.mmap.take();
        slot.generation = slot.generation.wrapping_add(1);
        inner.free_slots.push(blob.index);
        drop(inner);
        drop(mmap);

        log::trace!("freed code region {blob:?}");
    }

    /// Whether `blob` still refers to a mapped region of this arena.
    #[must_use]
    pub fn is_live(&self, blob: &CodeBlob) -> bool {
        blob.arena == self.id && self.inner.lock().get(blob).is_some()
    }

    /// Copies the whole region behind `blob` out of the arena.
    ///
    /// # Panics
    ///
    /// Panics if `blob` is stale or belongs to a different arena.
    #[must_use]
    pub fn read(&self, blob: &CodeBlob) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let slot = inner.live_slot_mut(self.id, blob);
        slot.mmap.as_ref().map(|mmap| mmap.as_slice().to_vec()).unwrap_or_default()
    }

    /// The number of regions that have been allocated but not freed.
    #[must_use]
    pub fn live_regions(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.mmap.is_some())
            .count()
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        for (index, slot) in self.inner.get_mut().slots.iter_mut().enumerate() {
            if let Some(mmap) = slot.mmap.take() {
                log::warn!(
                    "code arena {} dropped with live region {index} ({} bytes at {:p})",
                    self.id,
                    mmap.len(),
                    mmap.as_ptr()
                );
            }
        }
    }
}
