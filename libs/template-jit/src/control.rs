// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Compile-time tracking of the structured control instructions enclosing the
//! instruction currently being compiled.

use crate::error::{Error, invalid};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// The implicit block around the whole body. Branching to it returns.
    Function,
    Block,
    Loop,
    If,
}

/// Where branches targeting a frame go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Label {
    /// The frame's end hasn't been emitted yet, these rel32 displacements
    /// get patched once it is.
    Forward(Vec<usize>),
    /// Loop heads are known before any branch to them.
    Bound(usize),
}

#[derive(Debug)]
pub(crate) struct Frame {
    pub kind: FrameKind,
    pub params: usize,
    pub results: usize,
    /// Operand stack height below the frame's parameters.
    pub height: usize,
    pub label: Label,
    /// The `jz` skipping the then-arm of an `if`, patched at `else` or `end`.
    pub else_fixup: Option<usize>,
}

impl Frame {
    pub fn new(kind: FrameKind, params: usize, results: usize, height: usize) -> Self {
        Self {
            kind,
            params,
            results,
            height,
            label: Label::Forward(Vec::new()),
            else_fixup: None,
        }
    }

    pub fn new_loop(params: usize, results: usize, height: usize, head: usize) -> Self {
        Self {
            label: Label::Bound(head),
            ..Self::new(FrameKind::Loop, params, results, height)
        }
    }

    /// Number of values a branch to this frame carries. Branching to a loop
    /// starts another iteration so it takes the loop's parameters.
    pub fn branch_arity(&self) -> usize {
        if self.kind == FrameKind::Loop {
            self.params
        } else {
            self.results
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ControlStack {
    frames: Vec<Frame>,
}

impl ControlStack {
    pub fn push(&mut self, frame: Frame) {
        log::trace!(
            "enter {:?} at depth {}, height {}",
            frame.kind,
            self.frames.len(),
            frame.height
        );
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Result<Frame, Error> {
        self.frames
            .pop()
            .ok_or_else(|| invalid("`end` without an enclosing block"))
    }

    pub fn current(&self) -> Result<&Frame, Error> {
        self.frames
            .last()
            .ok_or_else(|| invalid("instruction outside of any block"))
    }

    pub fn current_mut(&mut self) -> Result<&mut Frame, Error> {
        self.frames
            .last_mut()
            .ok_or_else(|| invalid("instruction outside of any block"))
    }

    /// The frame a branch with relative label `depth` targets.
    pub fn resolve(&mut self, depth: u32) -> Result<&mut Frame, Error> {
        let len = self.frames.len();
        usize::try_from(depth)
            .ok()
            .and_then(|depth| depth.checked_add(1))
            .and_then(|depth| len.checked_sub(depth))
            .and_then(|idx| self.frames.get_mut(idx))
            .ok_or_else(|| {
                invalid(format!(
                    "branch to label {depth} with only {len} enclosing blocks"
                ))
            })
    }

    /// Relative label of the function frame, i.e. the target of `return`.
    pub fn outermost(&self) -> Result<u32, Error> {
        self.frames
            .len()
            .checked_sub(1)
            .and_then(|depth| u32::try_from(depth).ok())
            .ok_or_else(|| invalid("`return` outside of a function"))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_counts_from_the_innermost_frame() {
        let mut stack = ControlStack::default();
        stack.push(Frame::new(FrameKind::Function, 0, 1, 0));
        stack.push(Frame::new(FrameKind::Block, 0, 0, 0));
        stack.push(Frame::new_loop(2, 1, 3, 17));

        assert_eq!(stack.resolve(0).unwrap().kind, FrameKind::Loop);
        assert_eq!(stack.resolve(1).unwrap().kind, FrameKind::Block);
        assert_eq!(stack.resolve(2).unwrap().kind, FrameKind::Function);
        assert!(matches!(stack.resolve(3), Err(Error::InvalidFunction(_))));
        assert!(matches!(stack.resolve(u32::MAX), Err(Error::InvalidFunction(_))));
        assert_eq!(stack.outermost().unwrap(), 2);
    }

    #[test]
    fn branch_arity() {
        let block = Frame::new(FrameKind::Block, 2, 1, 0);
        assert_eq!(block.branch_arity(), 1);

        let lp = Frame::new_loop(2, 1, 0, 0);
        assert_eq!(lp.branch_arity(), 2);
        assert_eq!(lp.label, Label::Bound(0));
    }

    #[test]
    fn pop_empty() {
        let mut stack = ControlStack::default();
        assert!(stack.pop().is_err());
        assert!(stack.current().is_err());
        assert!(stack.outermost().is_err());
        assert_eq!(stack.len(), 0);
    }
}
