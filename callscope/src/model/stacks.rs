//! # Interned Stack Store
//!
//! Millions of samples share a few thousand distinct call stacks. Every frame
//! array is therefore stored exactly once in a content-addressed
//! [`FrameArena`], and a [`Stack`] only holds the arena id of its frames plus
//! its context handle.
//!
//! ```text
//! raw frames [0x41, 0x17, 0x02] ──► FrameArena ──► FrameArrayId(5)
//!                                                       │
//!            Stack { frames: FrameArrayId(5), context } ◄┘
//!                          │
//!                          ▼  per-process map
//!                    StackHandle(12)
//! ```
//!
//! Two stacks are equal when their contexts are equal and they point at the
//! same arena entry. That comparison is only correct because every frame
//! array goes through [`FrameArena::intern`]: there is no way to build a
//! `FrameArrayId` for content that is not in the arena.
//!
//! # Performance
//!
//! - `intern()`: O(frames) hash + compare, allocation only for new content
//! - `StackTable::add()`: O(1) amortized after interning
//! - Scratch buffers are reused per stack length while a stack is assembled

use callscope_common::MAX_FRAME_NUMBER;
use serde::{Deserialize, Serialize};

use super::table::{FxHashMap, FxIndexSet};
use crate::domain::{ContextHandle, Handle, Pid, StackHandle};

// =============================================================================
// FRAME ARENA
// =============================================================================

/// Identity of an interned frame array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameArrayId(u32);

/// Content-addressed storage for frame-pointer arrays.
#[derive(Debug, Default)]
pub struct FrameArena {
    arrays: FxIndexSet<Box<[u64]>>,
}

impl FrameArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id of the stored array equal to `frames`, storing a copy
    /// first if no such array exists.
    ///
    /// # Panics
    /// Panics if more than `u32::MAX` distinct arrays are interned.
    pub fn intern(&mut self, frames: &[u64]) -> FrameArrayId {
        let offset = match self.arrays.get_index_of(frames) {
            Some(offset) => offset,
            None => self.arrays.insert_full(frames.into()).0,
        };
        FrameArrayId(u32::try_from(offset).expect("frame arena overflow"))
    }

    /// # Panics
    /// Panics if `id` was minted by another arena.
    #[must_use]
    pub fn frames(&self, id: FrameArrayId) -> &[u64] {
        match self.arrays.get_index(id.0 as usize) {
            Some(frames) => frames,
            None => panic!("frame array {} out of range ({} arrays)", id.0, self.arrays.len()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }
}

// =============================================================================
// STACK
// =============================================================================

/// A call stack: interned frames (innermost first) within one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stack {
    pub frames: FrameArrayId,
    pub context: ContextHandle,
}

// =============================================================================
// SCRATCH BUFFERS
// =============================================================================

/// Reusable buffers, one per stack length, filled while a stack is being
/// assembled and only copied into the arena if the content is new.
#[derive(Debug, Default)]
struct ScratchFrames {
    by_length: Vec<Vec<u64>>,
    oversized: Vec<u64>,
}

impl ScratchFrames {
    fn rent(&mut self, len: usize) -> &mut [u64] {
        if len > MAX_FRAME_NUMBER {
            self.oversized.clear();
            self.oversized.resize(len, 0);
            return &mut self.oversized;
        }

        if self.by_length.len() <= len {
            self.by_length.resize_with(len + 1, Vec::new);
        }

        let buffer = &mut self.by_length[len];
        if buffer.len() != len {
            buffer.resize(len, 0);
        }
        buffer
    }
}

// =============================================================================
// STACK TABLE
// =============================================================================

/// All stacks of a trace, deduplicated per process.
#[derive(Debug, Default)]
pub struct StackTable {
    arena: FrameArena,
    stacks: Vec<Stack>,
    per_process: FxHashMap<Pid, FxHashMap<Stack, StackHandle>>,
    scratch: ScratchFrames,
}

impl StackTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `frames` and return the handle of the stack `(frames, context)`
    /// in process `pid`.
    pub fn add(&mut self, pid: Pid, frames: &[u64], context: ContextHandle) -> StackHandle {
        let frames = self.arena.intern(frames);
        self.insert(pid, Stack { frames, context })
    }

    /// Assemble a stack of `frame_count` frames in a reused scratch buffer,
    /// letting `fill` write the frames, then intern it.
    ///
    /// Takes `&mut self`, so only one stack can be under construction at a
    /// time.
    pub fn add_with<F>(
        &mut self,
        pid: Pid,
        frame_count: usize,
        context: ContextHandle,
        fill: F,
    ) -> StackHandle
    where
        F: FnOnce(&mut [u64]),
    {
        let buffer = self.scratch.rent(frame_count);
        fill(buffer);
        let frames = self.arena.intern(buffer);
        self.insert(pid, Stack { frames, context })
    }

    fn insert(&mut self, pid: Pid, stack: Stack) -> StackHandle {
        let process_stacks = self.per_process.entry(pid).or_default();
        if let Some(&existing) = process_stacks.get(&stack) {
            return existing;
        }

        self.stacks.push(stack);
        let handle = StackHandle::from_offset(self.stacks.len() - 1);
        process_stacks.insert(stack, handle);
        handle
    }

    /// # Panics
    /// Panics on `StackHandle::NONE` or a handle from another table.
    #[must_use]
    pub fn find(&self, handle: StackHandle) -> &Stack {
        handle
            .offset()
            .and_then(|offset| self.stacks.get(offset))
            .unwrap_or_else(|| panic!("{handle} out of range ({} stacks)", self.stacks.len()))
    }

    /// Frames of `stack`, innermost first.
    #[must_use]
    pub fn frames(&self, stack: &Stack) -> &[u64] {
        self.arena.frames(stack.frames)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Number of distinct frame arrays.
    #[must_use]
    pub fn distinct_frame_arrays(&self) -> usize {
        self.arena.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_returns_same_id_for_equal_content() {
        let mut arena = FrameArena::new();
        let a = arena.intern(&[1, 2, 3]);
        let b = arena.intern(&[1, 2, 3]);
        let c = arena.intern(&[1, 2]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.frames(a), &[1, 2, 3]);
    }

    #[test]
    fn test_identical_stacks_share_handle_and_frames() {
        let mut table = StackTable::new();
        let ctx = ContextHandle(1);
        let first = table.add(Pid(1), &[0x10, 0x20, 0x30], ctx);
        let second = table.add(Pid(1), &[0x10, 0x20, 0x30], ctx);

        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(first).frames, table.find(second).frames);
    }

    #[test]
    fn test_same_frames_different_context_are_distinct_stacks() {
        let mut table = StackTable::new();
        let a = table.add(Pid(1), &[0x10, 0x20], ContextHandle(1));
        let b = table.add(Pid(1), &[0x10, 0x20], ContextHandle(2));

        assert_ne!(a, b);
        // Frame content is still stored once.
        assert_eq!(table.distinct_frame_arrays(), 1);
        assert_eq!(table.find(a).frames, table.find(b).frames);
    }

    #[test]
    fn test_add_with_scratch_buffer() {
        let mut table = StackTable::new();
        let ctx = ContextHandle(1);
        let via_scratch = table.add_with(Pid(3), 3, ctx, |buf| buf.copy_from_slice(&[7, 8, 9]));
        let direct = table.add(Pid(3), &[7, 8, 9], ctx);
        assert_eq!(via_scratch, direct);

        // A reused buffer of the same length must not leak old content.
        let other = table.add_with(Pid(3), 3, ctx, |buf| buf.copy_from_slice(&[1, 2, 3]));
        assert_ne!(other, direct);
        assert_eq!(table.frames(table.find(other)), &[1, 2, 3]);
    }

    #[test]
    fn test_oversized_stack() {
        let mut table = StackTable::new();
        let frames: Vec<u64> = (0..(MAX_FRAME_NUMBER as u64 + 10)).collect();
        let handle = table.add_with(Pid(1), frames.len(), ContextHandle(1), |buf| {
            buf.copy_from_slice(&frames);
        });
        assert_eq!(table.frames(table.find(handle)).len(), frames.len());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_find_none_panics() {
        let table = StackTable::new();
        let _ = table.find(StackHandle::NONE);
    }
}
