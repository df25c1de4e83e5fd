// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Reference-counted physical page frames and the allocator seam
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Frame, FrameRef, FrameAllocator, HeapFrames
//! DEPENDS_ON: kernel heap; failpoints (tests)
//! INVARIANTS: byte access to a frame is serialized by the owning
//!             descriptor's page lock or by exclusive ownership of the ref

extern crate alloc;

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::PAGE_SIZE;

/// One page-sized physical frame.
///
/// The frame does not know who maps it; sharing is expressed purely through
/// the [`FrameRef`] count. Copy-on-write duplicates therefore show up as a
/// strong count greater than one.
pub struct Frame {
    bytes: UnsafeCell<[u8; PAGE_SIZE]>,
}

// Byte access goes through the raw pointer below and is serialized by the
// page lock of whichever descriptor owns the mapping (or by exclusivity of a
// freshly allocated ref that no other core can observe yet).
unsafe impl Sync for Frame {}
unsafe impl Send for Frame {}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Frame").finish_non_exhaustive()
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        unsafe { (*self.bytes.get()) == (*other.bytes.get()) }
    }
}

/// Shared-ownership handle to a frame.
pub type FrameRef = Arc<Frame>;

impl Frame {
    fn new_zeroed() -> FrameRef {
        Arc::new(Frame { bytes: UnsafeCell::new([0u8; PAGE_SIZE]) })
    }

    /// Kernel-visible base pointer of the frame contents.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.bytes.get().cast()
    }

    /// Copies the full contents of `src` into this frame.
    pub fn copy_from(&self, src: &Frame) {
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr(), PAGE_SIZE);
        }
    }

    /// Writes `src` at `offset`. The range must stay inside the page.
    pub fn write(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= PAGE_SIZE);
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(offset), src.len());
        }
    }

    /// Reads into `dst` from `offset`. The range must stay inside the page.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= PAGE_SIZE);
        unsafe {
            core::ptr::copy_nonoverlapping(self.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }
}

/// Physical-frame allocator collaborator.
///
/// The buddy/slab machinery behind this seam lives elsewhere; this core only
/// ever asks for one zero-filled page at a time and reports exhaustion as a
/// fault-path failure.
pub trait FrameAllocator: Send + Sync {
    /// Hands out a zero-filled frame, or `None` when exhausted.
    fn alloc_frame(&self) -> Option<FrameRef>;
}

/// Heap-backed allocator used for bring-up and host testing.
pub struct HeapFrames {
    allocated: AtomicUsize,
    limit: Option<usize>,
}

impl HeapFrames {
    pub const fn new() -> Self {
        Self { allocated: AtomicUsize::new(0), limit: None }
    }

    /// Allocator that fails after `limit` frames, for exhaustion tests.
    pub const fn with_limit(limit: usize) -> Self {
        Self { allocated: AtomicUsize::new(0), limit: Some(limit) }
    }

    /// Cumulative number of frames handed out.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }
}

impl Default for HeapFrames {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for HeapFrames {
    fn alloc_frame(&self) -> Option<FrameRef> {
        #[cfg(feature = "failpoints")]
        if super::failpoints::frame_alloc_denied() {
            return None;
        }
        let n = self.allocated.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.limit {
            if n >= limit {
                self.allocated.fetch_sub(1, Ordering::SeqCst);
                return None;
            }
        }
        Some(Frame::new_zeroed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_start_zeroed() {
        let alloc = HeapFrames::new();
        let frame = alloc.alloc_frame().unwrap();
        let mut buf = [0xffu8; 16];
        frame.read(0, &mut buf);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn write_read_roundtrip() {
        let alloc = HeapFrames::new();
        let frame = alloc.alloc_frame().unwrap();
        frame.write(100, b"axon");
        let mut buf = [0u8; 4];
        frame.read(100, &mut buf);
        assert_eq!(&buf, b"axon");
    }

    #[test]
    fn limited_allocator_reports_exhaustion() {
        let alloc = HeapFrames::with_limit(2);
        assert!(alloc.alloc_frame().is_some());
        assert!(alloc.alloc_frame().is_some());
        assert!(alloc.alloc_frame().is_none());
        assert_eq!(alloc.allocated(), 2);
    }
}
