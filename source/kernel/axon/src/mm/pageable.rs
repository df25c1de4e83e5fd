// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Backing-store capability consumed by the fault resolver
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Pageable, PageableError, SharedMemory, BufferObject
//! DEPENDS_ON: mm::frame (allocator seam)
//! INVARIANTS: get_page for the same index of a shared region returns the
//!             same frame for every mapper

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::frame::{FrameAllocator, FrameRef};
use super::PAGE_SIZE;

/// Why a backing object could not produce a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageableError {
    /// The frame allocator was exhausted while materializing the page.
    OutOfFrames,
    /// The object cannot produce this page (I/O failure, out of bounds).
    Io,
}

/// A backing store that can produce a physical frame for a logical page.
///
/// Implemented by the anonymous shared-memory region below and by the
/// file-system's inode pager; address spaces hold these only behind a
/// reference-counted handle.
pub trait Pageable: Send + Sync {
    fn get_page(&self, page_idx: u64) -> Result<FrameRef, PageableError>;
}

/// Anonymous memory shared between address spaces.
///
/// Pages materialize lazily and are retained so that every mapper observes
/// the same frames.
pub struct SharedMemory {
    alloc: Arc<dyn FrameAllocator>,
    pages: Mutex<Vec<Option<FrameRef>>>,
}

impl SharedMemory {
    pub fn new(pages: usize, alloc: Arc<dyn FrameAllocator>) -> Arc<Self> {
        let mut slots = Vec::with_capacity(pages);
        slots.resize(pages, None);
        Arc::new(Self { alloc, pages: Mutex::new(slots) })
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }
}

impl Pageable for SharedMemory {
    fn get_page(&self, page_idx: u64) -> Result<FrameRef, PageableError> {
        let mut pages = self.pages.lock();
        let slot = pages.get_mut(page_idx as usize).ok_or(PageableError::Io)?;
        if let Some(frame) = slot {
            return Ok(frame.clone());
        }
        let frame = self.alloc.alloc_frame().ok_or(PageableError::OutOfFrames)?;
        *slot = Some(frame.clone());
        Ok(frame)
    }
}

/// Read-only data mapped from a memory buffer.
///
/// Stands in for the inode pager at this layer: `exec` hands the loader's
/// image over as one of these. Each request copies the source bytes into a
/// fresh frame so mappers can take copy-on-write references independently.
pub struct BufferObject {
    alloc: Arc<dyn FrameAllocator>,
    data: Vec<u8>,
}

impl BufferObject {
    pub fn new(data: Vec<u8>, alloc: Arc<dyn FrameAllocator>) -> Arc<Self> {
        Arc::new(Self { alloc, data })
    }
}

impl Pageable for BufferObject {
    fn get_page(&self, page_idx: u64) -> Result<FrameRef, PageableError> {
        let start = (page_idx as usize).checked_mul(PAGE_SIZE).ok_or(PageableError::Io)?;
        if start >= self.data.len() {
            return Err(PageableError::Io);
        }
        let frame = self.alloc.alloc_frame().ok_or(PageableError::OutOfFrames)?;
        let end = usize::min(start + PAGE_SIZE, self.data.len());
        frame.write(0, &self.data[start..end]);
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::HeapFrames;

    #[test]
    fn shared_memory_hands_out_stable_frames() {
        let alloc = Arc::new(HeapFrames::new());
        let region = SharedMemory::new(2, alloc);
        let a = region.get_page(0).unwrap();
        let b = region.get_page(0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(region.get_page(2), Err(PageableError::Io));
    }

    #[test]
    fn buffer_object_copies_per_request() {
        let alloc = Arc::new(HeapFrames::new());
        let mut data = alloc::vec![0u8; PAGE_SIZE + 7];
        data[PAGE_SIZE] = 0x5a;
        let obj = BufferObject::new(data, alloc);
        let first = obj.get_page(1).unwrap();
        let second = obj.get_page(1).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        let mut byte = [0u8; 1];
        first.read(0, &mut byte);
        assert_eq!(byte[0], 0x5a);
        // The tail past the source data stays zero-filled.
        first.read(1, &mut byte);
        assert_eq!(byte[0], 0);
        assert_eq!(obj.get_page(2), Err(PageableError::Io));
    }
}
