// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address spaces: mapping, protection, duplication, fault resolution
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace, Protection
//! DEPENDS_ON: mm::frame_table, mm::translation, frame-allocator collaborator
//! INVARIANTS: heap and scratch state have their own locks; the page-fault
//!             path never holds the structural lock while resolving; COW
//!             frames are copied at most once per write fault

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;
use spin::Mutex;

use super::descriptor::{DescFlags, PageDesc};
use super::frame::{FrameAllocator, FrameRef};
use super::frame_table::FrameTable;
use super::pageable::{Pageable, PageableError};
use super::translation::{self, HwFlags, TranslationCache};
use super::{FaultError, FaultInfo, MmError, PAGE_SIZE, USER_TOP};
use crate::types::Asid;

/// Descriptor-level protection classes `protect` can apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
}

struct HeapState {
    floor: usize,
    top: usize,
}

struct ScratchPool {
    free: Vec<FrameRef>,
    outstanding: usize,
    capacity: usize,
}

/// One task's virtual address space.
///
/// Owns the per-page descriptor table, the model of currently installed
/// hardware translations (tagged with this space's ASID), the heap cursor,
/// and a small pool of quasi-visible scratch pages for short-lived
/// kernel-to-user copies.
pub struct AddressSpace {
    table: FrameTable,
    hw: Mutex<TranslationCache>,
    heap: Mutex<HeapState>,
    scratch: Mutex<ScratchPool>,
    alloc: Arc<dyn FrameAllocator>,
}

impl AddressSpace {
    pub fn new(alloc: Arc<dyn FrameAllocator>) -> Result<Arc<Self>, MmError> {
        let asid = translation::alloc_asid().ok_or(MmError::AsidExhausted)?;
        Ok(Arc::new(Self {
            table: FrameTable::new(),
            hw: Mutex::new(TranslationCache::new(asid)),
            heap: Mutex::new(HeapState { floor: 0, top: 0 }),
            scratch: Mutex::new(ScratchPool {
                free: Vec::new(),
                outstanding: 0,
                capacity: crate::cmdline::get().scratch_pool_pages,
            }),
            alloc,
        }))
    }

    pub fn asid(&self) -> Asid {
        self.hw.lock().asid()
    }

    /// Installs a duplicate of `desc` across `[start, start + len)`.
    ///
    /// With `start` unset a first-fit window is chosen. Returns the base
    /// address of the installed range; `NoSpace` if the range overlaps an
    /// existing mapping or no window of the requested length exists.
    pub fn insert(
        &self,
        desc: PageDesc,
        start: Option<usize>,
        len: usize,
    ) -> Result<usize, MmError> {
        let pages = pages_of(len)?;
        let vpn = match start {
            Some(addr) => {
                if addr % PAGE_SIZE != 0 {
                    return Err(MmError::Unaligned);
                }
                if addr >= USER_TOP || addr.checked_add(len).map_or(true, |e| e > USER_TOP) {
                    return Err(MmError::OutOfRange);
                }
                addr / PAGE_SIZE
            }
            None => self.table.find_unmapped(pages).ok_or(MmError::NoSpace)?,
        };
        self.table.insert_range(&desc, vpn, pages)?;
        Ok(vpn * PAGE_SIZE)
    }

    /// Unmaps `[start, start + len)`, releasing frame ownership and backing
    /// references and shooting down every cached translation (scratch
    /// aliases included) in the range. Pages outside the range are
    /// untouched.
    pub fn remove(&self, start: usize, len: usize) -> Result<(), MmError> {
        let pages = pages_of(len)?;
        if start % PAGE_SIZE != 0 {
            return Err(MmError::Unaligned);
        }
        let vpn = start / PAGE_SIZE;
        for slot in self.table.remove_range(vpn, pages) {
            slot.lock().clear();
        }
        self.hw.lock().invalidate_range(vpn, pages);
        Ok(())
    }

    /// Applies `prot` to every mapped page in the range. Narrowing to
    /// read-only invalidates the affected cached translations so no stale
    /// writable mapping survives.
    pub fn protect(&self, start: usize, len: usize, prot: Protection) -> Result<(), MmError> {
        let pages = pages_of(len)?;
        if start % PAGE_SIZE != 0 {
            return Err(MmError::Unaligned);
        }
        let vpn = start / PAGE_SIZE;
        let mut narrowed = Vec::new();
        for (page, slot) in self.table.range(vpn, pages) {
            let mut desc = slot.lock();
            if !desc.is_mapped() {
                continue;
            }
            match prot {
                Protection::ReadOnly => {
                    if desc.flags.contains(DescFlags::WRITE) {
                        desc.flags.remove(DescFlags::WRITE);
                        narrowed.push(page);
                    }
                }
                Protection::ReadWrite => {
                    desc.flags.insert(DescFlags::WRITE);
                }
            }
        }
        if !narrowed.is_empty() {
            let mut hw = self.hw.lock();
            for page in narrowed {
                hw.invalidate(page);
            }
        }
        Ok(())
    }

    /// Duplicates this space for fork-style task creation: every mapped
    /// page is shared copy-on-write (or plainly shared when marked
    /// `SHARED`). The translation cache and scratch pool are not copied;
    /// the heap cursor is.
    pub fn copy(&self) -> Result<Arc<Self>, MmError> {
        let child = Self::new(self.alloc.clone())?;
        {
            let parent_heap = self.heap.lock();
            let mut child_heap = child.heap.lock();
            child_heap.floor = parent_heap.floor;
            child_heap.top = parent_heap.top;
        }
        let mut downgraded = Vec::new();
        for (vpn, slot) in self.table.snapshot() {
            let mut desc = slot.lock();
            if !desc.is_mapped() {
                continue;
            }
            if desc.frame.is_some() && !desc.flags.contains(DescFlags::SHARED) {
                if !desc.flags.contains(DescFlags::COW) {
                    desc.flags.insert(DescFlags::COW);
                    downgraded.push(vpn);
                }
            }
            let twin = desc.dup();
            child.table.adopt(vpn, Arc::new(Mutex::new(twin)));
        }
        if !downgraded.is_empty() {
            // The parent may still hold writable translations for pages
            // that just became COW; force it back through the resolver.
            let mut hw = self.hw.lock();
            for vpn in downgraded {
                hw.invalidate(vpn);
            }
        }
        Ok(child)
    }

    /// Resolves a fault at `va`, or reports it unresolvable so the caller
    /// can deliver a fault signal. See the dispatch layer for the
    /// secret-region precedence rule; by the time this runs, `va` is an
    /// ordinary user address.
    pub fn pagefault(&self, va: usize, info: FaultInfo) -> Result<(), FaultError> {
        if va >= USER_TOP {
            return Err(FaultError::Unresolved);
        }
        let vpn = va / PAGE_SIZE;
        let slot = self.table.slot(vpn).ok_or(FaultError::Unresolved)?;
        let mut desc = slot.lock();
        if !desc.is_mapped() {
            return Err(FaultError::Unresolved);
        }
        let write = info.is_write();
        if write && !desc.flags.contains(DescFlags::WRITE) {
            return Err(FaultError::Unresolved);
        }
        let frame = self.ensure_frame(&mut desc, va, write)?;
        self.install(vpn, &desc, frame, write);
        Ok(())
    }

    /// Kernel-accessible pointer to the byte backing `va`, faulting the
    /// page in as a read access if needed. The pointer is only valid
    /// within the returned page.
    pub fn pagelookup(&self, va: usize) -> Option<NonNull<u8>> {
        if va >= USER_TOP {
            return None;
        }
        let vpn = va / PAGE_SIZE;
        let slot = self.table.slot(vpn)?;
        let mut desc = slot.lock();
        if !desc.is_mapped() {
            return None;
        }
        let frame = self.ensure_frame(&mut desc, va, false).ok()?;
        self.install(vpn, &desc, frame.clone(), false);
        NonNull::new(unsafe { frame.as_ptr().add(va % PAGE_SIZE) })
    }

    /// Backing object and logical page index for `va`, or `None` for
    /// anonymous or unmapped memory.
    pub fn lookup_pageable(&self, va: usize) -> Option<(Arc<dyn Pageable>, u64)> {
        let slot = self.table.slot(va / PAGE_SIZE)?;
        let desc = slot.lock();
        let backing = desc.backing.clone()?;
        let idx = desc.backing_page(va);
        Some((backing, idx))
    }

    /// Sets the heap floor; called once when the task image is laid out.
    pub fn init_heap(&self, base: usize) {
        let mut heap = self.heap.lock();
        heap.floor = base;
        heap.top = base;
    }

    /// Grows or shrinks the heap by `delta` bytes; returns the previous
    /// top. Shrinking below the heap floor is an error.
    pub fn sbrk(&self, delta: isize) -> Result<usize, MmError> {
        let mut heap = self.heap.lock();
        let old = heap.top;
        let new_top = if delta >= 0 {
            old.checked_add(delta as usize).ok_or(MmError::OutOfRange)?
        } else {
            old.checked_sub(delta.unsigned_abs()).ok_or(MmError::BadBrk)?
        };
        self.adjust_heap(&mut heap, new_top)?;
        Ok(old)
    }

    /// Moves the heap top to `new_top`; returns the resulting top.
    pub fn brk(&self, new_top: usize) -> Result<usize, MmError> {
        let mut heap = self.heap.lock();
        self.adjust_heap(&mut heap, new_top)?;
        Ok(new_top)
    }

    fn adjust_heap(&self, heap: &mut HeapState, new_top: usize) -> Result<(), MmError> {
        if new_top < heap.floor {
            return Err(MmError::BadBrk);
        }
        if new_top > USER_TOP {
            return Err(MmError::OutOfRange);
        }
        let old_edge = page_up(heap.top);
        let new_edge = page_up(new_top);
        if new_edge > old_edge {
            self.table
                .insert_range(&PageDesc::anon(), old_edge, new_edge - old_edge)?;
        } else if new_edge < old_edge {
            for slot in self.table.remove_range(new_edge, old_edge - new_edge) {
                slot.lock().clear();
            }
            self.hw.lock().invalidate_range(new_edge, old_edge - new_edge);
        }
        heap.top = new_top;
        Ok(())
    }

    /// Carefully reads up to `dst.len()` bytes from `src`, stopping at the
    /// first unmapped or unmaterialized page. Never faults anything in and
    /// never blocks on a contended page lock; diagnostics only.
    pub fn safe_read(&self, dst: &mut [u8], src: usize) -> usize {
        let mut done = 0;
        let mut va = src;
        while done < dst.len() {
            if va >= USER_TOP {
                break;
            }
            let offset = va % PAGE_SIZE;
            let chunk = usize::min(PAGE_SIZE - offset, dst.len() - done);
            let Some(slot) = self.table.slot(va / PAGE_SIZE) else { break };
            let Some(desc) = slot.try_lock() else { break };
            match (&desc.frame, desc.is_mapped()) {
                (Some(frame), true) => frame.read(offset, &mut dst[done..done + chunk]),
                _ => break,
            }
            done += chunk;
            va += chunk;
        }
        done
    }

    /// Carefully writes up to `src.len()` bytes at `dst`, stopping at the
    /// first page that is unmapped, unmaterialized, read-only, or still
    /// copy-on-write (a careless write there would corrupt the sharer).
    pub fn safe_write(&self, dst: usize, src: &[u8]) -> usize {
        let mut written = 0;
        let mut va = dst;
        while written < src.len() {
            if va >= USER_TOP {
                break;
            }
            let offset = va % PAGE_SIZE;
            let chunk = usize::min(PAGE_SIZE - offset, src.len() - written);
            let Some(slot) = self.table.slot(va / PAGE_SIZE) else { break };
            let Some(desc) = slot.try_lock() else { break };
            let writable = desc.is_mapped()
                && desc.flags.contains(DescFlags::WRITE)
                && !desc.flags.contains(DescFlags::COW);
            match (&desc.frame, writable) {
                (Some(frame), true) => frame.write(offset, &src[written..written + chunk]),
                _ => break,
            }
            written += chunk;
            va += chunk;
        }
        written
    }

    /// Copies `bytes` to `va` in this space, materializing pages as
    /// needed. This is the kernel-side population path (`exec` image
    /// layout, argument blocks): it honors copy-on-write but not the
    /// user-visible write protection.
    pub fn copyout(&self, va: usize, bytes: &[u8]) -> Result<(), FaultError> {
        let mut done = 0;
        while done < bytes.len() {
            let addr = va + done;
            if addr >= USER_TOP {
                return Err(FaultError::Unresolved);
            }
            let offset = addr % PAGE_SIZE;
            let chunk = usize::min(PAGE_SIZE - offset, bytes.len() - done);
            let vpn = addr / PAGE_SIZE;
            let slot = self.table.slot(vpn).ok_or(FaultError::Unresolved)?;
            let mut desc = slot.lock();
            if !desc.is_mapped() {
                return Err(FaultError::Unresolved);
            }
            let force_copy = desc.flags.contains(DescFlags::COW);
            let frame = self.ensure_frame(&mut desc, addr, force_copy)?;
            frame.write(offset, &bytes[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Takes a scratch page from the quasi-visible pool.
    pub fn qalloc(&self) -> Option<FrameRef> {
        let mut pool = self.scratch.lock();
        if let Some(frame) = pool.free.pop() {
            pool.outstanding += 1;
            return Some(frame);
        }
        if pool.outstanding >= pool.capacity {
            return None;
        }
        let frame = self.alloc.alloc_frame()?;
        pool.outstanding += 1;
        Some(frame)
    }

    /// Returns a scratch page to the pool.
    pub fn qfree(&self, frame: FrameRef) {
        let mut pool = self.scratch.lock();
        debug_assert!(pool.outstanding > 0);
        pool.outstanding = pool.outstanding.saturating_sub(1);
        pool.free.push(frame);
    }

    /// Installs a quasi-visible alias of `frame` at `va`. The alias lives
    /// only in the translation cache and is dropped by `remove` of the
    /// covering range.
    pub fn qinsert(&self, va: usize, frame: FrameRef) {
        self.hw.lock().install(
            va / PAGE_SIZE,
            frame,
            HwFlags::PRESENT | HwFlags::WRITE | HwFlags::SCRATCH,
        );
    }

    fn install(&self, vpn: usize, desc: &PageDesc, frame: FrameRef, write: bool) {
        let mut flags = HwFlags::PRESENT | HwFlags::USER;
        // Read faults install read-only even when the descriptor is
        // writable, so the first write (and every post-duplication write)
        // funnels back through the resolver.
        if write && desc.flags.contains(DescFlags::WRITE) && !desc.flags.contains(DescFlags::COW) {
            flags |= HwFlags::WRITE;
        }
        self.hw.lock().install(vpn, frame, flags);
    }

    fn ensure_frame(
        &self,
        desc: &mut PageDesc,
        va: usize,
        write: bool,
    ) -> Result<FrameRef, FaultError> {
        if write && desc.flags.contains(DescFlags::COW) {
            if let Some(shared) = desc.frame.clone() {
                let private = self.alloc.alloc_frame().ok_or(FaultError::OutOfFrames)?;
                private.copy_from(&shared);
                desc.frame = Some(private.clone());
                desc.flags.remove(DescFlags::COW);
                return Ok(private);
            }
            // A COW descriptor without a frame cannot happen through the
            // public operations; recover by demand-faulting below.
            desc.flags.remove(DescFlags::COW);
        }
        if let Some(frame) = &desc.frame {
            return Ok(frame.clone());
        }
        let frame = match &desc.backing {
            Some(backing) => backing.get_page(desc.backing_page(va)).map_err(|e| match e {
                PageableError::OutOfFrames => FaultError::OutOfFrames,
                PageableError::Io => FaultError::Unresolved,
            })?,
            None => self.alloc.alloc_frame().ok_or(FaultError::OutOfFrames)?,
        };
        desc.frame = Some(frame.clone());
        Ok(frame)
    }

    /// Currently installed hardware translation for the page at `vpn`.
    pub fn translation(&self, vpn: usize) -> Option<(FrameRef, HwFlags)> {
        self.hw.lock().lookup(vpn)
    }

    /// Shootdown count of this space's translation cache.
    pub fn translation_generation(&self) -> u64 {
        self.hw.lock().generation()
    }

    /// Drops every cached translation (remote shootdown request).
    pub fn invalidate_translations(&self) {
        self.hw.lock().invalidate_all();
    }

    pub fn mapped_pages(&self) -> usize {
        self.table.mapped_pages()
    }

    /// Node lock for `vpn`; exposed for the memory-pressure scanner and
    /// for tests that pin a page mid-operation.
    pub fn page_slot(&self, vpn: usize) -> Option<Arc<super::frame_table::PageSlot>> {
        self.table.slot(vpn)
    }

    /// Writes a human-readable map of this space to `w`.
    pub fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        let heap = self.heap.lock();
        writeln!(
            w,
            "address space asid={} mapped={} heap={:#x}..{:#x}",
            self.asid().0,
            self.table.mapped_pages(),
            heap.floor,
            heap.top
        )?;
        drop(heap);
        for (vpn, slot) in self.table.snapshot() {
            let desc = slot.lock();
            writeln!(
                w,
                "  {:#014x} {:?}{}",
                vpn * PAGE_SIZE,
                desc.flags,
                if desc.frame.is_some() { " +frame" } else { "" }
            )?;
        }
        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        translation::free_asid(self.hw.lock().asid());
    }
}

fn pages_of(len: usize) -> Result<usize, MmError> {
    if len == 0 || len % PAGE_SIZE != 0 {
        return Err(MmError::Unaligned);
    }
    Ok(len / PAGE_SIZE)
}

fn page_up(addr: usize) -> usize {
    addr.div_ceil(PAGE_SIZE)
}
