//! # Integrity Checker
//!
//! The whole-heap walk and the on-demand pointer validation. The walk
//! proves every invariant the tracker relies on: entry blocks carry
//! their magics and level stamps, every slot's own storage lies in a
//! tracked admin block of the matching level, chunks are disjoint and
//! address-sorted, fences verify and blanked chunks still carry the
//! free pattern.

use crate::chunk::ChunkManager;
use crate::config::{
    BLOCK_SIZE, ENTRY_BLOCK_MAGIC1, ENTRY_BLOCK_MAGIC2, ENTRY_BLOCK_MAGIC3,
    LARGEST_ALLOCATION, MAX_FILE_LENGTH, MAX_LEVEL, MAX_LINE_NUMBER,
    MIN_FILE_LENGTH,
};
use crate::error::{ChunkError, ChunkResult};
use crate::fence;
use crate::flags::{DebugFlags, SlotFlags};
use crate::heap::RawHeap;
use crate::map::empty_update;
use crate::slab::EntryBlock;
use crate::slot::{fwd, Origin, PointerInfo, Slot};

impl<H: RawHeap> ChunkManager<H> {
    /// Validate a slot that should describe live (USER, ADMIN or
    /// EXTERN) memory. With `user_pnt` given, also require that it is
    /// exactly the slot's user pointer: the loose address lookup
    /// tolerates the fence prefix, this check does not.
    pub(crate) unsafe fn check_used_slot(
        &self,
        slot: *const Slot,
        user_pnt: Option<*const u8>,
    ) -> ChunkResult<()> {
        let flags = (*slot).flags;
        if !flags.category_valid()
            || !flags.intersects(SlotFlags::USER | SlotFlags::ADMIN | SlotFlags::EXTERN)
        {
            return Err(ChunkError::SlotCorrupt);
        }

        let info = PointerInfo::from_slot(slot);

        if let Some(pnt) = user_pnt {
            if pnt != info.user_start as *const u8 {
                return Err(ChunkError::NotFound);
            }
        }

        if (*slot).user_size > LARGEST_ALLOCATION {
            return Err(ChunkError::BadSize);
        }

        // total size is a divided power of two or whole blocks
        let total = (*slot).total_size;
        if total <= BLOCK_SIZE / 2 {
            if !total.is_power_of_two() {
                return Err(ChunkError::BadSize);
            }
        } else if total % BLOCK_SIZE != 0 {
            return Err(ChunkError::BadSize);
        }

        if flags.contains(SlotFlags::VALLOC) {
            if info.user_start as usize % BLOCK_SIZE != 0 {
                return Err(ChunkError::NotOnBlock);
            }
            if total < BLOCK_SIZE {
                return Err(ChunkError::SlotCorrupt);
            }
        }

        if flags.contains(SlotFlags::FENCE) {
            fence::fence_verify(&info)?;
        }

        if let Origin::Source { file, line } = (*slot).origin {
            if line == 0 || line > MAX_LINE_NUMBER {
                return Err(ChunkError::BadLine);
            }
            if file.len() < MIN_FILE_LENGTH || file.len() > MAX_FILE_LENGTH {
                return Err(ChunkError::BadFile);
            }
        }

        #[cfg(feature = "seen_count")]
        {
            // a realloc can bump seen twice per iteration, never more
            if (*slot).extra.seen / 2 > self.iter {
                return Err(ChunkError::SlotCorrupt);
            }
        }

        Ok(())
    }

    /// Validate a slot on the free-size map or in quarantine.
    pub(crate) unsafe fn check_free_slot(&self, slot: *const Slot) -> ChunkResult<()> {
        let flags = (*slot).flags;
        if !flags.contains(SlotFlags::FREE) || !flags.category_valid() {
            return Err(ChunkError::SlotCorrupt);
        }

        if flags.contains(SlotFlags::BLANK) {
            fence::blank_verify(slot)?;
        }

        #[cfg(feature = "seen_count")]
        {
            if (*slot).extra.seen / 2 > self.iter {
                return Err(ChunkError::SlotCorrupt);
            }
        }

        Ok(())
    }

    /// Run extensive tests on the entire heap.
    pub fn heap_check(&mut self) -> ChunkResult<()> {
        self.tick();
        self.stats.heap_check_c += 1;

        if self.flags.contains(DebugFlags::LOG_TRANS) {
            crate::dinfo!("(Check) checking heap");
        }

        unsafe {
            self.check_admin_blocks()?;
            self.check_slot_lists()
        }
    }

    /// Pass 1: every entry block, on every level chain.
    unsafe fn check_admin_blocks(&mut self) -> ChunkResult<()> {
        for level in 0..MAX_LEVEL {
            let mut block = self.slab.blocks(level);
            while !block.is_null() {
                if !self.heap.contains(block as *const u8) {
                    crate::derror!(
                        "(Check) entry block {:#x} outside the heap",
                        block as usize
                    );
                    return Err(self.raise(ChunkError::AdminList));
                }

                if (*block).magic1 != ENTRY_BLOCK_MAGIC1
                    || (*block).magic2 != ENTRY_BLOCK_MAGIC2
                    || EntryBlock::magic3_ptr(block).read() != ENTRY_BLOCK_MAGIC3
                {
                    crate::derror!(
                        "(Check) entry block {:#x} lost its magics",
                        block as usize
                    );
                    return Err(self.raise(ChunkError::AdminList));
                }

                if (*block).level as usize != level {
                    crate::derror!(
                        "(Check) entry block {:#x} filed under level {} claims {}",
                        block as usize,
                        level,
                        (*block).level
                    );
                    return Err(self.raise(ChunkError::AdminList));
                }

                // the block must be tracked by a matching ADMIN slot
                let mut update = empty_update();
                let slot = self.addr_map.find_addr(block as *const u8, true, &mut update);
                if slot.is_null()
                    || !(*slot).flags.contains(SlotFlags::ADMIN)
                    || (*slot).mem != block as *mut u8
                    || (*slot).total_size != BLOCK_SIZE
                    || (*slot).level as usize != level
                {
                    crate::derror!(
                        "(Check) entry block {:#x} has no proper admin record",
                        block as usize
                    );
                    return Err(self.raise(ChunkError::AdminList));
                }

                block = (*block).next;
            }
        }
        Ok(())
    }

    /// Pass 2: the address map in order, then the free-size map, then
    /// the quarantine.
    unsafe fn check_slot_lists(&mut self) -> ChunkResult<()> {
        let lists = [
            self.addr_map.first(),
            self.free_map.first(),
            self.quarantine.head(),
        ];

        for (list_i, start) in lists.into_iter().enumerate() {
            let mut slot = start;
            let mut prev_end = 0usize;

            while !slot.is_null() {
                // the record itself must be slab storage in the heap
                if !self.heap.contains(slot as *const u8) {
                    crate::derror!("(Check) slot {:#x} outside the heap", slot as usize);
                    return Err(self.raise(ChunkError::AddressList));
                }

                // ... inside a stamped block of the slot's own level
                let mut update = empty_update();
                let block_slot =
                    self.addr_map.find_addr(slot as *const u8, false, &mut update);
                if block_slot.is_null() {
                    crate::derror!(
                        "(Check) slot {:#x} not inside any tracked block",
                        slot as usize
                    );
                    return Err(self.raise(ChunkError::AdminList));
                }
                let block = (*block_slot).mem as *mut EntryBlock;
                if (*block).magic1 != ENTRY_BLOCK_MAGIC1 {
                    crate::derror!(
                        "(Check) slot {:#x} sits in an unstamped block",
                        slot as usize
                    );
                    return Err(self.raise(ChunkError::AddressList));
                }
                if (*slot).level != (*block).level as u8 {
                    crate::derror!(
                        "(Check) slot {:#x} level {} in a level {} block",
                        slot as usize,
                        (*slot).level,
                        (*block).level
                    );
                    return Err(self.raise(ChunkError::AddressList));
                }

                // the chunk must lie inside the claimed heap
                let mem = (*slot).mem as usize;
                if !self.heap.contains((*slot).mem)
                    || mem + (*slot).total_size > self.heap.high_water() as usize
                {
                    crate::derror!(
                        "(Check) chunk {:#x}+{} outside the heap",
                        mem,
                        (*slot).total_size
                    );
                    return Err(self.raise(ChunkError::AddressList));
                }

                let result = if list_i == 0 {
                    // address order: disjoint and sorted
                    if mem < prev_end {
                        crate::derror!(
                            "(Check) chunk {:#x} overlaps the one ending at {:#x}",
                            mem,
                            prev_end
                        );
                        return Err(self.raise(ChunkError::AddressList));
                    }
                    prev_end = mem + (*slot).total_size;
                    self.check_used_slot(slot, None)
                } else {
                    self.check_free_slot(slot)
                };

                if let Err(err) = result {
                    let info = PointerInfo::from_slot(slot);
                    let prev = (*slot).origin;
                    return Err(self.fault(
                        err,
                        Origin::Unknown,
                        prev,
                        info.user_start,
                        Some(&info),
                        "heap-check",
                    ));
                }

                slot = fwd(slot, 0);
            }
        }

        Ok(())
    }

    /// Run extensive tests on one pointer. With `exact` any failure is
    /// a fault; a loose probe tolerates pointers outside the heap. A
    /// nonzero `min_bytes` additionally proves that many bytes fit
    /// between the pointer and the end of the user region.
    pub fn pnt_check(
        &mut self,
        user_pnt: *const u8,
        exact: bool,
        min_bytes: usize,
    ) -> ChunkResult<()> {
        self.tick();

        if self.flags.contains(DebugFlags::LOG_TRANS) {
            crate::dinfo!("(Check) checking pointer {:#x}", user_pnt as usize);
        }

        unsafe {
            let mut update = empty_update();
            let slot = self.addr_map.find_addr(user_pnt, false, &mut update);
            if slot.is_null() {
                if exact {
                    return Err(self.fault(
                        ChunkError::NotFound,
                        Origin::Unknown,
                        Origin::Unknown,
                        user_pnt,
                        None,
                        "pointer-check",
                    ));
                }
                // a loose probe of a foreign pointer is not an error
                return Ok(());
            }

            // loose probes accept interior pointers; exact ones insist
            // on the user pointer itself
            let want = if exact { Some(user_pnt) } else { None };
            if let Err(err) = self.check_used_slot(slot, want) {
                let info = PointerInfo::from_slot(slot);
                let prev = (*slot).origin;
                return Err(self.fault(
                    err,
                    Origin::Unknown,
                    prev,
                    user_pnt,
                    Some(&info),
                    "pointer-check",
                ));
            }

            if min_bytes > 0 {
                let info = PointerInfo::from_slot(slot);
                if user_pnt as usize + min_bytes
                    > info.user_start as usize + (*slot).user_size
                {
                    let prev = (*slot).origin;
                    return Err(self.fault(
                        ChunkError::WouldOverwrite,
                        Origin::Unknown,
                        prev,
                        user_pnt,
                        Some(&info),
                        "pointer-check",
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::AllocFunc;
    use crate::heap::ArenaHeap;

    fn manager(flags: DebugFlags) -> ChunkManager<ArenaHeap> {
        ChunkManager::with_arena(4 * 1024 * 1024, flags)
    }

    fn site(line: u32) -> Origin {
        Origin::Source { file: "check_test.rs", line }
    }

    #[test]
    fn clean_heap_passes() {
        let mut mgr = manager(DebugFlags::PARANOID);
        let mut ptrs = Vec::new();
        for i in 0..40 {
            let size = 16 + (i * 13) % 900;
            ptrs.push(mgr.malloc(site(100 + i as u32), size, AllocFunc::Malloc, 0).unwrap());
        }
        mgr.heap_check().unwrap();
        for p in ptrs {
            mgr.free(site(200), p, AllocFunc::Free).unwrap();
        }
        mgr.heap_check().unwrap();
        assert!(mgr.stats().heap_check_c >= 2);
    }

    #[test]
    fn smashed_entry_block_magic_is_admin_fault() {
        let mut mgr = manager(DebugFlags::empty());
        let _ = mgr.malloc(site(1), 24, AllocFunc::Malloc, 0).unwrap();

        // find any slab chain and ruin its header
        let block = (0..MAX_LEVEL)
            .map(|l| mgr.slab.blocks(l))
            .find(|b| !b.is_null())
            .unwrap();
        unsafe {
            let saved = (*block).magic1;
            (*block).magic1 = 0;
            assert_eq!(mgr.heap_check().unwrap_err(), ChunkError::AdminList);
            (*block).magic1 = saved;
            mgr.heap_check().unwrap();
        }
    }

    #[test]
    fn fence_damage_fails_the_walk() {
        let mut mgr = manager(DebugFlags::CHECK_FENCE);
        let p = mgr.malloc(site(2), 20, AllocFunc::Malloc, 0).unwrap();
        mgr.heap_check().unwrap();

        unsafe { *p.add(20) = 0x77 };
        let err = mgr.heap_check().unwrap_err();
        assert_eq!(err, ChunkError::OverFence);
    }

    #[test]
    fn stale_write_into_freed_chunk_fails_the_walk() {
        let mut mgr = manager(DebugFlags::PARANOID);
        let p = mgr.malloc(site(3), 64, AllocFunc::Malloc, 0).unwrap();
        mgr.free(site(4), p, AllocFunc::Free).unwrap();
        mgr.heap_check().unwrap();

        unsafe { *p = 0xab };
        assert_eq!(mgr.heap_check().unwrap_err(), ChunkError::FreeNonBlank);
    }

    #[test]
    fn pnt_check_bounds_widths() {
        let mut mgr = manager(DebugFlags::CHECK_FENCE);
        let p = mgr.malloc(site(5), 10, AllocFunc::Malloc, 0).unwrap();

        mgr.pnt_check(p, true, 10).unwrap();
        assert_eq!(
            mgr.pnt_check(p, true, 11).unwrap_err(),
            ChunkError::WouldOverwrite
        );

        // an interior pointer narrows the room
        mgr.pnt_check(unsafe { p.add(4) }, false, 6).unwrap();
        assert_eq!(
            mgr.pnt_check(unsafe { p.add(4) }, false, 7).unwrap_err(),
            ChunkError::WouldOverwrite
        );

        // loose probes of foreign pointers are tolerated
        let stack_byte = 0u8;
        mgr.pnt_check(&stack_byte, false, 0).unwrap();
    }

    #[test]
    fn verify_dispatches_on_null() {
        let mut mgr = manager(DebugFlags::CHECK_FENCE);
        let p = mgr.malloc(site(6), 16, AllocFunc::Malloc, 0).unwrap();
        mgr.verify(core::ptr::null()).unwrap();
        mgr.verify(p).unwrap();
    }
}
