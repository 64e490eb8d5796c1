//! # Metadata Slab Pool
//!
//! Tracking slots are allocated out of dedicated basic blocks, one
//! chain of blocks per level, so the tracker never allocates through
//! itself. A refill is the delicate part: carving a fresh block may
//! require up to three slots from the block that was just carved (one
//! for the block's own ADMIN record, one for any EXTERN region the raw
//! heap claimed on the side, and the one the caller asked for), all
//! without recursing.

use crate::config::{
    align_up, BLOCK_SIZE, ENTRY_BLOCK_MAGIC1, ENTRY_BLOCK_MAGIC2,
    ENTRY_BLOCK_MAGIC3, MAX_LEVEL,
};
use crate::error::{ChunkError, ChunkResult};
use crate::flags::{DebugFlags, SlotFlags};
use crate::heap::RawHeap;
use crate::map::SkipMap;
use crate::slot::{fwd, reset, set_fwd, Slot};
use crate::stats::Stats;
use core::mem::size_of;
use core::ptr;

/// Header of a slab block. The run of slots starts after the header
/// (aligned for `Slot`) and the third magic sits in the last word of
/// the block.
#[repr(C)]
pub struct EntryBlock {
    pub magic1: u32,
    pub level: u32,
    pub magic2: u32,
    pub next: *mut EntryBlock,
}

impl EntryBlock {
    /// Offset of the first slot inside a block.
    pub const fn first_slot_offset() -> usize {
        align_up(size_of::<EntryBlock>(), Slot::ALIGN)
    }

    /// Address of the trailer magic of `block`.
    ///
    /// # Safety
    /// `block` must point at a full basic block.
    pub unsafe fn magic3_ptr(block: *mut EntryBlock) -> *mut u32 {
        (block as *mut u8).add(BLOCK_SIZE - size_of::<u32>()).cast()
    }
}

/// Per-level slot free lists plus the chains of blocks backing them.
pub struct SlabPool {
    free_slots: [*mut Slot; MAX_LEVEL],
    blocks: [*mut EntryBlock; MAX_LEVEL],
    rng: u64,
}

impl SlabPool {
    pub fn new() -> SlabPool {
        SlabPool {
            free_slots: [ptr::null_mut(); MAX_LEVEL],
            blocks: [ptr::null_mut(); MAX_LEVEL],
            rng: 0x9e37_79b9_7f4a_7c15,
        }
    }

    /// Head of the block chain for one level; heap-check walks these.
    pub fn blocks(&self, level: usize) -> *mut EntryBlock {
        self.blocks[level]
    }

    fn next_rand(&mut self) -> u64 {
        // xorshift64; anything with a fair low bit does
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        x
    }

    /// Draw a level from the geometric distribution: keep flipping a
    /// fair bit, count the run of ones, cap below MAX_LEVEL.
    pub fn random_level(&mut self) -> usize {
        let mut level = 0;
        while level < MAX_LEVEL - 1 {
            if self.next_rand() & 1 == 0 {
                break;
            }
            level += 1;
        }
        level
    }

    /// Pop a raw slot off one level's free list; null when empty.
    unsafe fn pop(&mut self, level: usize) -> *mut Slot {
        let slot = self.free_slots[level];
        if !slot.is_null() {
            self.free_slots[level] = fwd(slot, 0);
        }
        slot
    }

    /// Return a slot to the free list of its level. The caller must
    /// have unlinked it from every map first.
    ///
    /// # Safety
    /// `slot` must be live and on no other list.
    pub unsafe fn release(&mut self, slot: *mut Slot) {
        let level = (*slot).level as usize;
        reset(slot, level);
        set_fwd(slot, 0, self.free_slots[level]);
        self.free_slots[level] = slot;
    }

    /// Stamp a fresh block with its magics and carve it into slots of
    /// `level`, pushing all of them onto the free list.
    ///
    /// # Safety
    /// `mem` must be a zeroed basic block owned by the pool.
    unsafe fn carve(&mut self, mem: *mut u8, level: usize) {
        let block = mem as *mut EntryBlock;
        (*block).magic1 = ENTRY_BLOCK_MAGIC1;
        (*block).level = level as u32;
        (*block).magic2 = ENTRY_BLOCK_MAGIC2;

        (*block).next = self.blocks[level];
        self.blocks[level] = block;

        EntryBlock::magic3_ptr(block).write(ENTRY_BLOCK_MAGIC3);

        let slot_size = Slot::size_for_level(level);
        let magic3 = EntryBlock::magic3_ptr(block) as usize;
        let mut p = mem.add(EntryBlock::first_slot_offset());
        while (p as usize) + slot_size < magic3 {
            let slot = p as *mut Slot;
            (*slot).level = level as u8;
            set_fwd(slot, 0, self.free_slots[level]);
            self.free_slots[level] = slot;
            p = p.add(slot_size);
        }
    }

    /// Hand out a cleared slot of a randomly drawn level, refilling the
    /// level's slab from the raw heap when the free list is dry.
    ///
    /// A refill inserts the new block's ADMIN record (and an EXTERN
    /// record if the heap claimed blocks on the side) into the address
    /// map before the caller's slot is returned; doing it properly
    /// would recurse into this very function.
    ///
    /// # Safety
    /// The maps reachable from `addr_map` must be consistent.
    pub unsafe fn acquire<H: RawHeap>(
        &mut self,
        heap: &mut H,
        addr_map: &mut SkipMap,
        stats: &mut Stats,
        flags: DebugFlags,
    ) -> ChunkResult<*mut Slot> {
        let level = self.random_level();

        let slot = self.pop(level);
        if !slot.is_null() {
            reset(slot, level);
            return Ok(slot);
        }

        if flags.contains(DebugFlags::LOG_ADMIN) {
            crate::ddebug!("(Slab) need a block of slots for level {}", level);
        }

        // refill this level from the raw heap
        let got = heap.alloc(BLOCK_SIZE)?;
        ptr::write_bytes(got.mem, 0, BLOCK_SIZE);
        stats.admin_block_c += 1;
        self.carve(got.mem, level);

        // the new block's own tracking record
        let admin = self.pop(level);
        if admin.is_null() {
            crate::derror!("(Slab) refill produced no slots for level {}", level);
            return Err(ChunkError::AdminList);
        }
        reset(admin, level);
        (*admin).flags = SlotFlags::ADMIN;
        (*admin).mem = got.mem;
        (*admin).total_size = BLOCK_SIZE;
        addr_map.insert(admin)?;

        // blocks the raw heap claimed implicitly while growing
        if got.extern_blocks > 0 {
            let ext = self.pop(level);
            if ext.is_null() {
                crate::derror!("(Slab) refill produced no slots for level {}", level);
                return Err(ChunkError::AdminList);
            }
            reset(ext, level);
            (*ext).flags = SlotFlags::EXTERN;
            (*ext).mem = got.extern_mem;
            (*ext).total_size = got.extern_blocks * BLOCK_SIZE;
            addr_map.insert(ext)?;
            stats.extern_block_c += got.extern_blocks as u64;
        }

        // and finally the one the caller came for
        let slot = self.pop(level);
        if slot.is_null() {
            crate::derror!("(Slab) refill produced no slots for level {}", level);
            return Err(ChunkError::AdminList);
        }
        reset(slot, level);
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ArenaHeap;
    use crate::map::{empty_update, MapOrder};

    fn rig() -> (SlabPool, ArenaHeap, SkipMap, Stats) {
        (
            SlabPool::new(),
            ArenaHeap::new(64 * BLOCK_SIZE),
            SkipMap::new(MapOrder::ByAddress),
            Stats::default(),
        )
    }

    #[test]
    fn levels_follow_a_geometric_shape() {
        let mut pool = SlabPool::new();
        let mut counts = [0usize; MAX_LEVEL];
        for _ in 0..4096 {
            counts[pool.random_level()] += 1;
        }
        // level 0 dominates, and nothing escapes the cap
        assert!(counts[0] > 4096 / 3);
        assert!(counts[0] > counts[1]);
        assert_eq!(counts.iter().sum::<usize>(), 4096);
    }

    #[test]
    fn refill_tracks_its_own_block() {
        let (mut pool, mut heap, mut addr_map, mut stats) = rig();
        unsafe {
            let slot = pool
                .acquire(&mut heap, &mut addr_map, &mut stats, DebugFlags::empty())
                .unwrap();
            assert!(!slot.is_null());
            assert_eq!((*slot).flags, SlotFlags::empty());
            assert_eq!(stats.admin_block_c, 1);

            // exactly one admin record went into the address map
            let mut update = empty_update();
            let admin = addr_map.find_addr(heap.base(), true, &mut update);
            assert!(!admin.is_null());
            assert!((*admin).flags.contains(SlotFlags::ADMIN));
            assert_eq!((*admin).total_size, BLOCK_SIZE);

            // the admin block is stamped
            let block = (*admin).mem as *mut EntryBlock;
            assert_eq!((*block).magic1, ENTRY_BLOCK_MAGIC1);
            assert_eq!((*block).magic2, ENTRY_BLOCK_MAGIC2);
            assert_eq!(EntryBlock::magic3_ptr(block).read(), ENTRY_BLOCK_MAGIC3);
            assert_eq!((*block).level as usize, (*slot).level as usize);
        }
    }

    #[test]
    fn refill_accounts_extern_blocks() {
        let (mut pool, mut heap, mut addr_map, mut stats) = rig();
        unsafe {
            // a foreign user moved the break before our refill
            heap.foreign_claim(2);
            let _ = pool
                .acquire(&mut heap, &mut addr_map, &mut stats, DebugFlags::empty())
                .unwrap();
            assert_eq!(stats.extern_block_c, 2);

            let mut update = empty_update();
            let ext = addr_map.find_addr(heap.base(), true, &mut update);
            assert!(!ext.is_null());
            assert!((*ext).flags.contains(SlotFlags::EXTERN));
            assert_eq!((*ext).total_size, 2 * BLOCK_SIZE);
        }
    }

    #[test]
    fn release_recycles_slots() {
        let (mut pool, mut heap, mut addr_map, mut stats) = rig();
        unsafe {
            let slot = pool
                .acquire(&mut heap, &mut addr_map, &mut stats, DebugFlags::empty())
                .unwrap();
            let level = (*slot).level as usize;
            pool.release(slot);

            // free list head of that level is the released slot
            assert_eq!(pool.free_slots[level], slot);
        }
    }
}
