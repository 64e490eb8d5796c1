//! # Chunk Manager
//!
//! The allocation policy and the user-facing operations. Requests at or
//! below half a block are rounded to a power of two and serviced from
//! carved-up basic blocks; anything larger is rounded to whole blocks.
//! Every live chunk is filed in the address map, every reusable chunk in
//! the free-size map, and recently freed chunks dwell in the quarantine
//! in between.
//!
//! All state lives in one aggregate behind one lock (see `lib.rs`); no
//! method here suspends or re-enters.

use crate::config::{
    align_up, ALLOCATION_ALIGNMENT, BLOCK_SIZE, DUMP_SPACE, FENCE_BOTTOM_SIZE,
    FENCE_OVERHEAD, FENCE_TOP_SIZE, LARGEST_ALLOCATION, SMALLEST_DIVIDED,
};
use crate::error::{ChunkError, ChunkResult};
use crate::fence;
use crate::flags::{DebugFlags, SlotFlags};
use crate::heap::{ArenaHeap, RawHeap};
use crate::log::DumpBytes;
use crate::map::{empty_update, MapOrder, SkipMap, Update};
use crate::quarantine::Quarantine;
use crate::slab::SlabPool;
use crate::slot::{Origin, PntDesc, PointerInfo, Slot};
use crate::stats::{MemTable, Stats};
use core::ptr;

/// Which entry point a request came through. Decides zeroing semantics
/// and which call counter advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocFunc {
    Malloc,
    Calloc,
    New,
    Memalign,
    Valloc,
    Realloc,
    Recalloc,
    Free,
    Delete,
}

impl AllocFunc {
    /// calloc-family requests get zeroed memory instead of fill bytes.
    pub fn zeroed(self) -> bool {
        matches!(self, AllocFunc::Calloc | AllocFunc::Recalloc)
    }

    pub fn name(self) -> &'static str {
        match self {
            AllocFunc::Malloc => "malloc",
            AllocFunc::Calloc => "calloc",
            AllocFunc::New => "new",
            AllocFunc::Memalign => "memalign",
            AllocFunc::Valloc => "valloc",
            AllocFunc::Realloc => "realloc",
            AllocFunc::Recalloc => "recalloc",
            AllocFunc::Free => "free",
            AllocFunc::Delete => "delete",
        }
    }
}

/// What `examine` reports about a live pointer.
#[derive(Debug, Clone, Copy)]
pub struct PointerDetails {
    pub user_size: usize,
    pub total_size: usize,
    pub origin: Origin,
    pub use_iter: u64,
    /// Times the pointer was handled; None without the seen_count token.
    pub seen: Option<u64>,
    pub valloc: bool,
    pub fence: bool,
}

/// Called after a fault is recorded; may abort the process or return,
/// in which case the failing entry point returns its error sentinel.
pub type ErrorHandler = fn(ChunkError);

/// The chunk manager: one global arena of tracked chunks. Generic over
/// the raw-heap provider so tests can drive a private arena.
pub struct ChunkManager<H: RawHeap = ArenaHeap> {
    pub(crate) heap: H,
    pub(crate) flags: DebugFlags,
    pub(crate) memory_limit: usize,
    /// Advances on every user-visible operation; the clock behind the
    /// quarantine and the mark/diff reports.
    pub(crate) iter: u64,
    pub(crate) addr_map: SkipMap,
    pub(crate) free_map: SkipMap,
    pub(crate) slab: SlabPool,
    pub(crate) quarantine: Quarantine,
    pub(crate) stats: Stats,
    pub(crate) alloc_table: MemTable,
    pub(crate) changed_table: MemTable,
    pub(crate) last_error: Option<ChunkError>,
    pub(crate) error_handler: Option<ErrorHandler>,
    // the proper fence patterns are dumped once per run, on first fault
    pub(crate) dumped_bottom: bool,
    pub(crate) dumped_top: bool,
}

// Raw slot pointers all target the arena owned by `heap`; the external
// mutex in lib.rs serializes every entry.
unsafe impl<H: RawHeap + Send> Send for ChunkManager<H> {}

impl ChunkManager<ArenaHeap> {
    /// Manager over a private arena of `arena_bytes`.
    pub fn with_arena(arena_bytes: usize, flags: DebugFlags) -> Self {
        ChunkManager::new(ArenaHeap::new(arena_bytes), flags)
    }
}

impl<H: RawHeap> ChunkManager<H> {
    pub fn new(heap: H, flags: DebugFlags) -> Self {
        crate::dinfo!(
            "(Chunk) starting: block {} bytes, fences {}+{} bytes, flags {:?}",
            BLOCK_SIZE,
            FENCE_BOTTOM_SIZE,
            FENCE_TOP_SIZE,
            flags
        );
        ChunkManager {
            heap,
            flags,
            memory_limit: 0,
            iter: 0,
            addr_map: SkipMap::new(MapOrder::ByAddress),
            free_map: SkipMap::new(MapOrder::BySize),
            slab: SlabPool::new(),
            quarantine: Quarantine::new(),
            stats: Stats::default(),
            alloc_table: MemTable::new(),
            changed_table: MemTable::new(),
            last_error: None,
            error_handler: None,
            dumped_bottom: false,
            dumped_top: false,
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn flags(&self) -> DebugFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: DebugFlags) {
        self.flags = flags;
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    /// Cap on total given bytes; 0 disables the limit.
    pub fn set_memory_limit(&mut self, limit: usize) {
        self.memory_limit = limit;
    }

    pub fn set_error_handler(&mut self, handler: Option<ErrorHandler>) {
        self.error_handler = handler;
    }

    /// Snapshot of every counter, consistent under the lock.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn last_error(&self) -> Option<ChunkError> {
        self.last_error
    }

    pub fn iteration(&self) -> u64 {
        self.iter
    }

    pub fn heap(&self) -> &H {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut H {
        &mut self.heap
    }

    pub(crate) fn tick(&mut self) {
        self.iter += 1;
    }

    // =========================================================================
    // FAULT REPORTING
    // =========================================================================

    /// Record an error and give the handler its chance.
    pub(crate) fn raise(&mut self, err: ChunkError) -> ChunkError {
        self.last_error = Some(err);
        if let Some(handler) = self.error_handler {
            handler(err);
        }
        err
    }

    /// Full fault path: descriptive log line with current and previous
    /// attribution, optional dump of the offending bytes, then `raise`.
    pub(crate) fn fault(
        &mut self,
        err: ChunkError,
        now: Origin,
        prev: Origin,
        user_pnt: *const u8,
        info: Option<&PointerInfo>,
        where_: &str,
    ) -> ChunkError {
        if user_pnt.is_null() {
            crate::derror!(
                "{}: {}: from '{}' prev access '{}'",
                where_,
                err,
                now,
                prev
            );
        } else {
            crate::derror!(
                "{}: {}: pointer {:#x} from '{}' prev access '{}'",
                where_,
                err,
                user_pnt as usize,
                now,
                prev
            );
        }

        if self.flags.contains(DebugFlags::LOG_BAD_SPACE) {
            self.dump_bad_space(err, info);
        }

        self.raise(err)
    }

    /// Dump the bytes around an overwrite fault, and the proper fence
    /// pattern once per run for comparison.
    fn dump_bad_space(&mut self, err: ChunkError, info: Option<&PointerInfo>) {
        let info = match info {
            Some(i) => i,
            None => return,
        };
        let (dump_from, dump_len) = match err {
            ChunkError::UnderFence => {
                if !self.dumped_bottom {
                    crate::derror!(
                        "dump of proper fence-bottom bytes: '{}'",
                        DumpBytes(&fence::FENCE_BOTTOM)
                    );
                    self.dumped_bottom = true;
                }
                (info.fence_bottom, FENCE_BOTTOM_SIZE + DUMP_SPACE)
            }
            ChunkError::OverFence => {
                if !self.dumped_top {
                    crate::derror!(
                        "dump of proper fence-top bytes: '{}'",
                        DumpBytes(&fence::FENCE_TOP)
                    );
                    self.dumped_top = true;
                }
                (info.fence_top, FENCE_TOP_SIZE + DUMP_SPACE)
            }
            ChunkError::FreeNonBlank => (info.alloc_start, DUMP_SPACE),
            _ => return,
        };
        if dump_from.is_null() || dump_from as usize >= info.alloc_bounds as usize {
            return;
        }

        // clamp to the chunk and stay inside the heap
        let avail = info.alloc_bounds as usize - dump_from as usize;
        let len = dump_len.min(avail);
        if !self.heap.contains(dump_from) {
            crate::derror!("dump of {:#x} failed: not in heap", dump_from as usize);
            return;
        }
        let bytes = unsafe { core::slice::from_raw_parts(dump_from, len) };
        crate::derror!("dump of {:#x}: '{}'", dump_from as usize, DumpBytes(bytes));
    }

    // =========================================================================
    // SLOT AND MEMORY SUPPLY
    // =========================================================================

    /// One cleared tracking slot; refills the slab from the raw heap as
    /// a side effect when needed.
    unsafe fn get_slot(&mut self) -> ChunkResult<*mut Slot> {
        self.slab
            .acquire(&mut self.heap, &mut self.addr_map, &mut self.stats, self.flags)
    }

    /// Slot a fresh chunk and file it in the requested map.
    unsafe fn insert_address(
        &mut self,
        address: *mut u8,
        free: bool,
        total_size: usize,
    ) -> ChunkResult<*mut Slot> {
        let slot = match self.get_slot() {
            Ok(slot) => slot,
            Err(err) => return Err(self.raise(err)),
        };
        (*slot).flags = if free { SlotFlags::FREE } else { SlotFlags::USER };
        (*slot).mem = address;
        (*slot).total_size = total_size;

        if free {
            self.free_map.insert(slot).map_err(|e| self.raise(e))?;
        } else {
            self.addr_map.insert(slot).map_err(|e| self.raise(e))?;
        }
        Ok(slot)
    }

    /// Raw blocks from the heap, with any externally claimed region
    /// filed as an EXTERN slot so address lookups stay sound.
    unsafe fn allocate_memory(&mut self, size: usize) -> ChunkResult<*mut u8> {
        let got = self.heap.alloc(size).map_err(|e| self.raise(e))?;

        if got.extern_blocks > 0 {
            let slot =
                self.insert_address(got.extern_mem, false, got.extern_blocks * BLOCK_SIZE)?;
            (*slot).flags = SlotFlags::EXTERN;
            self.stats.extern_block_c += got.extern_blocks as u64;
        }

        Ok(got.mem)
    }

    /// Carve one basic block into equal power-of-two sub-chunks and put
    /// every piece on the free-size map.
    unsafe fn create_divided_chunks(&mut self, div_size: usize) -> ChunkResult<()> {
        let mem = self.allocate_memory(BLOCK_SIZE)?;
        self.stats.user_block_c += 1;

        let bounds = mem.add(BLOCK_SIZE - div_size);
        let mut p = mem;
        while p <= bounds {
            self.insert_address(p, true, div_size)?;
            self.stats.free_space_bytes += div_size as u64;
            p = p.add(div_size);
        }
        Ok(())
    }

    /// Pull the smallest sufficient chunk off the free-size map, after
    /// letting the quarantine release anything whose dwell expired.
    /// Returns null when nothing fits.
    unsafe fn use_free_memory(
        &mut self,
        size: usize,
        update: &mut Update,
    ) -> ChunkResult<*mut Slot> {
        self.quarantine
            .drain(self.iter, &mut self.free_map)
            .map_err(|e| self.raise(e))?;

        let slot = self.free_map.find_size(size, update).map_err(|e| self.raise(e))?;
        if slot.is_null() {
            return Ok(ptr::null_mut());
        }
        if (*slot).total_size < size {
            crate::derror!("(Chunk) free list returned a short chunk");
            return Err(self.raise(ChunkError::AddressList));
        }

        // a blanked chunk must still carry the free pattern end to end;
        // a stray write through a stale pointer surfaces right here
        if self.flags.contains(DebugFlags::CHECK_BLANK)
            && (*slot).flags.contains(SlotFlags::BLANK)
        {
            if let Err(err) = fence::blank_verify(slot) {
                let info = PointerInfo::from_slot(slot);
                let prev = (*slot).origin;
                return Err(self.fault(
                    err,
                    Origin::Unknown,
                    prev,
                    (*slot).mem,
                    Some(&info),
                    "reuse",
                ));
            }
        }

        self.free_map.remove(slot, update).map_err(|e| self.raise(e))?;
        (*slot).flags = SlotFlags::USER;
        self.addr_map.insert(slot).map_err(|e| self.raise(e))?;

        self.stats.free_space_bytes -= (*slot).total_size as u64;
        Ok(slot)
    }

    /// Divided-block path: round to a power of two, reuse or carve.
    unsafe fn get_divided_memory(&mut self, size: usize) -> ChunkResult<*mut Slot> {
        let need = size.max(SMALLEST_DIVIDED).next_power_of_two();
        let mut update = empty_update();

        let slot = self.use_free_memory(need, &mut update)?;
        if !slot.is_null() {
            return Ok(slot);
        }

        self.create_divided_chunks(need)?;

        // refill followed by successful reuse is the normal path; a
        // second miss means the maps are not telling the truth
        let slot = self.use_free_memory(need, &mut update)?;
        if slot.is_null() {
            crate::derror!("(Chunk) carved a block but found no free chunk");
            return Err(self.raise(ChunkError::AddressList));
        }
        Ok(slot)
    }

    /// Size routing: divided sub-allocation below half a block,
    /// whole-block allocation above.
    unsafe fn get_memory(&mut self, size: usize) -> ChunkResult<*mut Slot> {
        if self.flags.contains(DebugFlags::LOG_ADMIN) {
            crate::ddebug!("(Chunk) need {} bytes", size);
        }

        if self.memory_limit > 0
            && self.stats.alloc_cur_given + size as u64 > self.memory_limit as u64
        {
            crate::derror!(
                "(Chunk) {} bytes would break the {} byte limit",
                size,
                self.memory_limit
            );
            return Err(self.raise(ChunkError::OverLimit));
        }

        if size <= BLOCK_SIZE / 2 {
            return self.get_divided_memory(size);
        }

        let need = align_up(size, BLOCK_SIZE);
        let mut update = empty_update();

        let slot = self.use_free_memory(need, &mut update)?;
        if !slot.is_null() {
            return Ok(slot);
        }

        let mem = self.allocate_memory(need)?;
        self.stats.user_block_c += (need / BLOCK_SIZE) as u64;
        self.insert_address(mem, false, need)
    }

    // =========================================================================
    // LOOKUP
    // =========================================================================

    /// Find the USER slot owning `user_pnt`: loose address lookup (the
    /// base hides under the bottom fence), then the full used-slot
    /// validation including the exact user-start match.
    pub(crate) unsafe fn find_user_slot(
        &self,
        user_pnt: *const u8,
        update: &mut Update,
    ) -> ChunkResult<*mut Slot> {
        if user_pnt.is_null() {
            return Err(ChunkError::IsNull);
        }

        let slot = self.addr_map.find_addr(user_pnt, false, update);
        if slot.is_null() {
            return Err(ChunkError::NotFound);
        }

        self.check_used_slot(slot, Some(user_pnt))?;

        // only live user chunks may be operated on through user pointers
        if !(*slot).flags.contains(SlotFlags::USER) {
            return Err(ChunkError::NotFound);
        }

        Ok(slot)
    }

    // =========================================================================
    // USER OPERATIONS
    // =========================================================================

    /// Allocate `size` bytes. `alignment` 0 means natural alignment; a
    /// power of two up to the block size is honoured by rounding up to
    /// a page-aligned chunk.
    pub fn malloc(
        &mut self,
        origin: Origin,
        size: usize,
        func: AllocFunc,
        alignment: usize,
    ) -> ChunkResult<*mut u8> {
        self.tick();
        unsafe { self.malloc_inner(origin, size, func, alignment) }
    }

    pub(crate) unsafe fn malloc_inner(
        &mut self,
        origin: Origin,
        size: usize,
        func: AllocFunc,
        alignment: usize,
    ) -> ChunkResult<*mut u8> {
        // normalize the alignment request
        let mut alignment = alignment;
        if func == AllocFunc::Valloc && alignment == 0 {
            alignment = BLOCK_SIZE;
        }
        let mut valloc = false;
        if alignment > 0 {
            if !alignment.is_power_of_two() || alignment > BLOCK_SIZE {
                return Err(self.fault(
                    ChunkError::BadSize,
                    origin,
                    Origin::Unknown,
                    ptr::null(),
                    None,
                    "malloc",
                ));
            }
            if alignment > ALLOCATION_ALIGNMENT {
                // simplest faithful strategy: anything beyond natural
                // alignment becomes a block-aligned chunk
                valloc = true;
            }
        }

        match func {
            AllocFunc::Calloc => self.stats.func_calloc_c += 1,
            AllocFunc::Valloc => self.stats.func_valloc_c += 1,
            AllocFunc::Memalign => self.stats.func_memalign_c += 1,
            AllocFunc::New => self.stats.func_new_c += 1,
            AllocFunc::Realloc | AllocFunc::Recalloc => {
                // accounted by the realloc entry
            }
            _ => self.stats.func_malloc_c += 1,
        }

        #[cfg(not(feature = "alloc_zero_size"))]
        if size == 0 {
            crate::derror!("(Chunk) zero byte allocation request from '{}'", origin);
            return Err(self.fault(
                ChunkError::BadSize,
                origin,
                Origin::Unknown,
                ptr::null(),
                None,
                "malloc",
            ));
        }
        #[cfg(feature = "alloc_zero_size")]
        let size = size.max(1);

        if size > LARGEST_ALLOCATION {
            return Err(self.fault(
                ChunkError::TooBig,
                origin,
                Origin::Unknown,
                ptr::null(),
                None,
                "malloc",
            ));
        }

        let fence = self.flags.contains(DebugFlags::CHECK_FENCE);
        let mut needed = size;
        if fence {
            needed += FENCE_OVERHEAD;
            // a page-aligned request needs a whole extra block below the
            // user region just for the bottom fence
            if valloc {
                needed += BLOCK_SIZE;
            }
        } else if valloc && needed <= BLOCK_SIZE / 2 {
            // force the block path; those chunks are always block aligned
            needed = BLOCK_SIZE;
        }

        let slot = self.get_memory(needed)?;
        if fence {
            (*slot).flags.insert(SlotFlags::FENCE);
        }
        if valloc {
            (*slot).flags.insert(SlotFlags::VALLOC);
        }
        (*slot).user_size = size;

        self.stats.alloc_cur_given += (*slot).total_size as u64;
        self.stats.alloc_max_given =
            self.stats.alloc_max_given.max(self.stats.alloc_cur_given);

        let info = PointerInfo::from_slot(slot);
        fence::clear_alloc(&info, 0, func.zeroed(), self.flags);

        (*slot).origin = origin;
        (*slot).use_iter = self.iter;
        #[cfg(feature = "seen_count")]
        {
            (*slot).extra.seen += 1;
        }
        #[cfg(feature = "store_time")]
        {
            (*slot).extra.stamp = Some(std::time::SystemTime::now());
        }
        #[cfg(feature = "thread_id")]
        {
            (*slot).extra.thread = Some(std::thread::current().id());
        }

        if self.flags.contains(DebugFlags::LOG_TRANS) {
            crate::dinfo!(
                "*** {}: at '{}' for {} bytes, got '{}'",
                func.name(),
                origin,
                size,
                PntDesc::new(info.user_start, slot, self.flags)
            );
        }

        self.alloc_table.insert(&origin, size);

        self.stats.alloc_current += size as u64;
        self.stats.alloc_maximum = self.stats.alloc_maximum.max(self.stats.alloc_current);
        self.stats.alloc_total += size as u64;
        self.stats.alloc_one_max = self.stats.alloc_one_max.max(size as u64);

        self.stats.alloc_cur_pnts += 1;
        self.stats.alloc_max_pnts =
            self.stats.alloc_max_pnts.max(self.stats.alloc_cur_pnts);
        self.stats.alloc_tot_pnts += 1;

        Ok(info.user_start)
    }

    /// Release a user pointer back to the tracker.
    pub fn free(
        &mut self,
        origin: Origin,
        user_pnt: *mut u8,
        func: AllocFunc,
    ) -> ChunkResult<()> {
        self.tick();
        unsafe { self.free_inner(origin, user_pnt, func) }
    }

    pub(crate) unsafe fn free_inner(
        &mut self,
        origin: Origin,
        user_pnt: *mut u8,
        func: AllocFunc,
    ) -> ChunkResult<()> {
        match func {
            AllocFunc::Delete => self.stats.func_delete_c += 1,
            AllocFunc::Realloc | AllocFunc::Recalloc => {}
            _ => self.stats.func_free_c += 1,
        }

        if user_pnt.is_null() {
            if self.flags.contains(DebugFlags::ERROR_FREE_NULL) {
                return Err(self.fault(
                    ChunkError::IsNull,
                    origin,
                    Origin::Unknown,
                    ptr::null(),
                    None,
                    "free",
                ));
            }
            #[cfg(feature = "free_null")]
            {
                crate::dwarn!("(Chunk) tried to free(0) from '{}'", origin);
                return Ok(());
            }
            #[cfg(not(feature = "free_null"))]
            {
                return Err(self.raise(ChunkError::IsNull));
            }
        }

        let mut update = empty_update();
        let slot = match self.find_user_slot(user_pnt, &mut update) {
            Ok(slot) => slot,
            Err(err) => {
                return Err(self.fault(
                    err,
                    origin,
                    Origin::Unknown,
                    user_pnt,
                    None,
                    "free",
                ));
            }
        };

        self.addr_map.remove(slot, &update).map_err(|e| self.raise(e))?;
        let old_origin = (*slot).origin;
        let user_size = (*slot).user_size;
        let total_size = (*slot).total_size;

        (*slot).flags = SlotFlags::FREE;
        (*slot).use_iter = self.iter;
        #[cfg(feature = "seen_count")]
        {
            (*slot).extra.seen += 1;
        }

        if self.flags.contains(DebugFlags::LOG_TRANS) {
            crate::dinfo!(
                "*** {}: at '{}' pnt '{}': size {}, alloced at '{}'",
                func.name(),
                origin,
                PntDesc::new(user_pnt, slot, self.flags),
                user_size,
                old_origin
            );
        }

        self.alloc_table.delete(&old_origin, user_size);
        // record the free site; a later fault reports it as prev access
        (*slot).origin = origin;

        self.stats.alloc_cur_pnts -= 1;
        self.stats.alloc_current -= user_size as u64;
        self.stats.alloc_cur_given -= total_size as u64;
        self.stats.free_space_bytes += total_size as u64;

        if self
            .flags
            .intersects(DebugFlags::FREE_BLANK | DebugFlags::CHECK_BLANK)
        {
            fence::blank_free(slot);
        }

        // adjacent free chunks are never coalesced: the fragmentation
        // is diagnostic signal, and merging would corrupt attribution
        if self.flags.contains(DebugFlags::NEVER_REUSE) {
            // the chunk is retired for good; only its record returns
            self.stats.free_space_bytes -= total_size as u64;
            self.slab.release(slot);
        } else {
            self.quarantine.push(slot);
        }

        Ok(())
    }

    /// Resize a user pointer, in place when the chunk still fits.
    pub fn realloc(
        &mut self,
        origin: Origin,
        old_pnt: *mut u8,
        new_size: usize,
        func: AllocFunc,
    ) -> ChunkResult<*mut u8> {
        self.tick();
        unsafe { self.realloc_inner(origin, old_pnt, new_size, func) }
    }

    unsafe fn realloc_inner(
        &mut self,
        origin: Origin,
        old_pnt: *mut u8,
        new_size: usize,
        func: AllocFunc,
    ) -> ChunkResult<*mut u8> {
        if func == AllocFunc::Recalloc {
            self.stats.func_recalloc_c += 1;
        } else {
            self.stats.func_realloc_c += 1;
        }

        #[cfg(not(feature = "alloc_zero_size"))]
        if new_size == 0 {
            crate::derror!("(Chunk) zero byte allocation request from '{}'", origin);
            return Err(self.fault(
                ChunkError::BadSize,
                origin,
                Origin::Unknown,
                ptr::null(),
                None,
                "realloc",
            ));
        }
        // same one-byte convention as malloc, or the in-place branch
        // would leave a live user slot of zero bytes
        #[cfg(feature = "alloc_zero_size")]
        let new_size = new_size.max(1);

        if old_pnt.is_null() {
            // the shims turn realloc(null) into malloc before we run
            return Err(self.fault(
                ChunkError::IsNull,
                origin,
                Origin::Unknown,
                ptr::null(),
                None,
                "realloc",
            ));
        }

        let mut update = empty_update();
        let slot = match self.find_user_slot(old_pnt, &mut update) {
            Ok(slot) => slot,
            Err(err) => {
                return Err(self.fault(
                    err,
                    origin,
                    Origin::Unknown,
                    old_pnt,
                    None,
                    "realloc",
                ));
            }
        };

        let info = PointerInfo::from_slot(slot);
        let old_origin = (*slot).origin;
        let old_size = (*slot).user_size;

        let fits = (info.user_start as usize) + new_size <= info.upper_bounds as usize;
        if !fits
            || self
                .flags
                .intersects(DebugFlags::REALLOC_COPY | DebugFlags::NEVER_REUSE)
        {
            // allocate fresh, copy the survivors, retire the old chunk
            let new_pnt = self.malloc_inner(origin, new_size, func, 0)?;

            let keep = old_size.min(new_size);
            if keep > 0 {
                ptr::copy_nonoverlapping(info.user_start, new_pnt, keep);
            }

            self.free_inner(origin, old_pnt, func)?;

            self.log_realloc(func, origin, old_pnt, old_size, old_origin, new_pnt, new_size);
            return Ok(new_pnt);
        }

        // in place: adjust accounting, the user size, and the poison
        self.stats.alloc_current =
            self.stats.alloc_current - old_size as u64 + new_size as u64;
        self.stats.alloc_maximum = self.stats.alloc_maximum.max(self.stats.alloc_current);
        self.stats.alloc_total += new_size as u64;
        self.stats.alloc_one_max = self.stats.alloc_one_max.max(new_size as u64);
        self.stats.alloc_tot_pnts += 1;

        (*slot).user_size = new_size;
        let info = PointerInfo::from_slot(slot);
        fence::clear_alloc(&info, old_size.min(new_size), func.zeroed(), self.flags);

        (*slot).use_iter = self.iter;
        #[cfg(feature = "seen_count")]
        {
            // the pointer is seen inbound and outbound
            (*slot).extra.seen += 2;
        }

        self.alloc_table.delete(&old_origin, old_size);
        self.alloc_table.insert(&origin, new_size);
        (*slot).origin = origin;

        self.log_realloc(
            func,
            origin,
            old_pnt,
            old_size,
            old_origin,
            info.user_start,
            new_size,
        );
        Ok(info.user_start)
    }

    #[allow(clippy::too_many_arguments)]
    fn log_realloc(
        &self,
        func: AllocFunc,
        origin: Origin,
        old_pnt: *const u8,
        old_size: usize,
        old_origin: Origin,
        new_pnt: *const u8,
        new_size: usize,
    ) {
        if self.flags.contains(DebugFlags::LOG_TRANS) {
            crate::dinfo!(
                "*** {}: at '{}' from {:#x} ({} bytes) '{}' to {:#x} ({} bytes)",
                func.name(),
                origin,
                old_pnt as usize,
                old_size,
                old_origin,
                new_pnt as usize,
                new_size
            );
        }
    }

    /// Report everything the tracker knows about a pointer.
    pub fn examine(&mut self, user_pnt: *const u8) -> ChunkResult<PointerDetails> {
        self.tick();

        if self.flags.contains(DebugFlags::LOG_TRANS) {
            crate::dinfo!("(Chunk) reading info about pointer {:#x}", user_pnt as usize);
        }

        unsafe {
            let mut update = empty_update();
            if user_pnt.is_null() {
                return Err(self.raise(ChunkError::IsNull));
            }
            let slot = self.addr_map.find_addr(user_pnt, false, &mut update);
            if slot.is_null() {
                return Err(self.fault(
                    ChunkError::NotFound,
                    Origin::Unknown,
                    Origin::Unknown,
                    user_pnt,
                    None,
                    "examine",
                ));
            }
            if let Err(err) = self.check_used_slot(slot, Some(user_pnt)) {
                let info = PointerInfo::from_slot(slot);
                let prev = (*slot).origin;
                return Err(self.fault(
                    err,
                    Origin::Unknown,
                    prev,
                    user_pnt,
                    Some(&info),
                    "examine",
                ));
            }

            Ok(PointerDetails {
                user_size: (*slot).user_size,
                total_size: (*slot).total_size,
                origin: (*slot).origin,
                use_iter: (*slot).use_iter,
                #[cfg(feature = "seen_count")]
                seen: Some((*slot).extra.seen),
                #[cfg(not(feature = "seen_count"))]
                seen: None,
                valloc: (*slot).flags.contains(SlotFlags::VALLOC),
                fence: (*slot).flags.contains(SlotFlags::FENCE),
            })
        }
    }

    /// Validate one pointer; with `null` the whole heap is walked.
    pub fn verify(&mut self, user_pnt: *const u8) -> ChunkResult<()> {
        if user_pnt.is_null() {
            self.heap_check()
        } else {
            self.pnt_check(user_pnt, true, 0)
        }
    }
}
