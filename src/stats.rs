//! # Statistics & Attribution
//!
//! Counters kept under the arena lock, the fixed-capacity
//! allocation-site tables, and the reporting walks (statistics dump and
//! changed-pointer report).

use crate::config::{
    BLOCK_SIZE, DUMP_SPACE, MEM_TABLE_ENTRIES, MEM_TABLE_TOP_LOG,
};
use crate::flags::{DebugFlags, SlotFlags};
use crate::heap::RawHeap;
use crate::log::DumpBytes;
use crate::slot::{fwd, Origin, PntDesc, PointerInfo};

/// Every counter the manager maintains. Copy, so `ChunkManager::stats()`
/// hands out a consistent snapshot taken under the lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Bytes currently in use (sum of user sizes of USER slots).
    pub alloc_current: u64,
    /// High-water mark of `alloc_current`.
    pub alloc_maximum: u64,
    /// Bytes currently given out including fences and rounding.
    pub alloc_cur_given: u64,
    /// High-water mark of `alloc_cur_given`.
    pub alloc_max_given: u64,
    /// Bytes ever requested (monotone).
    pub alloc_total: u64,
    /// Largest single request seen.
    pub alloc_one_max: u64,
    /// Bytes sitting on the free-size map.
    pub free_space_bytes: u64,

    /// Live pointer count, its maximum, and the monotone total.
    pub alloc_cur_pnts: u64,
    pub alloc_max_pnts: u64,
    pub alloc_tot_pnts: u64,

    /// Whole-heap checks performed.
    pub heap_check_c: u64,
    /// Basic blocks handed to users, to slabs, and claimed externally.
    pub user_block_c: u64,
    pub admin_block_c: u64,
    pub extern_block_c: u64,

    /// Per-entry-point call counts.
    pub func_malloc_c: u64,
    pub func_calloc_c: u64,
    pub func_realloc_c: u64,
    pub func_recalloc_c: u64,
    pub func_memalign_c: u64,
    pub func_valloc_c: u64,
    pub func_new_c: u64,
    pub func_free_c: u64,
    pub func_delete_c: u64,
}

// =============================================================================
// ALLOCATION-SITE TABLE
// =============================================================================

/// One aggregated call site.
#[derive(Debug, Clone, Copy)]
pub struct SiteEntry {
    pub origin: Origin,
    pub total_size: u64,
    pub total_c: u64,
    pub cur_size: u64,
    pub cur_c: u64,
    used: bool,
}

impl SiteEntry {
    const EMPTY: SiteEntry = SiteEntry {
        origin: Origin::Unknown,
        total_size: 0,
        total_c: 0,
        cur_size: 0,
        cur_c: 0,
        used: false,
    };
}

/// Fixed-capacity open-addressing table keyed by call site. Once the
/// table fills up, further sites aggregate into a catch-all bucket so
/// the report stays bounded no matter how many sites exist.
pub struct MemTable {
    entries: [SiteEntry; MEM_TABLE_ENTRIES],
    entry_c: usize,
    overflow: SiteEntry,
}

fn site_hash(origin: &Origin) -> usize {
    // FNV-1a over the identifying bytes; content based so that the same
    // file/line from different instantiations lands in one bucket.
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    let mut eat = |b: u8| {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    };
    match origin {
        Origin::Unknown => eat(0),
        Origin::Source { file, line } => {
            for b in file.bytes() {
                eat(b);
            }
            for b in line.to_le_bytes() {
                eat(b);
            }
        }
        Origin::Caller(ra) => {
            for b in ra.to_le_bytes() {
                eat(b);
            }
        }
    }
    h as usize
}

impl MemTable {
    pub fn new() -> MemTable {
        MemTable {
            entries: [SiteEntry::EMPTY; MEM_TABLE_ENTRIES],
            entry_c: 0,
            overflow: SiteEntry::EMPTY,
        }
    }

    pub fn len(&self) -> usize {
        self.entry_c
    }

    /// Index of the used entry for `origin`, if the site is already
    /// filed.
    fn find_index(&self, origin: &Origin) -> Option<usize> {
        let start = site_hash(origin) % MEM_TABLE_ENTRIES;
        for probe in 0..MEM_TABLE_ENTRIES {
            let idx = (start + probe) % MEM_TABLE_ENTRIES;
            let entry = &self.entries[idx];
            if !entry.used {
                return None;
            }
            if entry.origin == *origin {
                return Some(idx);
            }
        }
        None
    }

    /// Find the bucket for `origin`, or the catch-all when the table is
    /// full and the site is new.
    fn bucket(&mut self, origin: &Origin) -> &mut SiteEntry {
        if let Some(idx) = self.find_index(origin) {
            return &mut self.entries[idx];
        }
        if self.entry_c >= MEM_TABLE_ENTRIES {
            return &mut self.overflow;
        }
        // claim the first free probe slot
        let mut idx = site_hash(origin) % MEM_TABLE_ENTRIES;
        while self.entries[idx].used {
            idx = (idx + 1) % MEM_TABLE_ENTRIES;
        }
        let entry = &mut self.entries[idx];
        entry.used = true;
        entry.origin = *origin;
        self.entry_c += 1;
        entry
    }

    /// Account one allocation of `size` bytes to `origin`.
    pub fn insert(&mut self, origin: &Origin, size: usize) {
        let entry = self.bucket(origin);
        entry.total_size += size as u64;
        entry.total_c += 1;
        entry.cur_size += size as u64;
        entry.cur_c += 1;
    }

    /// Account one free of `size` bytes previously charged to `origin`.
    pub fn delete(&mut self, origin: &Origin, size: usize) {
        let entry = match self.find_index(origin) {
            Some(idx) => &mut self.entries[idx],
            // site never made it into the table; it lives in the catch-all
            None => &mut self.overflow,
        };
        entry.cur_size = entry.cur_size.saturating_sub(size as u64);
        entry.cur_c = entry.cur_c.saturating_sub(1);
    }

    /// Look up a site without modifying the table.
    pub fn get(&self, origin: &Origin) -> Option<&SiteEntry> {
        self.find_index(origin).map(|idx| &self.entries[idx])
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries = [SiteEntry::EMPTY; MEM_TABLE_ENTRIES];
        self.entry_c = 0;
        self.overflow = SiteEntry::EMPTY;
    }

    /// Log the table, largest total first. `top` of 0 logs every used
    /// entry; `in_use` adds the current-usage columns.
    pub fn log(&self, top: usize, in_use: bool) {
        let mut sorted = self.entries;
        sorted.sort_unstable_by(|a, b| b.total_size.cmp(&a.total_size));

        let limit = if top == 0 { sorted.len() } else { top };
        let mut shown = 0usize;
        for entry in sorted.iter() {
            if shown >= limit {
                break;
            }
            if !entry.used {
                continue;
            }
            if in_use {
                crate::dreport!(
                    " {:>10} {:>6}  {:>10} {:>6}  {}",
                    entry.total_size,
                    entry.total_c,
                    entry.cur_size,
                    entry.cur_c,
                    entry.origin
                );
            } else {
                crate::dreport!(
                    " {:>10} {:>6}  {}",
                    entry.total_size,
                    entry.total_c,
                    entry.origin
                );
            }
            shown += 1;
        }
        if self.overflow.total_c > 0 {
            crate::dreport!(
                " {:>10} {:>6}  (sites beyond table capacity)",
                self.overflow.total_size,
                self.overflow.total_c
            );
        }
    }
}

// =============================================================================
// REPORTING WALKS
// =============================================================================

use crate::chunk::ChunkManager;

impl<H: RawHeap> ChunkManager<H> {
    /// Capture the current iteration so later reports can scope
    /// themselves to "changed since".
    pub fn mark(&self) -> u64 {
        self.iter
    }

    /// Log general heap statistics: geometry, block population, call
    /// counters, usage maxima and the top allocation sites.
    pub fn log_stats(&self) {
        if self.flags.contains(DebugFlags::LOG_TRANS) {
            crate::dinfo!("(Stats) dumping chunk statistics");
        }

        let s = &self.stats;
        let heap_size = self.heap.high_water() as usize - self.heap.base() as usize;
        let tot_space = s.alloc_current + s.free_space_bytes;
        let overhead = s.admin_block_c * BLOCK_SIZE as u64;
        let ext_space = s.extern_block_c * BLOCK_SIZE as u64;
        let wasted = tot_space.saturating_sub(s.alloc_max_given);
        let pct = |part: u64| {
            if heap_size == 0 {
                0
            } else {
                part * 100 / heap_size as u64
            }
        };

        crate::dreport!(
            "basic-block {} bytes, alignment {} bytes",
            BLOCK_SIZE,
            crate::config::ALLOCATION_ALIGNMENT
        );
        crate::dreport!(
            "heap address range: {:#x} to {:#x}, {} bytes",
            self.heap.base() as usize,
            self.heap.high_water() as usize,
            heap_size
        );
        crate::dreport!(
            "    user blocks: {} blocks, {} bytes ({}%)",
            s.user_block_c,
            tot_space,
            pct(tot_space)
        );
        crate::dreport!(
            "   admin blocks: {} blocks, {} bytes ({}%)",
            s.admin_block_c,
            overhead,
            pct(overhead)
        );
        crate::dreport!(
            "external blocks: {} blocks, {} bytes ({}%)",
            s.extern_block_c,
            ext_space,
            pct(ext_space)
        );
        crate::dreport!(
            "   total blocks: {} blocks",
            s.user_block_c + s.admin_block_c + s.extern_block_c
        );
        crate::dreport!("heap checked {}", s.heap_check_c);
        crate::dreport!(
            "alloc calls: malloc {}, calloc {}, realloc {}, free {}",
            s.func_malloc_c,
            s.func_calloc_c,
            s.func_realloc_c,
            s.func_free_c
        );
        crate::dreport!(
            "alloc calls: recalloc {}, memalign {}, valloc {}",
            s.func_recalloc_c,
            s.func_memalign_c,
            s.func_valloc_c
        );
        crate::dreport!(
            "alloc calls: new {}, delete {}",
            s.func_new_c,
            s.func_delete_c
        );
        crate::dreport!(
            "  current memory in use: {} bytes ({} pnts)",
            s.alloc_current,
            s.alloc_cur_pnts
        );
        crate::dreport!(
            " total memory allocated: {} bytes ({} pnts)",
            s.alloc_total,
            s.alloc_tot_pnts
        );
        crate::dreport!(
            " max in use at one time: {} bytes ({} pnts)",
            s.alloc_maximum,
            s.alloc_max_pnts
        );
        crate::dreport!("max alloced with 1 call: {} bytes", s.alloc_one_max);
        crate::dreport!(
            "max alloc rounding loss: {} bytes",
            s.alloc_max_given.saturating_sub(s.alloc_maximum)
        );
        crate::dreport!("max memory space wasted: {} bytes", wasted);

        crate::dreport!("top {} allocations:", MEM_TABLE_TOP_LOG);
        self.alloc_table.log(MEM_TABLE_TOP_LOG, true);
    }

    /// Report every pointer whose state changed after `mark`,
    /// aggregated by call site. `not_freed` selects live pointers,
    /// `freed` selects freed ones, `details` lists individual pointers
    /// on top of the summary.
    pub fn log_changed(&mut self, mark: u64, not_freed: bool, freed: bool, details: bool) {
        let which = match (not_freed, freed) {
            (true, true) => "not-freed and freed",
            (true, false) => "not-freed",
            (false, true) => "freed",
            (false, false) => return,
        };
        crate::dreport!("dumping {} pointers changed since mark {}:", which, mark);

        self.changed_table.clear();

        let mut unknown_c = 0u64;
        let mut unknown_size = 0u64;

        // walk the address map, then the free map, then the quarantine
        let lists = [
            self.addr_map.first(),
            self.free_map.first(),
            self.quarantine.head(),
        ];
        for start in lists {
            let mut slot = start;
            while !slot.is_null() {
                unsafe {
                    let flags = (*slot).flags;
                    let is_free = flags.contains(SlotFlags::FREE);
                    let is_used = flags.contains(SlotFlags::USER);

                    let wanted = (is_free || is_used)
                        && ((not_freed && is_used) || (freed && is_free))
                        && (*slot).use_iter > mark;
                    if !wanted {
                        slot = fwd(slot, 0);
                        continue;
                    }

                    let known = !matches!((*slot).origin, Origin::Unknown);
                    if !known {
                        unknown_c += 1;
                        unknown_size += (*slot).user_size as u64;
                    }

                    if known || !self.flags.contains(DebugFlags::LOG_KNOWN) {
                        let info = PointerInfo::from_slot(slot);
                        if details {
                            crate::dreport!(
                                " {} freed: '{}' ({} bytes) from '{}'",
                                if is_free { "   " } else { "not" },
                                PntDesc::new(info.user_start, slot, self.flags),
                                (*slot).user_size,
                                (*slot).origin
                            );
                            if !is_free
                                && self.flags.contains(DebugFlags::LOG_NONFREE_SPACE)
                            {
                                let dump =
                                    (*slot).user_size.min(DUMP_SPACE);
                                let bytes = core::slice::from_raw_parts(
                                    info.user_start,
                                    dump,
                                );
                                crate::dreport!(
                                    "  dump of {:#x}: '{}'",
                                    info.user_start as usize,
                                    DumpBytes(bytes)
                                );
                            }
                        }
                        let origin = (*slot).origin;
                        let size = (*slot).user_size;
                        self.changed_table.insert(&origin, size);
                    }

                    slot = fwd(slot, 0);
                }
            }
        }

        self.changed_table.log(0, false);
        if unknown_c > 0 {
            crate::dreport!(
                " unknown memory: {} pointer{}, {} bytes",
                unknown_c,
                if unknown_c == 1 { "" } else { "s" },
                unknown_size
            );
        }
    }
}
