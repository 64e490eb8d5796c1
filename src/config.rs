//! # Chunk Manager Configuration
//!
//! Compile-time constants shared by every module: block geometry, fence
//! layout, fill patterns, slab magics and table capacities.
//!
//! ## 🎯 Purpose and Responsibility
//! - **Single Source of Truth:** every size, pattern and capacity the
//!   tracker bakes into its data structures lives here.
//! - **Compile-Time Only:** nothing in this module is read from the
//!   environment; runtime behavior is selected through `DebugFlags`.
//!
//! ## ⚠️ Points of Attention (Technical Debt)
//! - **Fixed Block Size:** 4 KiB is assumed, not probed. On targets
//!   with larger pages the page-alignment guarantee of VALLOC chunks
//!   holds only relative to this constant.
//!
//! ## 🛠️ TODOs and Roadmap
//! - [ ] **TODO: (Portability)** derive `BLOCK_SIZE` from the target
//!   page size at build time instead of hard-coding 4096.

// =============================================================================
// BLOCK GEOMETRY
// =============================================================================

/// Size of a basic block (4 KiB). Every raw-heap allocation is a multiple
/// of this, and page-aligned requests are aligned to it.
pub const BLOCK_SIZE: usize = 4096;

/// Natural alignment of every returned user pointer.
pub const ALLOCATION_ALIGNMENT: usize = 8;

/// Smallest divided sub-chunk we will carve out of a basic block.
pub const SMALLEST_DIVIDED: usize = 16;

/// Upper bound on a single user request. Anything above this is reported
/// as a fault rather than forwarded to the raw heap.
pub const LARGEST_ALLOCATION: usize = 1 << 28;

// =============================================================================
// SKIP LIST
// =============================================================================

/// Maximum height of the ordered maps. Slot levels run 0..MAX_LEVEL.
/// With a geometric level distribution this comfortably covers millions
/// of live chunks.
pub const MAX_LEVEL: usize = 16;

// =============================================================================
// FENCE-POST AND FILL PATTERNS
// =============================================================================

/// Bytes of guard pattern written immediately below the user region.
pub const FENCE_BOTTOM_SIZE: usize = 16;

/// Bytes of guard pattern written immediately above the user region.
pub const FENCE_TOP_SIZE: usize = 16;

/// Total fence overhead added to a request when fences are enabled.
pub const FENCE_OVERHEAD: usize = FENCE_BOTTOM_SIZE + FENCE_TOP_SIZE;

/// Word repeated through the bottom fence region.
pub const FENCE_MAGIC_BOTTOM: u32 = 0xC0C0_C0C0;

/// Word repeated through the top fence region.
pub const FENCE_MAGIC_TOP: u32 = 0xD0D0_D0D0;

/// Byte smeared over fresh (non-zeroed) allocations.
pub const ALLOC_FILL: u8 = 0xDA;

/// Byte smeared over freed chunks. Distinct from ALLOC_FILL, zero and
/// both fence patterns so the source of stale data is unambiguous.
pub const FREE_FILL: u8 = 0xCA;

// =============================================================================
// METADATA SLABS
// =============================================================================

/// First header word of an entry block.
pub const ENTRY_BLOCK_MAGIC1: u32 = 0xCAFE_B10C;

/// Second header word, written after the level number.
pub const ENTRY_BLOCK_MAGIC2: u32 = 0xDEAD_B10C;

/// Trailer word stored in the last word of an entry block.
pub const ENTRY_BLOCK_MAGIC3: u32 = 0xFEED_B10C;

// =============================================================================
// QUARANTINE
// =============================================================================

/// How many allocation iterations a freed chunk waits in quarantine
/// before it may be reused. Immediate reuse would hide use-after-free.
pub const FREED_POINTER_DELAY: u64 = 3;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Shortest printable file name we accept in a slot's attribution.
pub const MIN_FILE_LENGTH: usize = 3;

/// Longest printable file name we accept in a slot's attribution.
pub const MAX_FILE_LENGTH: usize = 120;

/// Largest plausible line number in an attribution.
pub const MAX_LINE_NUMBER: u32 = 30_000;

/// Capacity of the fixed allocation-site tables (open addressing).
pub const MEM_TABLE_ENTRIES: usize = 511;

/// How many top allocation sites the statistics report lists.
pub const MEM_TABLE_TOP_LOG: usize = 10;

// =============================================================================
// DIAGNOSTIC OUTPUT
// =============================================================================

/// Bytes of user memory dumped next to a detected fault.
pub const DUMP_SPACE: usize = 24;

/// Default arena reserved by the global singleton (64 MiB).
pub const DEFAULT_ARENA_SIZE: usize = 64 * 1024 * 1024;

/// Round `val` up to the next multiple of `align` (a power of two).
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Round a byte count up to whole basic blocks.
pub const fn round_to_blocks(bytes: usize) -> usize {
    align_up(bytes, BLOCK_SIZE) / BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_bytes_are_distinct() {
        assert_ne!(ALLOC_FILL, FREE_FILL);
        assert_ne!(FREE_FILL, 0);
        assert_ne!(FREE_FILL, FENCE_MAGIC_BOTTOM.to_le_bytes()[0]);
        assert_ne!(FREE_FILL, FENCE_MAGIC_TOP.to_le_bytes()[0]);
    }

    #[test]
    fn align_up_rounds() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(round_to_blocks(1), 1);
        assert_eq!(round_to_blocks(BLOCK_SIZE * 2), 2);
    }
}
