//! # Anvil: Diagnostic Heap Manager
//!
//! A drop-in tracking allocator core. Beyond servicing requests it
//! detects and attributes the classic heap bugs: buffer overruns and
//! underruns (fence-posts), double free and free of foreign pointers
//! (address tracking), use-after-free (poison + delayed reuse), leaks
//! and size drift (per-site accounting).
//!
//! ## 🎯 Purpose and Responsibility
//! - **Tracking:** every live and recently freed chunk has a slot in an
//!   ordered map, attributed to the call site that created it.
//! - **Detection:** guard bytes, poison fills and whole-heap walks turn
//!   silent corruption into a named `ChunkError` at a named site.
//!
//! ## 🏗️ Architecture: One Arena, One Lock
//! The manager is a single aggregate (`ChunkManager`) reachable through
//! a `spin::Lazy<Mutex<..>>` singleton. Every entry shim below takes
//! the lock once and delegates; no internal operation suspends or
//! re-enters. Tests instantiate private managers over their own arenas
//! instead of sharing the singleton.
//!
//! ## 🔍 Critical Analysis (Allocator Engineer's View)
//!
//! ### ✅ Strengths
//! - **Lazy Initialization:** `spin::Lazy` defers the arena reservation
//!   to first use and sidesteps static-init ordering problems.
//! - **Self-Hosted Metadata:** tracking slots come out of dedicated
//!   slab blocks, so the tracker never allocates through itself.
//!
//! ### ⚠️ Points of Attention (Technical Debt)
//! - **Single Global Lock:** one spinlock serializes every operation.
//!   Heavily threaded programs will contend on it; that is the accepted
//!   price of diagnostic power over throughput.
//! - **Memory Kept for Life:** the arena only grows and nothing returns
//!   to the operating system. Long-running processes trade footprint
//!   for the ability to interrogate allocation history.
//!
//! ## 🛠️ TODOs and Roadmap
//! - [ ] **TODO: (API)** a `GlobalAlloc` adapter over the entry shims
//!   so the tracker can stand in for the Rust global allocator.
//! - [ ] **TODO: (Config)** environment-driven flag selection on first
//!   touch of the singleton, like the classic option string.

// --- Foundation ---
pub mod config; // compile-time constants
pub mod error; // fault taxonomy
pub mod flags; // runtime + per-slot flag words
pub mod log; // leveled stderr macros, byte dumps

// --- Core structures ---
pub mod heap; // raw heap provider
pub mod map; // address / free-size ordered maps
pub mod slab; // metadata slab pool
pub mod slot; // tracking slots, attribution, pointer geometry

// --- Policy and diagnostics ---
mod check; // whole-heap walk, pointer validation
pub mod chunk; // allocation policy and user operations
pub mod fence; // guard patterns and fill policy
pub mod quarantine; // delayed-reuse queue
pub mod stats; // counters, site tables, reports

pub use chunk::{AllocFunc, ChunkManager, ErrorHandler, PointerDetails};
pub use error::{ChunkError, ChunkResult};
pub use flags::{DebugFlags, SlotFlags};
pub use heap::{ArenaHeap, HeapAlloc, RawHeap};
pub use slot::Origin;
pub use stats::Stats;

use spin::{Lazy, Mutex};

/// The process-wide manager: one arena, one lock. Initialized on first
/// touch so the arena reservation happens lazily.
static TRACKER: Lazy<Mutex<ChunkManager<ArenaHeap>>> = Lazy::new(|| {
    Mutex::new(ChunkManager::with_arena(
        config::DEFAULT_ARENA_SIZE,
        DebugFlags::default(),
    ))
});

/// Run `f` with the global manager under the lock.
pub fn with_tracker<R>(f: impl FnOnce(&mut ChunkManager<ArenaHeap>) -> R) -> R {
    f(&mut TRACKER.lock())
}

/// Capture the calling source location as an [`Origin`].
#[macro_export]
macro_rules! site {
    () => {
        $crate::Origin::Source {
            file: file!(),
            line: line!(),
        }
    };
}

// =============================================================================
// ENTRY SHIMS
// =============================================================================

/// Allocate `size` bytes.
pub fn malloc(origin: Origin, size: usize) -> ChunkResult<*mut u8> {
    with_tracker(|t| t.malloc(origin, size, AllocFunc::Malloc, 0))
}

/// Allocate zeroed room for `count` elements of `size` bytes.
pub fn calloc(origin: Origin, count: usize, size: usize) -> ChunkResult<*mut u8> {
    let bytes = count
        .checked_mul(size)
        .ok_or(ChunkError::TooBig)?;
    with_tracker(|t| t.malloc(origin, bytes, AllocFunc::Calloc, 0))
}

/// Allocate `size` bytes aligned to `alignment` (a power of two up to
/// the block size).
pub fn memalign(origin: Origin, alignment: usize, size: usize) -> ChunkResult<*mut u8> {
    with_tracker(|t| t.malloc(origin, size, AllocFunc::Memalign, alignment))
}

/// Allocate `size` bytes on a page boundary.
pub fn valloc(origin: Origin, size: usize) -> ChunkResult<*mut u8> {
    with_tracker(|t| t.malloc(origin, size, AllocFunc::Valloc, 0))
}

/// Release a pointer.
pub fn free(origin: Origin, pnt: *mut u8) -> ChunkResult<()> {
    with_tracker(|t| t.free(origin, pnt, AllocFunc::Free))
}

/// Resize a pointer; `realloc(null)` is the shim-level malloc case.
pub fn realloc(origin: Origin, old_pnt: *mut u8, new_size: usize) -> ChunkResult<*mut u8> {
    with_tracker(|t| {
        if old_pnt.is_null() {
            t.malloc(origin, new_size, AllocFunc::Realloc, 0)
        } else {
            t.realloc(origin, old_pnt, new_size, AllocFunc::Realloc)
        }
    })
}

/// Resize a pointer, zeroing any grown tail.
pub fn recalloc(origin: Origin, old_pnt: *mut u8, new_size: usize) -> ChunkResult<*mut u8> {
    with_tracker(|t| {
        if old_pnt.is_null() {
            t.malloc(origin, new_size, AllocFunc::Recalloc, 0)
        } else {
            t.realloc(origin, old_pnt, new_size, AllocFunc::Recalloc)
        }
    })
}

/// Everything the tracker knows about a pointer.
pub fn examine(pnt: *const u8) -> ChunkResult<PointerDetails> {
    with_tracker(|t| t.examine(pnt))
}

/// Validate one pointer, or the whole heap when `pnt` is null.
pub fn verify(pnt: *const u8) -> ChunkResult<()> {
    with_tracker(|t| t.verify(pnt))
}

/// Capture the current iteration for later changed-since reports.
pub fn mark() -> u64 {
    with_tracker(|t| t.mark())
}

/// Report pointers whose state changed after `mark`.
pub fn log_changed(mark: u64, not_freed: bool, freed: bool, details: bool) {
    with_tracker(|t| t.log_changed(mark, not_freed, freed, details))
}

/// Dump heap statistics and the top allocation sites.
pub fn log_stats() {
    with_tracker(|t| t.log_stats())
}

/// Read the runtime debug flag word.
pub fn debug_flags() -> DebugFlags {
    with_tracker(|t| t.flags())
}

/// Replace the runtime debug flag word.
pub fn set_debug_flags(flags: DebugFlags) {
    with_tracker(|t| t.set_flags(flags))
}

/// Cap total given bytes; 0 disables the limit.
pub fn set_memory_limit(limit: usize) {
    with_tracker(|t| t.set_memory_limit(limit))
}

/// The most recently recorded fault.
pub fn last_error() -> Option<ChunkError> {
    with_tracker(|t| t.last_error())
}
