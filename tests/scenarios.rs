//! End-to-end corruption scenarios against a private manager instance.
//!
//! Each test drives the manager the way a buggy program would and
//! asserts the exact fault the tracker reports.

use anvil::chunk::AllocFunc;
use anvil::config::{BLOCK_SIZE, FREED_POINTER_DELAY};
use anvil::{ChunkError, ChunkManager, DebugFlags, Origin};

fn manager(flags: DebugFlags) -> ChunkManager {
    ChunkManager::with_arena(8 * 1024 * 1024, flags)
}

fn site(line: u32) -> Origin {
    Origin::Source {
        file: "scenarios.rs",
        line,
    }
}

fn alloc(mgr: &mut ChunkManager, line: u32, size: usize) -> *mut u8 {
    mgr.malloc(site(line), size, AllocFunc::Malloc, 0).unwrap()
}

fn release(mgr: &mut ChunkManager, line: u32, p: *mut u8) {
    mgr.free(site(line), p, AllocFunc::Free).unwrap()
}

#[test]
fn overrun_is_reported_over_fence() {
    let mut mgr = manager(DebugFlags::CHECK_FENCE);
    let p = alloc(&mut mgr, 10, 10);

    // one byte too many
    unsafe { core::ptr::write_bytes(p, 0, 11) };

    assert_eq!(mgr.verify(p).unwrap_err(), ChunkError::OverFence);
    assert_eq!(mgr.last_error(), Some(ChunkError::OverFence));
}

#[test]
fn underrun_is_reported_under_fence() {
    let mut mgr = manager(DebugFlags::CHECK_FENCE);
    let p = alloc(&mut mgr, 20, 10);

    unsafe { *p.sub(1) = 0xff };

    assert_eq!(mgr.verify(p).unwrap_err(), ChunkError::UnderFence);
}

#[test]
fn double_free_is_not_found() {
    let mut mgr = manager(DebugFlags::CHECK_FENCE | DebugFlags::FREE_BLANK);
    let p = alloc(&mut mgr, 30, 32);
    release(&mut mgr, 31, p);

    assert_eq!(
        mgr.free(site(32), p, AllocFunc::Free).unwrap_err(),
        ChunkError::NotFound
    );
}

#[test]
fn use_after_free_surfaces_at_reuse() {
    let mut mgr = manager(DebugFlags::PARANOID);
    let p = alloc(&mut mgr, 40, 64);
    release(&mut mgr, 41, p);

    // the program keeps a stale pointer and writes through it
    unsafe { *p = 0xab };

    // unrelated traffic in a different size class drains the quarantine
    for _ in 0..=FREED_POINTER_DELAY {
        let q = alloc(&mut mgr, 42, 600);
        release(&mut mgr, 43, q);
    }

    // the poisoned chunk is first in line for its size class
    let err = mgr.malloc(site(44), 64, AllocFunc::Malloc, 0).unwrap_err();
    assert_eq!(err, ChunkError::FreeNonBlank);
}

#[test]
fn divided_chunks_are_reused_within_their_page() {
    let mut mgr = manager(DebugFlags::PARANOID);

    let ptrs: Vec<*mut u8> = (0..100).map(|i| alloc(&mut mgr, 50 + i, 24)).collect();
    for &p in &ptrs {
        release(&mut mgr, 160, p);
    }

    mgr.heap_check().unwrap();

    let again = alloc(&mut mgr, 161, 24);
    assert!(
        ptrs.contains(&again),
        "a divided sub-chunk from the earlier pages should come back"
    );
}

#[test]
fn valloc_returns_page_aligned_memory() {
    let mut mgr = manager(DebugFlags::PARANOID);
    let p = mgr.malloc(site(60), 1, AllocFunc::Valloc, 0).unwrap();
    assert_eq!(p as usize % BLOCK_SIZE, 0);

    let details = mgr.examine(p).unwrap();
    assert!(details.valloc);
    assert!(details.total_size >= BLOCK_SIZE);

    release(&mut mgr, 61, p);
    mgr.heap_check().unwrap();
}

#[test]
fn paranoid_malloc_free_storm_stays_consistent() {
    let mut mgr = manager(DebugFlags::PARANOID);
    let mut live: Vec<(*mut u8, usize)> = Vec::new();

    // deterministic mixed sizes across both allocation paths
    let mut state = 0x1234_5678u64;
    for i in 0..400 {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let size = 1 + (state >> 33) as usize % 6000;
        let p = alloc(&mut mgr, 70, size);
        unsafe { core::ptr::write_bytes(p, (i & 0xff) as u8, size) };
        live.push((p, size));

        if i % 3 == 0 {
            let (victim, _) = live.swap_remove((state as usize >> 7) % live.len());
            release(&mut mgr, 71, victim);
        }
    }

    mgr.heap_check().unwrap();
    for (p, _) in live {
        release(&mut mgr, 72, p);
    }
    mgr.heap_check().unwrap();
}

#[test]
fn realloc_preserves_the_prefix() {
    let mut mgr = manager(DebugFlags::PARANOID);
    let p = alloc(&mut mgr, 80, 100);
    for i in 0..100 {
        unsafe { *p.add(i) = i as u8 };
    }

    // same-size realloc keeps the bytes
    let q = mgr.realloc(site(81), p, 100, AllocFunc::Realloc).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(q, 100) };
    for (i, &b) in bytes.iter().enumerate() {
        assert_eq!(b, i as u8);
    }

    // growth across chunks still keeps the prefix
    let r = mgr.realloc(site(82), q, 5000, AllocFunc::Realloc).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(r, 100) };
    for (i, &b) in bytes.iter().enumerate() {
        assert_eq!(b, i as u8);
    }

    mgr.heap_check().unwrap();
}

#[test]
fn recalloc_zeroes_grown_tail() {
    let mut mgr = manager(DebugFlags::PARANOID);
    let p = mgr.malloc(site(85), 40, AllocFunc::Calloc, 0).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(p, 40) };
    assert!(bytes.iter().all(|&b| b == 0));

    unsafe { core::ptr::write_bytes(p, 0x11, 40) };
    let q = mgr.realloc(site(86), p, 60, AllocFunc::Recalloc).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(q, 60) };
    assert!(bytes[..40].iter().all(|&b| b == 0x11));
    assert!(bytes[40..].iter().all(|&b| b == 0));
}

#[test]
fn extern_blocks_stay_tracked_and_untouched() {
    let mut mgr = manager(DebugFlags::PARANOID);
    let before = alloc(&mut mgr, 90, 5000);

    // a foreign allocator moves the break under us
    mgr.heap_mut().foreign_claim(3);

    let after = alloc(&mut mgr, 91, 5000);
    mgr.heap_check().unwrap();

    let stats = mgr.stats();
    assert_eq!(stats.extern_block_c, 3);

    // the extern region is tracked but is nobody's user pointer
    let gap = unsafe { before.add(8192) };
    assert_eq!(
        mgr.free(site(92), gap, AllocFunc::Free).unwrap_err(),
        ChunkError::NotFound
    );

    release(&mut mgr, 93, before);
    release(&mut mgr, 94, after);
    mgr.heap_check().unwrap();
}

#[test]
fn free_of_interior_pointer_names_the_owner_site() {
    let mut mgr = manager(DebugFlags::CHECK_FENCE);
    let p = alloc(&mut mgr, 95, 128);

    let err = mgr
        .free(site(96), unsafe { p.add(16) }, AllocFunc::Free)
        .unwrap_err();
    assert_eq!(err, ChunkError::NotFound);

    // the chunk itself is unharmed
    mgr.verify(p).unwrap();
}

#[test]
fn mark_and_changed_report_runs() {
    let mut mgr = manager(DebugFlags::PARANOID);
    let before = mgr.mark();

    let a = alloc(&mut mgr, 97, 48);
    let b = alloc(&mut mgr, 98, 80);
    release(&mut mgr, 99, b);

    // smoke: walks all three lists and aggregates without faulting
    mgr.log_changed(before, true, true, true);
    mgr.log_stats();

    release(&mut mgr, 100, a);
    mgr.heap_check().unwrap();
    assert!(mgr.mark() > before);
}
