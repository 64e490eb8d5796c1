//! # Guard / Poison Engine
//!
//! Fence-post patterns bracketing every protected user region, and the
//! fill bytes that make fresh and freed memory tell-tale. Patterns are
//! written at allocation, verified at free and during every consistency
//! check; freed chunks are smeared with a byte that the reuse path can
//! re-verify to catch writes through stale pointers.

use crate::config::{
    ALLOC_FILL, FENCE_BOTTOM_SIZE, FENCE_MAGIC_BOTTOM, FENCE_MAGIC_TOP,
    FENCE_TOP_SIZE, FREE_FILL,
};
use crate::error::{ChunkError, ChunkResult};
use crate::flags::{DebugFlags, SlotFlags};
use crate::slot::{PointerInfo, Slot};
use core::ptr;

/// Build a fence region image by repeating a pattern word.
const fn pattern<const N: usize>(word: u32) -> [u8; N] {
    let bytes = word.to_le_bytes();
    let mut out = [0u8; N];
    let mut i = 0;
    while i < N {
        out[i] = bytes[i % 4];
        i += 1;
    }
    out
}

/// The proper bottom fence bytes.
pub const FENCE_BOTTOM: [u8; FENCE_BOTTOM_SIZE] = pattern(FENCE_MAGIC_BOTTOM);

/// The proper top fence bytes.
pub const FENCE_TOP: [u8; FENCE_TOP_SIZE] = pattern(FENCE_MAGIC_TOP);

/// Compare both fence regions of a chunk against the proper patterns.
///
/// # Safety
/// `info` must describe a live chunk with `fence` set.
pub unsafe fn fence_verify(info: &PointerInfo) -> ChunkResult<()> {
    let bottom = core::slice::from_raw_parts(info.fence_bottom, FENCE_BOTTOM_SIZE);
    if bottom != FENCE_BOTTOM {
        return Err(ChunkError::UnderFence);
    }

    let top = core::slice::from_raw_parts(info.fence_top, FENCE_TOP_SIZE);
    if top != FENCE_TOP {
        return Err(ChunkError::OverFence);
    }

    Ok(())
}

/// Set up a chunk for the user: fill policy first, fence patterns last.
///
/// `old_size` is the number of leading user bytes to preserve (nonzero
/// only on the in-place realloc path); everything past it is filled
/// according to the function semantics: zeroed for the calloc family,
/// smeared with the alloc pattern when poisoning is on.
///
/// # Safety
/// `info` must describe a live chunk large enough for its user size.
pub unsafe fn clear_alloc(
    info: &PointerInfo,
    old_size: usize,
    zeroed: bool,
    flags: DebugFlags,
) {
    let blanking = flags
        .intersects(DebugFlags::FREE_BLANK | DebugFlags::CHECK_BLANK);

    // A fence-posted page-aligned chunk carries almost a whole dead
    // block below the bottom fence; keep it in the freed pattern.
    if info.fence {
        let num = info.fence_bottom as usize - info.alloc_start as usize;
        if num > 0 && blanking {
            ptr::write_bytes(info.alloc_start, FREE_FILL, num);
        }
    }

    // fill the fresh part of the user region
    let start = info.user_start.add(old_size);
    if (start as usize) < info.user_bounds as usize {
        let num = info.user_bounds as usize - start as usize;
        if zeroed {
            ptr::write_bytes(start, 0, num);
        } else if flags
            .intersects(DebugFlags::ALLOC_BLANK | DebugFlags::CHECK_BLANK)
        {
            ptr::write_bytes(start, ALLOC_FILL, num);
        }
    }

    if info.fence {
        ptr::copy_nonoverlapping(
            FENCE_BOTTOM.as_ptr(),
            info.fence_bottom,
            FENCE_BOTTOM_SIZE,
        );
        ptr::copy_nonoverlapping(FENCE_TOP.as_ptr(), info.fence_top, FENCE_TOP_SIZE);
    }

    // rounding slack above the top fence stays in the freed pattern
    if blanking {
        let start = if info.fence {
            info.fence_top.add(FENCE_TOP_SIZE)
        } else {
            info.user_bounds
        };
        if (start as usize) < info.alloc_bounds as usize {
            let num = info.alloc_bounds as usize - start as usize;
            ptr::write_bytes(start, FREE_FILL, num);
        }
    }
}

/// Smear a freed chunk end to end with the free pattern.
///
/// # Safety
/// `slot` must point to a live slot owning its chunk.
pub unsafe fn blank_free(slot: *mut Slot) {
    ptr::write_bytes((*slot).mem, FREE_FILL, (*slot).total_size);
    (*slot).flags.insert(SlotFlags::BLANK);
}

/// Scan a blanked chunk for bytes that no longer carry the free
/// pattern. This is how a use-after-free write surfaces at reuse or
/// check time.
///
/// # Safety
/// `slot` must point to a live slot owning its chunk.
pub unsafe fn blank_verify(slot: *const Slot) -> ChunkResult<()> {
    let bytes = core::slice::from_raw_parts((*slot).mem, (*slot).total_size);
    if bytes.iter().any(|&b| b != FREE_FILL) {
        return Err(ChunkError::FreeNonBlank);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FENCE_OVERHEAD;
    use crate::slot::reset;

    fn slot_storage() -> Vec<u64> {
        vec![0u64; Slot::size_for_level(0).div_ceil(8)]
    }

    unsafe fn fenced_slot(
        storage: &mut [u64],
        chunk: &mut [u8],
        user_size: usize,
    ) -> *mut Slot {
        let slot = storage.as_mut_ptr() as *mut Slot;
        reset(slot, 0);
        (*slot).flags = SlotFlags::USER | SlotFlags::FENCE;
        (*slot).mem = chunk.as_mut_ptr();
        (*slot).total_size = chunk.len();
        (*slot).user_size = user_size;
        slot
    }

    #[test]
    fn patterns_repeat_the_magic_words() {
        assert_eq!(FENCE_BOTTOM[0], 0xc0);
        assert_eq!(FENCE_BOTTOM[FENCE_BOTTOM_SIZE - 1], 0xc0);
        assert_eq!(FENCE_TOP[0], 0xd0);
        assert!(FENCE_BOTTOM.iter().all(|&b| b == 0xc0));
        assert!(FENCE_TOP.iter().all(|&b| b == 0xd0));
    }

    #[test]
    fn clear_alloc_writes_fences_and_poison() {
        let mut storage = slot_storage();
        let mut chunk = [0u8; 64];
        unsafe {
            let slot = fenced_slot(&mut storage, &mut chunk, 64 - FENCE_OVERHEAD);
            let info = PointerInfo::from_slot(slot);
            clear_alloc(&info, 0, false, DebugFlags::PARANOID);

            fence_verify(&info).unwrap();
            let user = core::slice::from_raw_parts(info.user_start, (*slot).user_size);
            assert!(user.iter().all(|&b| b == ALLOC_FILL));
        }
    }

    #[test]
    fn clear_alloc_zeroes_for_calloc() {
        let mut storage = slot_storage();
        let mut chunk = [0xffu8; 64];
        unsafe {
            let slot = fenced_slot(&mut storage, &mut chunk, 64 - FENCE_OVERHEAD);
            let info = PointerInfo::from_slot(slot);
            clear_alloc(&info, 0, true, DebugFlags::PARANOID);

            let user = core::slice::from_raw_parts(info.user_start, (*slot).user_size);
            assert!(user.iter().all(|&b| b == 0));
            fence_verify(&info).unwrap();
        }
    }

    #[test]
    fn fence_verify_reports_direction() {
        let mut storage = slot_storage();
        let mut chunk = [0u8; 64];
        unsafe {
            let slot = fenced_slot(&mut storage, &mut chunk, 64 - FENCE_OVERHEAD);
            let info = PointerInfo::from_slot(slot);
            clear_alloc(&info, 0, false, DebugFlags::PARANOID);

            *info.user_start.sub(1) = 0xff;
            assert_eq!(fence_verify(&info).unwrap_err(), ChunkError::UnderFence);

            // repair the bottom, break the top
            clear_alloc(&info, 0, false, DebugFlags::PARANOID);
            *info.user_bounds = 0;
            assert_eq!(fence_verify(&info).unwrap_err(), ChunkError::OverFence);
        }
    }

    #[test]
    fn blank_round_trip_catches_stale_writes() {
        let mut storage = slot_storage();
        let mut chunk = [0u8; 64];
        unsafe {
            let slot = fenced_slot(&mut storage, &mut chunk, 64 - FENCE_OVERHEAD);
            blank_free(slot);
            assert!((*slot).flags.contains(SlotFlags::BLANK));
            blank_verify(slot).unwrap();

            chunk[40] = 0xab;
            let slot = fenced_slot(&mut storage, &mut chunk, 64 - FENCE_OVERHEAD);
            (*slot).flags.insert(SlotFlags::BLANK);
            assert_eq!(blank_verify(slot).unwrap_err(), ChunkError::FreeNonBlank);
        }
    }
}
