//! # Tracking Slots
//!
//! A slot is the tracker's record for one contiguous chunk: its place in
//! the heap, its size, its category and its attribution. The forward
//! pointer array at the tail is sized at carving time for the slot's
//! level, so slots of one level pack densely into their slab block and a
//! slot serves whichever ordered map currently holds it.
//!
//! Slots are always handled through raw pointers: they live inside slab
//! blocks carved out of the raw heap, and their tails extend past
//! `size_of::<Slot>()`.

use crate::config::{BLOCK_SIZE, FENCE_BOTTOM_SIZE, FENCE_TOP_SIZE, MAX_LEVEL};
use crate::flags::{DebugFlags, SlotFlags};
use core::fmt;
use core::mem::{align_of, offset_of, size_of};
use core::ptr;

/// Where an allocation (or its free) came from. A raw return address is
/// used when no source location was captured; the distinguishing signal
/// in the original scheme was `line == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    #[default]
    Unknown,
    /// Named source location.
    Source { file: &'static str, line: u32 },
    /// Call-site return address.
    Caller(usize),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Unknown => f.write_str("unknown"),
            Origin::Source { file, line } => write!(f, "{}:{}", file, line),
            Origin::Caller(ra) => write!(f, "ra={:#x}", ra),
        }
    }
}

/// Optional per-slot payload selected by compile-time tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotExtra {
    /// How often this pointer has been handled (alloc, free, realloc).
    #[cfg(feature = "seen_count")]
    pub seen: u64,
    /// Wall clock at the last allocation.
    #[cfg(feature = "store_time")]
    pub stamp: Option<std::time::SystemTime>,
    /// Thread that performed the last allocation.
    #[cfg(feature = "thread_id")]
    pub thread: Option<std::thread::ThreadId>,
}

/// One tracked chunk. The `forward` array is declared with one entry and
/// extended at carving time to `level + 1` entries.
#[repr(C)]
pub struct Slot {
    pub flags: SlotFlags,
    /// Height in the ordered maps; fixed at carving time.
    pub level: u8,
    /// First byte of the chunk in the user heap.
    pub mem: *mut u8,
    /// Total chunk bytes including fences and rounding.
    pub total_size: usize,
    /// Bytes the user asked for; 0 for non-user slots.
    pub user_size: usize,
    pub origin: Origin,
    /// Iteration counter value at the last state change.
    pub use_iter: u64,
    pub extra: SlotExtra,
    forward: [*mut Slot; 1],
}

impl Slot {
    /// Bytes a slot of the given level occupies inside its slab block.
    pub const fn size_for_level(level: usize) -> usize {
        offset_of!(Slot, forward) + (level + 1) * size_of::<*mut Slot>()
    }

    /// Alignment every slot address must satisfy.
    pub const ALIGN: usize = align_of::<Slot>();

    fn blank(level: u8) -> Slot {
        Slot {
            flags: SlotFlags::empty(),
            level,
            mem: ptr::null_mut(),
            total_size: 0,
            user_size: 0,
            origin: Origin::Unknown,
            use_iter: 0,
            extra: SlotExtra::default(),
            forward: [ptr::null_mut()],
        }
    }
}

/// Address of the level-`l` forward pointer of `slot`.
///
/// # Safety
/// `slot` must have storage for at least `l + 1` forward pointers (its
/// own level, or the head's MAX_LEVEL).
#[inline]
pub unsafe fn fwd_ptr(slot: *mut Slot, level: usize) -> *mut *mut Slot {
    debug_assert!(level < MAX_LEVEL);
    (slot as *mut u8)
        .add(offset_of!(Slot, forward))
        .cast::<*mut Slot>()
        .add(level)
}

/// Read the level-`l` forward pointer.
#[inline]
pub unsafe fn fwd(slot: *mut Slot, level: usize) -> *mut Slot {
    *fwd_ptr(slot, level)
}

/// Write the level-`l` forward pointer.
#[inline]
pub unsafe fn set_fwd(slot: *mut Slot, level: usize, to: *mut Slot) {
    *fwd_ptr(slot, level) = to;
}

/// Reinitialize a slot freshly taken from a slab free list: all fields
/// cleared, every forward pointer nulled, level re-stamped.
///
/// # Safety
/// `slot` must point to slab storage sized for `level`.
pub unsafe fn reset(slot: *mut Slot, level: usize) {
    ptr::write(slot, Slot::blank(level as u8));
    let mut l = 1;
    while l <= level {
        set_fwd(slot, l, ptr::null_mut());
        l += 1;
    }
}

/// Statically sized head of an ordered map: a slot body with the full
/// MAX_LEVEL forward array inline. Never carries a chunk itself.
#[repr(C)]
pub struct HeadSlot {
    slot: Slot,
    _rest: [*mut Slot; MAX_LEVEL - 1],
}

impl HeadSlot {
    pub fn new() -> HeadSlot {
        let mut head = HeadSlot {
            slot: Slot::blank((MAX_LEVEL - 1) as u8),
            _rest: [ptr::null_mut(); MAX_LEVEL - 1],
        };
        head.slot.flags = SlotFlags::ADMIN;
        head
    }

    /// Raw slot view of the head, valid for all MAX_LEVEL forwards.
    #[inline]
    pub fn as_slot(&self) -> *mut Slot {
        ptr::addr_of!(self.slot) as *mut Slot
    }
}

/// The derived pointers of one chunk, computed once per operation to
/// avoid re-deriving fence arithmetic at every use.
#[derive(Debug, Clone, Copy)]
pub struct PointerInfo {
    pub fence: bool,
    pub valloc: bool,
    /// First byte of the chunk.
    pub alloc_start: *mut u8,
    /// Start of the bottom fence, null when fences are off.
    pub fence_bottom: *mut u8,
    /// Pointer handed to the user.
    pub user_start: *mut u8,
    /// One past the user region.
    pub user_bounds: *mut u8,
    /// Start of the top fence, null when fences are off.
    pub fence_top: *mut u8,
    /// One past the usable region (chunk end minus the top fence).
    pub upper_bounds: *mut u8,
    /// One past the chunk.
    pub alloc_bounds: *mut u8,
}

impl PointerInfo {
    /// Derive the six interior pointers of a slot's chunk.
    ///
    /// A page-aligned chunk with fences reserves a whole block below the
    /// user region so the user pointer stays block-aligned with its
    /// bottom fence immediately beneath it.
    ///
    /// # Safety
    /// `slot` must point to a live slot.
    pub unsafe fn from_slot(slot: *const Slot) -> PointerInfo {
        let fence = (*slot).flags.contains(SlotFlags::FENCE);
        let valloc = (*slot).flags.contains(SlotFlags::VALLOC);
        let alloc_start = (*slot).mem;

        let (fence_bottom, user_start) = if fence {
            if valloc {
                let user = alloc_start.add(BLOCK_SIZE);
                (user.sub(FENCE_BOTTOM_SIZE), user)
            } else {
                (alloc_start, alloc_start.add(FENCE_BOTTOM_SIZE))
            }
        } else {
            (ptr::null_mut(), alloc_start)
        };

        let user_bounds = user_start.add((*slot).user_size);
        let alloc_bounds = alloc_start.add((*slot).total_size);

        let (fence_top, upper_bounds) = if fence {
            (user_bounds, alloc_bounds.sub(FENCE_TOP_SIZE))
        } else {
            (ptr::null_mut(), alloc_bounds)
        };

        PointerInfo {
            fence,
            valloc,
            alloc_start,
            fence_bottom,
            user_start,
            user_bounds,
            fence_top,
            upper_bounds,
            alloc_bounds,
        }
    }
}

/// Display adapter for a user pointer with its optional decorations
/// (seen count, iteration, time stamp, thread), used in transaction
/// narration.
#[derive(Clone, Copy)]
pub struct PntDesc {
    ptr: usize,
    iter: u64,
    #[cfg(feature = "seen_count")]
    seen: u64,
    #[cfg(feature = "store_time")]
    stamp: Option<std::time::SystemTime>,
    #[cfg(feature = "store_time")]
    show_elapsed: bool,
    #[cfg(feature = "store_time")]
    show_current: bool,
    #[cfg(feature = "thread_id")]
    thread: Option<std::thread::ThreadId>,
}

impl PntDesc {
    /// # Safety
    /// `slot` must point to a live slot.
    pub unsafe fn new(user: *const u8, slot: *const Slot, flags: DebugFlags) -> PntDesc {
        #[cfg(not(feature = "store_time"))]
        let _ = flags;
        PntDesc {
            ptr: user as usize,
            iter: (*slot).use_iter,
            #[cfg(feature = "seen_count")]
            seen: (*slot).extra.seen,
            #[cfg(feature = "store_time")]
            stamp: (*slot).extra.stamp,
            #[cfg(feature = "store_time")]
            show_elapsed: flags.contains(DebugFlags::LOG_ELAPSED_TIME),
            #[cfg(feature = "store_time")]
            show_current: flags.contains(DebugFlags::LOG_CURRENT_TIME),
            #[cfg(feature = "thread_id")]
            thread: (*slot).extra.thread,
        }
    }
}

impl fmt::Display for PntDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)?;
        #[cfg(feature = "seen_count")]
        write!(f, "|s{}", self.seen)?;
        write!(f, "|i{}", self.iter)?;
        #[cfg(feature = "store_time")]
        if let Some(stamp) = self.stamp {
            if self.show_elapsed {
                let secs = stamp.elapsed().map(|d| d.as_secs()).unwrap_or(0);
                write!(f, "|w{}s", secs)?;
            } else if self.show_current {
                let secs = stamp
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                write!(f, "|w{}", secs)?;
            }
        }
        #[cfg(feature = "thread_id")]
        if let Some(t) = self.thread {
            write!(f, "|t{:?}", t)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FENCE_OVERHEAD;

    #[test]
    fn slot_sizes_grow_by_one_pointer() {
        let base = Slot::size_for_level(0);
        for level in 1..MAX_LEVEL {
            assert_eq!(
                Slot::size_for_level(level),
                base + level * size_of::<*mut Slot>()
            );
        }
    }

    // Vec<u64> backing keeps the storage aligned for Slot.
    fn slot_storage(level: usize) -> Vec<u64> {
        vec![0u64; Slot::size_for_level(level).div_ceil(8)]
    }

    #[test]
    fn reset_clears_forwards() {
        let level = 3;
        let mut storage = slot_storage(level);
        let slot = storage.as_mut_ptr() as *mut Slot;
        unsafe {
            reset(slot, level);
            assert_eq!((*slot).level as usize, level);
            assert_eq!((*slot).flags, SlotFlags::empty());
            for l in 0..=level {
                assert!(fwd(slot, l).is_null());
            }
        }
    }

    #[test]
    fn pointer_info_plain_fence() {
        let mut chunk = vec![0u8; 64];
        let mut storage = slot_storage(0);
        let slot = storage.as_mut_ptr() as *mut Slot;
        unsafe {
            reset(slot, 0);
            (*slot).flags = SlotFlags::USER | SlotFlags::FENCE;
            (*slot).mem = chunk.as_mut_ptr();
            (*slot).total_size = 64;
            (*slot).user_size = 64 - FENCE_OVERHEAD;

            let info = PointerInfo::from_slot(slot);
            assert_eq!(info.fence_bottom, info.alloc_start);
            assert_eq!(info.user_start as usize, info.alloc_start as usize + FENCE_BOTTOM_SIZE);
            assert_eq!(info.fence_top, info.user_bounds);
            assert_eq!(info.upper_bounds as usize, info.alloc_bounds as usize - FENCE_TOP_SIZE);
        }
    }

    #[test]
    fn pointer_info_valloc_fence() {
        let layout = std::alloc::Layout::from_size_align(2 * BLOCK_SIZE, BLOCK_SIZE).unwrap();
        let chunk = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!chunk.is_null());
        let mut storage = slot_storage(0);
        let slot = storage.as_mut_ptr() as *mut Slot;
        unsafe {
            reset(slot, 0);
            (*slot).flags = SlotFlags::USER | SlotFlags::FENCE | SlotFlags::VALLOC;
            (*slot).mem = chunk;
            (*slot).total_size = 2 * BLOCK_SIZE;
            (*slot).user_size = 1;

            let info = PointerInfo::from_slot(slot);
            assert_eq!(info.user_start as usize % BLOCK_SIZE, 0);
            assert_eq!(info.user_start as usize, info.alloc_start as usize + BLOCK_SIZE);
            assert_eq!(info.fence_bottom as usize, info.user_start as usize - FENCE_BOTTOM_SIZE);
            std::alloc::dealloc(chunk, layout);
        }
    }

    #[test]
    fn origin_renders_both_variants() {
        let src = Origin::Source { file: "lib/io.rs", line: 42 };
        assert_eq!(format!("{}", src), "lib/io.rs:42");
        assert_eq!(format!("{}", Origin::Caller(0x1234)), "ra=0x1234");
        assert_eq!(format!("{}", Origin::Unknown), "unknown");
    }
}
