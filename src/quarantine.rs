//! # Quarantine Queue
//!
//! Freed chunks are not offered for reuse immediately: they wait here,
//! in FIFO order, for a few allocation iterations. A write through a
//! stale pointer during the dwell time lands in blanked memory and is
//! caught when the chunk finally moves to the free-size map and gets
//! reused under `CHECK_BLANK`.

use crate::config::FREED_POINTER_DELAY;
use crate::error::ChunkResult;
use crate::map::SkipMap;
use crate::slot::{fwd, set_fwd, Slot};
use core::ptr;

/// Singly linked FIFO threaded through the slots' level-0 forward
/// pointers. A quarantined slot is in no map (invariant: one list per
/// slot), so the pointer is free for this use.
pub struct Quarantine {
    head: *mut Slot,
    tail: *mut Slot,
    len: usize,
}

impl Quarantine {
    pub fn new() -> Quarantine {
        Quarantine {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First waiting slot (oldest), null when empty. Walks follow
    /// `fwd(slot, 0)`.
    pub fn head(&self) -> *mut Slot {
        self.head
    }

    /// Park a freed slot at the tail.
    ///
    /// # Safety
    /// `slot` must be live and on no other list.
    pub unsafe fn push(&mut self, slot: *mut Slot) {
        set_fwd(slot, 0, ptr::null_mut());
        if self.head.is_null() {
            self.head = slot;
        } else {
            set_fwd(self.tail, 0, slot);
        }
        self.tail = slot;
        self.len += 1;
    }

    /// Move every slot whose dwell time has expired into the free-size
    /// map. Called before any reuse attempt.
    ///
    /// # Safety
    /// All queued slots must be live; `free_map` must be the size map.
    pub unsafe fn drain(&mut self, iter: u64, free_map: &mut SkipMap) -> ChunkResult<()> {
        while !self.head.is_null() {
            let slot = self.head;
            if (*slot).use_iter + FREED_POINTER_DELAY > iter {
                // the head is the oldest entry; nothing behind it is ready
                break;
            }

            let next = fwd(slot, 0);
            free_map.insert(slot)?;

            self.head = next;
            self.len -= 1;
            if next.is_null() {
                self.tail = ptr::null_mut();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::SlotFlags;
    use crate::map::MapOrder;
    use crate::slot::reset;

    fn make_slot(storage: &mut Vec<Vec<u64>>, size: usize, iter: u64) -> *mut Slot {
        storage.push(vec![0u64; Slot::size_for_level(0).div_ceil(8)]);
        let slot = storage.last_mut().unwrap().as_mut_ptr() as *mut Slot;
        unsafe {
            reset(slot, 0);
            (*slot).flags = SlotFlags::FREE;
            (*slot).mem = (0x1000 * storage.len()) as *mut u8;
            (*slot).total_size = size;
            (*slot).use_iter = iter;
        }
        slot
    }

    #[test]
    fn drains_in_fifo_order_after_delay() {
        let mut storage = Vec::new();
        let mut quarantine = Quarantine::new();
        let mut free_map = SkipMap::new(MapOrder::BySize);

        unsafe {
            let early = make_slot(&mut storage, 64, 1);
            let late = make_slot(&mut storage, 128, 5);
            quarantine.push(early);
            quarantine.push(late);
            assert_eq!(quarantine.len(), 2);

            // not enough iterations for anyone
            quarantine.drain(2, &mut free_map).unwrap();
            assert_eq!(quarantine.len(), 2);
            assert!(free_map.is_empty());

            // the early slot is ready, the late one still dwells
            quarantine.drain(1 + FREED_POINTER_DELAY, &mut free_map).unwrap();
            assert_eq!(quarantine.len(), 1);
            assert_eq!(free_map.len(), 1);
            assert_eq!(quarantine.head(), late);

            quarantine.drain(5 + FREED_POINTER_DELAY, &mut free_map).unwrap();
            assert!(quarantine.is_empty());
            assert_eq!(free_map.len(), 2);
            assert!(quarantine.head().is_null());
        }
    }
}
