//! Binary min-heap view over the low end of the arena.
//!
//! The heap holds callouts whose deadline is millisecond-precise or beyond
//! the wheel horizon, ordered by `(seconds, ms)` lexicographically. It is
//! embedded in the arena at indices `1..=queuebrk`, so parent/child
//! arithmetic is the classical `i/2`, `2i`, `2i+1` over arena indices and
//! sift loops terminate on the explicit `j >= 1` bound.

use crate::arena::Arena;
use crate::slot::{Idx, Slot};

#[inline(always)]
fn after(s: &Slot, t: u32, m: u16) -> bool {
    s.time > t || (s.time == t && s.mtime > m)
}

impl Arena {
    #[inline]
    pub(crate) fn heap_root(&self) -> Option<&Slot> {
        (self.queuebrk != 0).then(|| self.at(1))
    }

    /// Open a hole at the next leaf, sift it up, and claim it for a callout
    /// due at `(t, m)`. The caller fills in `handle` and `obj` afterwards.
    pub(crate) fn heap_insert(&mut self, t: u32, m: u16) -> Idx {
        debug_assert!(self.queuebrk + 1 < self.cycbrk, "heap front hit the wheel");
        self.queuebrk += 1;
        let mut i = self.queuebrk;
        let mut j = i >> 1;
        while j >= 1 && after(self.at(j), t, m) {
            let parent = *self.at(j);
            *self.at_mut(i) = parent;
            i = j;
            j >>= 1;
        }
        let s = self.at_mut(i);
        s.time = t;
        s.mtime = m;
        Idx::new(i)
    }

    /// Remove the entry at heap position `i` (an arena index in
    /// `1..=queuebrk`). The last entry is moved into the hole and sifted
    /// whichever way restores order.
    pub(crate) fn heap_remove(&mut self, mut i: u32) {
        debug_assert!(i >= 1 && i <= self.queuebrk);
        let tail = self.queuebrk;
        let t = self.at(tail).time;
        let m = self.at(tail).mtime;

        if t < self.at(i).time {
            // sift upward
            let mut j = i >> 1;
            while j >= 1 && after(self.at(j), t, m) {
                let parent = *self.at(j);
                *self.at_mut(i) = parent;
                i = j;
                j >>= 1;
            }
        } else {
            // sift downward
            let mut j = i << 1;
            while j < self.queuebrk {
                if after(self.at(j), self.at(j + 1).time, self.at(j + 1).mtime) {
                    j += 1;
                }
                let child = *self.at(j);
                if t < child.time || (t == child.time && m <= child.mtime) {
                    break;
                }
                *self.at_mut(i) = child;
                i = j;
                j <<= 1;
            }
        }
        let moved = *self.at(tail);
        *self.at_mut(i) = moved;
        self.queuebrk -= 1;
    }
}
