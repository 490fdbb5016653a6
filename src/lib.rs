//! Time-driven callout scheduler for a persistent object interpreter.
//!
//! A callout is a deferred invocation of a named method on a scripted
//! object, enqueued to fire after a delay of zero, whole seconds, or
//! milliseconds. Pending callouts share one fixed-capacity slot arena split
//! between a binary min-heap (millisecond-precise or far-future deadlines)
//! and a 128-bucket cyclic time-wheel (near whole-second deadlines), so the
//! scheduler admits large pending sets while keeping admission, cancellation
//! and dispatch cheap. State survives process restarts through
//! [`CallWheel::dump`] / [`CallWheel::restore`], which rebind arena indices
//! across capacity changes and slide whole-second deadlines forward by the
//! outage.
//!
//! The scheduler is single-threaded and cooperative: it is a plain value
//! owned by the embedding interpreter, and the only reentry point is
//! [`Host::invoke`], which receives the scheduler back so callout bodies can
//! enqueue and cancel further callouts mid-drain.

use std::fmt;

use tracing::{trace, warn};

use crate::arena::Arena;
use crate::swap::SwapRate;
use crate::wheel::{Bucket, ListId, Wheel, WHEEL_MASK};

mod arena;
mod clock;
mod dump;
mod heap;
mod slot;
mod stamp;
mod swap;
mod wheel;

pub use clock::{Clock, ManualClock, SystemClock, MS_NONE};
pub use slot::{Handle, ObjId};
pub use wheel::WHEEL_SIZE;

/// Default bound on how far one dispatch tick may advance after a clock
/// jump, in seconds.
pub const MAX_LAG_SECS: u32 = 60;

#[derive(Debug, thiserror::Error)]
pub enum CalloutError {
    /// Admitting the requested callouts would exhaust the arena.
    #[error("too many callouts")]
    TooMany,
    /// The delay arithmetic would overflow the seconds counter.
    #[error("too long delay")]
    TooLong,
    /// A dump holds more state than the restoring arena can carry.
    #[error("restored too many callouts")]
    RestoreOverflow,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Where an admitted callout will live until it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Ready now; goes straight to the immediate list.
    Immediate,
    /// Whole-second deadline inside the wheel window.
    Wheel,
    /// Millisecond-precise or beyond the wheel horizon; heap-resident.
    Queue,
}

/// Outcome of [`CallWheel::check`]: the routing decision plus the deadline
/// both in stored form (handed back to calling code, keys `del` and
/// `remaining`) and as the absolute `(sec, ms)` pair `enqueue` consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub route: Route,
    pub stored: u32,
    pub sec: u32,
    pub ms: u16,
}

/// Time until the next callout falls due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Something is ready; dispatch without sleeping.
    Immediate,
    /// Nothing is pending at all.
    Infinite,
    After { sec: u32, ms: u16 },
}

/// Remaining life of one stored deadline, as reported by
/// [`CallWheel::remaining`] and [`CallWheel::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Immediate,
    /// Whole seconds; negative when overdue.
    Seconds(i64),
    /// Millisecond-precise; negative when overdue.
    Millis(i64),
}

/// One row of a callout listing. Callers fill `obj`, `handle` and `stored`;
/// [`CallWheel::list`] rewrites `remaining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListEntry {
    pub obj: ObjId,
    pub handle: Handle,
    pub stored: u32,
    pub remaining: Remaining,
}

impl ListEntry {
    pub fn new(obj: ObjId, handle: Handle, stored: u32) -> Self {
        Self {
            obj,
            handle,
            stored,
            remaining: Remaining::Immediate,
        }
    }
}

/// Interpreter-side collaborators used while draining expired callouts.
///
/// The scheduler holds only `(ObjId, Handle)` pairs; the host owns the
/// object table and the per-callout payload (method name and arguments).
pub trait Host<C: Clock> {
    /// Raised by a callout body. Caught by the drain loop, which logs and
    /// moves on to the next element.
    type Error: fmt::Display;

    /// Rehydrate the stored method name and argument count for dispatch.
    fn fetch_args(&mut self, obj: ObjId, handle: Handle) -> (String, usize);

    /// Resolve the object and invoke `method` on it. The scheduler is
    /// passed back in so the body may enqueue or cancel callouts; the
    /// element being dispatched has already left the running list.
    ///
    /// `Ok(false)` means the method does not exist; the callout is dropped
    /// silently.
    fn invoke(
        &mut self,
        co: &mut CallWheel<C>,
        obj: ObjId,
        method: &str,
        nargs: usize,
    ) -> Result<bool, Self::Error>;
}

/// The callout scheduler.
pub struct CallWheel<C: Clock> {
    pub(crate) arena: Arena,
    pub(crate) wheel: Wheel,
    pub(crate) swap: SwapRate,
    pub(crate) clock: C,
    /// Whole-second "now" as known to the scheduler; never decreases.
    pub(crate) timestamp: u32,
    /// Deadline of the earliest wheel-resident callout, 0 if none.
    pub(crate) timeout: u32,
    /// The pair currently programmed into the alarm.
    pub(crate) atimeout: u32,
    pub(crate) amtime: u16,
    /// Offset between dumped and observed clock, absorbed into every
    /// whole-second deadline loaded from disk.
    pub(crate) timediff: u32,
    pub(crate) max_lag: u32,
}

impl<C: Clock> CallWheel<C> {
    /// Scheduler with room for `max` pending callouts. `max == 0` builds a
    /// disabled scheduler whose `check` admits nothing.
    pub fn new(max: u16, clock: C) -> Self {
        Self::with_max_lag(max, clock, MAX_LAG_SECS)
    }

    /// Like [`CallWheel::new`] with an explicit clock-jump catch-up bound.
    pub fn with_max_lag(max: u16, mut clock: C, max_lag: u32) -> Self {
        let (now, _) = clock.now();
        // stored whole-second deadlines share the word with the tag bytes
        // 0 and 1, so the clock must be past the early seventies
        assert!(max == 0 || now >> 24 > 1, "bad time (early seventies)");
        Self {
            arena: Arena::new(max),
            wheel: Wheel::new(),
            swap: SwapRate::new(now),
            clock,
            timestamp: 0,
            timeout: 0,
            atimeout: 0,
            amtime: 0,
            timediff: 0,
            max_lag,
        }
    }

    /// The owned clock, for embedders that drive time themselves.
    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    /// Current `(sec, ms)` with the scheduler's monotone clamp applied: a
    /// clock that ran backward reads as `timestamp`, and while an alarm is
    /// pending a forward jump is capped at `max_lag` seconds so one dispatch
    /// tick stays bounded.
    pub(crate) fn time(&mut self) -> (u32, u16) {
        let (mut t, mut m) = self.clock.now();
        if t < self.timestamp {
            t = self.timestamp;
            m = 0;
        } else if self.timestamp < t {
            if self.atimeout == 0 || self.atimeout > t {
                self.timestamp = t;
            } else {
                if self.timestamp < self.atimeout - 1 {
                    self.timestamp = self.atimeout - 1;
                }
                if t > self.timestamp + self.max_lag {
                    t = self.timestamp + self.max_lag;
                    m = 0;
                }
            }
        }
        (t, m)
    }

    /// Recompute the wheel timeout (when `t != 0`, scanning forward from
    /// `t`) and reprogram the alarm if the earliest deadline moved.
    pub(crate) fn restart(&mut self, t: u32) {
        if t != 0 {
            if self.wheel.nshort != self.wheel.nzero {
                let mut found = false;
                for off in 0..WHEEL_SIZE as u32 {
                    let b = (t.wrapping_add(off) & WHEEL_MASK) as usize;
                    if !self.wheel.buckets[b].head.is_none() {
                        self.timeout = t.wrapping_add(off);
                        found = true;
                        break;
                    }
                }
                debug_assert!(found, "nshort says a bucket is occupied but none is");
                if !found {
                    self.timeout = 0;
                }
            } else {
                self.timeout = 0;
            }
        }

        let mut at = self.timeout;
        let mut am: u16 = 0;
        if let Some(root) = self.arena.heap_root() {
            if at == 0 || root.time < at || (root.time == at && root.mtime < am) {
                at = root.time;
                am = root.mtime;
            }
        }
        if at != self.atimeout || am != self.amtime {
            self.atimeout = at;
            self.amtime = am;
            self.clock.arm(at, am);
        }
    }

    /// Decide whether a callout `n` callouts into the caller's current batch
    /// (counting this one) with the given delay can be admitted, and how.
    ///
    /// `delay_ms == None` requests whole-second precision; `Some(ms)` adds a
    /// millisecond component (`ms < 1000`). Zero total delay routes to the
    /// immediate list. Returns `Ok(None)` when the scheduler is disabled.
    pub fn check(
        &mut self,
        n: u32,
        delay: u32,
        delay_ms: Option<u16>,
    ) -> Result<Option<Admission>, CalloutError> {
        if self.arena.capacity == 0 {
            return Ok(None);
        }
        debug_assert!(n >= 1, "n counts the callout being admitted");
        if self.arena.queuebrk + self.wheel.nshort + n > self.arena.capacity {
            return Err(CalloutError::TooMany);
        }

        if delay == 0 && delay_ms.map_or(true, |m| m == 0) {
            return Ok(Some(Admission {
                route: Route::Immediate,
                stored: 0,
                sec: 0,
                ms: 0,
            }));
        }

        let (now, now_ms) = self.time();
        if now.checked_add(delay).and_then(|t| t.checked_add(1)).is_none() {
            return Err(CalloutError::TooLong);
        }
        let mut t = now + delay;

        match delay_ms {
            None => {
                let route = if t < self.timestamp + WHEEL_SIZE as u32 {
                    Route::Wheel
                } else {
                    if !self.arena.heap_has_room() {
                        return Err(CalloutError::TooMany);
                    }
                    Route::Queue
                };
                Ok(Some(Admission {
                    route,
                    stored: t.wrapping_sub(self.timediff),
                    sec: t,
                    ms: 0,
                }))
            }
            Some(md) => {
                debug_assert!(md < 1000);
                let mut ms = now_ms + md;
                if ms >= 1000 {
                    ms -= 1000;
                    t += 1;
                }
                if !self.arena.heap_has_room() {
                    return Err(CalloutError::TooMany);
                }
                Ok(Some(Admission {
                    route: Route::Queue,
                    stored: stamp::encode(t, ms, self.timediff),
                    sec: t,
                    ms,
                }))
            }
        }
    }

    /// Enqueue a callout under the routing `check` decided. `handle` must be
    /// nonzero and unique per object.
    pub fn enqueue(&mut self, handle: Handle, obj: ObjId, adm: &Admission) {
        debug_assert!(handle != 0, "handle 0 marks a vacant slot");
        match adm.route {
            Route::Immediate => {
                let (i, _) = self.wheel.push(&mut self.arena, ListId::Immediate, 0);
                let s = self.arena.slot_mut(i);
                s.handle = handle;
                s.obj = obj;
            }
            Route::Wheel => {
                let t = adm.sec;
                let id = ListId::Wheel((t & WHEEL_MASK) as usize);
                let (i, first) = self.wheel.push(&mut self.arena, id, t);
                let s = self.arena.slot_mut(i);
                s.handle = handle;
                s.obj = obj;
                if first && (self.timeout == 0 || t < self.timeout) {
                    self.restart(t);
                }
            }
            Route::Queue => {
                let i = self.arena.heap_insert(adm.sec, adm.ms);
                let s = self.arena.slot_mut(i);
                s.handle = handle;
                s.obj = obj;
                if self.atimeout == 0
                    || adm.sec < self.atimeout
                    || (adm.sec == self.atimeout && adm.ms < self.amtime)
                {
                    self.restart(0);
                }
            }
        }
    }

    /// Cancel the callout `(obj, handle)` whose stored deadline is `stored`.
    ///
    /// # Panics
    ///
    /// The callout must be pending. A key that is on neither the short
    /// lists, the addressed bucket, nor the heap means the table is corrupt,
    /// and the scheduler aborts.
    pub fn del(&mut self, obj: ObjId, handle: Handle, stored: u32) {
        if !stamp::is_encoded(stored) {
            let t = stored.wrapping_add(self.timediff);
            if t <= self.timestamp {
                // possibly already matured
                if self
                    .wheel
                    .find_remove(&mut self.arena, ListId::Immediate, obj, handle, 0)
                    .is_some()
                    || self
                        .wheel
                        .find_remove(&mut self.arena, ListId::Running, obj, handle, 0)
                        .is_some()
                {
                    return;
                }
            }
            if t < self.timestamp + WHEEL_SIZE as u32 {
                let id = ListId::Wheel((t & WHEEL_MASK) as usize);
                if let Some(emptied) = self.wheel.find_remove(&mut self.arena, id, obj, handle, t) {
                    if emptied && t == self.timeout {
                        self.restart(t);
                    }
                    return;
                }
            }
        }

        // not on any short list, so the heap must hold it
        for i in 1..=self.arena.queuebrk {
            let s = self.arena.at(i);
            if s.obj == obj && s.handle == handle {
                self.arena.heap_remove(i);
                return;
            }
        }
        panic!("failed to remove callout {handle} of object {obj}");
    }

    /// Move the heap root to the immediate list.
    fn mature_root(&mut self) {
        let root = self.arena.heap_root().expect("matured an empty heap");
        let (handle, obj) = (root.handle, root.obj);
        self.arena.heap_remove(1);
        let (i, _) = self.wheel.push(&mut self.arena, ListId::Immediate, 0);
        let s = self.arena.slot_mut(i);
        s.handle = handle;
        s.obj = obj;
    }

    /// Collect everything due by now onto the immediate list and advance the
    /// swap-rate windows.
    fn expire(&mut self) {
        let (t, m) = self.time();
        if self.clock.expired() {
            while self.timestamp < t {
                self.timestamp += 1;

                while let Some(root) = self.arena.heap_root() {
                    if root.time >= self.timestamp {
                        break;
                    }
                    self.mature_root();
                }

                let ts = self.timestamp;
                self.wheel.splice_expired(&mut self.arena, ts);
            }

            while let Some(root) = self.arena.heap_root() {
                if !(root.time < t || (root.time == t && root.mtime <= m)) {
                    break;
                }
                self.mature_root();
            }

            self.restart(t);
        }

        self.swap.advance(t);
    }

    /// Dispatch every expired callout: snapshot the immediate list into the
    /// running list and invoke each element through the host. A failing
    /// body does not abort the drain.
    pub fn call<H: Host<C>>(&mut self, host: &mut H) {
        self.expire();
        self.wheel.running = self.wheel.immediate;
        self.wheel.immediate = Bucket::default();

        loop {
            let i = self.wheel.running.head;
            if i.is_none() {
                break;
            }
            let (handle, obj) = {
                let s = self.arena.slot(i);
                (s.handle, s.obj)
            };
            self.wheel.remove(&mut self.arena, ListId::Running, i, i, 0);

            let (method, nargs) = host.fetch_args(obj, handle);
            match host.invoke(self, obj, &method, nargs) {
                Ok(true) => {}
                Ok(false) => {
                    trace!(obj, handle, method = %method, "callout method missing, dropped");
                }
                Err(e) => {
                    warn!(obj, handle, method = %method, error = %e, "callout raised, drain continues");
                }
            }
        }
    }

    /// How long the embedding loop may sleep before the next dispatch.
    pub fn delay(&mut self) -> Delay {
        if self.wheel.nzero != 0 {
            return Delay::Immediate;
        }
        if self.atimeout == 0 {
            return Delay::Infinite;
        }

        let (t, m) = self.time();
        if t > self.atimeout || (t == self.atimeout && m >= self.amtime) {
            return Delay::Immediate;
        }
        if m > self.amtime {
            Delay::After {
                sec: self.atimeout - t - 1,
                ms: self.amtime + 1000 - m,
            }
        } else {
            Delay::After {
                sec: self.atimeout - t,
                ms: self.amtime - m,
            }
        }
    }

    /// `(short-term, long-term)` pending counts.
    pub fn info(&self) -> (u32, u32) {
        (self.wheel.nshort, self.arena.queuebrk)
    }

    /// Remaining life of a stored deadline.
    pub fn remaining(&mut self, stored: u32) -> Remaining {
        match stored >> 24 {
            0 => Remaining::Immediate,
            1 => {
                let (t, m) = stamp::decode(stored, self.timestamp, self.timediff);
                let (now, now_ms) = self.time();
                Remaining::Millis(
                    (t as i64 - now as i64) * 1000 + m as i64 - now_ms as i64,
                )
            }
            _ => {
                let t = stored.wrapping_add(self.timediff);
                Remaining::Seconds(t as i64 - self.timestamp as i64)
            }
        }
    }

    /// Rewrite each entry's `remaining` from its stored deadline.
    pub fn list(&mut self, entries: &mut [ListEntry]) {
        for e in entries.iter_mut() {
            e.remaining = self.remaining(e.stored);
        }
    }

    /// Record `n` objects swapped out since the last report.
    pub fn swapcount(&mut self, n: u32) {
        self.swap.count(n);
    }

    /// Objects swapped out per minute.
    pub fn swaprate1(&self) -> u32 {
        self.swap.rate1()
    }

    /// Objects swapped out per five minutes.
    pub fn swaprate5(&self) -> u32 {
        self.swap.rate5()
    }
}
