//! Dump and restore of the callout table.
//!
//! The on-disk shape is the live table, not a re-encoding of it: a fixed
//! header, one record per live slot (heap region first, then the wheel
//! region including its free-listed slots, whose link fields ride along in
//! the same three words), and the 128-entry bucket table. Millisecond
//! deadlines are stored in their tagged encoded form so they survive a
//! capacity change; wheel links are raw arena indices, rebound on restore by
//! the difference between the old and new capacity.
//!
//! Expired callouts get no representation of their own: before writing, the
//! running and immediate lists are spliced onto the front of the bucket for
//! the current second (in the write-side copy only), and restore peels the
//! first `nzero` entries back off that bucket.
//!
//! All fields are little-endian `u32`.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use crate::clock::Clock;
use crate::slot::Idx;
use crate::stamp;
use crate::wheel::{Bucket, WHEEL_MASK, WHEEL_SIZE};
use crate::{CallWheel, CalloutError};

#[derive(Clone, Copy, Default)]
struct Record {
    handle: u32,
    obj: u32,
    time: u32,
}

impl<C: Clock> CallWheel<C> {
    /// Serialize the callout table. The table itself is left untouched.
    pub fn dump<W: Write>(&mut self, w: &mut W) -> Result<(), CalloutError> {
        let _ = self.time();

        let cap = self.arena.capacity;
        let queuebrk = self.arena.queuebrk;
        let cycbrk = self.arena.cycbrk;

        let mut recs: Vec<Record> = Vec::with_capacity((queuebrk + cap + 1 - cycbrk) as usize);
        for i in 1..=queuebrk {
            let s = self.arena.at(i);
            recs.push(Record {
                handle: s.handle,
                obj: s.obj,
                time: if s.mtime != 0 {
                    stamp::encode(s.time, s.mtime, self.timediff)
                } else {
                    s.time
                },
            });
        }
        for i in cycbrk..=cap {
            let s = self.arena.at(i);
            recs.push(Record {
                handle: s.handle,
                obj: s.obj,
                time: s.time,
            });
        }

        // record position of a wheel-region arena index
        let pos = |i: Idx| -> usize { (queuebrk + i.get() - cycbrk) as usize };

        let mut buckets = self.wheel.buckets;
        if self.wheel.nzero != 0 {
            let (head, last) = if !self.wheel.running.head.is_none() {
                if !self.wheel.immediate.head.is_none() {
                    recs[pos(self.wheel.running.tail)].time = self.wheel.immediate.head.get();
                    (self.wheel.running.head, self.wheel.immediate.tail)
                } else {
                    (self.wheel.running.head, self.wheel.running.tail)
                }
            } else {
                (self.wheel.immediate.head, self.wheel.immediate.tail)
            };
            let cur = (self.timestamp & WHEEL_MASK) as usize;
            recs[pos(last)].time = buckets[cur].head.get();
            buckets[cur].head = head;
        }

        w.write_u32::<LittleEndian>(cap)?;
        w.write_u32::<LittleEndian>(queuebrk)?;
        w.write_u32::<LittleEndian>(cycbrk)?;
        w.write_u32::<LittleEndian>(self.arena.flist.get())?;
        w.write_u32::<LittleEndian>(self.wheel.nshort)?;
        w.write_u32::<LittleEndian>(queuebrk + self.wheel.nzero)?;
        w.write_u32::<LittleEndian>(self.timestamp)?;
        w.write_u32::<LittleEndian>(self.timediff)?;
        for r in &recs {
            w.write_u32::<LittleEndian>(r.handle)?;
            w.write_u32::<LittleEndian>(r.obj)?;
            w.write_u32::<LittleEndian>(r.time)?;
        }
        for b in &buckets {
            w.write_u32::<LittleEndian>(b.head.get())?;
            w.write_u32::<LittleEndian>(b.tail.get())?;
        }
        Ok(())
    }

    /// Rebuild the callout table from a dump, against wall-second `now`.
    ///
    /// The arena may have a different capacity than the one dumped; all
    /// stored indices are rebound by the difference. Whole-second deadlines
    /// slide forward by the outage (`now` minus the dumped timestamp) via
    /// `timediff`, so stored deadline words held by calling code stay valid.
    pub fn restore<R: Read>(&mut self, r: &mut R, now: u32) -> Result<(), CalloutError> {
        let cap = self.arena.capacity;
        let d_cotabsz = r.read_u32::<LittleEndian>()?;
        let d_queuebrk = r.read_u32::<LittleEndian>()?;
        let d_cycbrk = r.read_u32::<LittleEndian>()?;
        let d_flist = r.read_u32::<LittleEndian>()?;
        let d_nshort = r.read_u32::<LittleEndian>()?;
        let d_nlong0 = r.read_u32::<LittleEndian>()?;
        let d_timestamp = r.read_u32::<LittleEndian>()?;
        let d_timediff = r.read_u32::<LittleEndian>()?;

        let offset = cap as i64 - d_cotabsz as i64;
        let new_cycbrk = d_cycbrk as i64 + offset;
        if d_queuebrk as i64 >= new_cycbrk || new_cycbrk < 1 {
            return Err(CalloutError::RestoreOverflow);
        }
        let nzero = d_nlong0
            .checked_sub(d_queuebrk)
            .ok_or(CalloutError::RestoreOverflow)?;
        let new_cycbrk = new_cycbrk as u32;

        let n = (d_queuebrk + (d_cotabsz + 1 - d_cycbrk)) as usize;
        let mut recs = vec![Record::default(); n];
        for rec in recs.iter_mut() {
            rec.handle = r.read_u32::<LittleEndian>()?;
            rec.obj = r.read_u32::<LittleEndian>()?;
            rec.time = r.read_u32::<LittleEndian>()?;
        }
        let mut buf = [Bucket::default(); WHEEL_SIZE];
        for b in buf.iter_mut() {
            b.head = Idx::new(r.read_u32::<LittleEndian>()?);
            b.tail = Idx::new(r.read_u32::<LittleEndian>()?);
        }

        let shift = |i: u32| -> Idx { Idx::new((i as i64 + offset) as u32) };

        self.arena.queuebrk = d_queuebrk;
        self.arena.cycbrk = new_cycbrk;
        self.arena.flist = if d_flist != 0 { shift(d_flist) } else { Idx::NONE };
        self.wheel.nshort = d_nshort;
        self.wheel.nzero = nzero;
        self.wheel.immediate = Bucket::default();
        self.wheel.running = Bucket::default();
        self.timestamp = now;
        let elapsed = now.wrapping_sub(d_timestamp);
        self.timediff = d_timediff.wrapping_add(elapsed);

        for (k, rec) in recs[..d_queuebrk as usize].iter().enumerate() {
            let (time, mtime) = if stamp::is_encoded(rec.time) {
                stamp::decode(rec.time, self.timestamp, self.timediff)
            } else {
                (rec.time.wrapping_add(elapsed), 0)
            };
            let s = self.arena.at_mut(k as u32 + 1);
            s.handle = rec.handle;
            s.obj = rec.obj;
            s.time = time;
            s.mtime = mtime;
        }
        for (k, rec) in recs[d_queuebrk as usize..].iter().enumerate() {
            let s = self.arena.at_mut(new_cycbrk + k as u32);
            s.handle = rec.handle;
            s.obj = rec.obj;
            s.time = rec.time;
            s.mtime = 0;
            if offset != 0 {
                if s.is_vacant() {
                    let p = s.prev().get();
                    s.set_prev(Idx::new((p as i64 + offset) as u32));
                }
                if !s.next().is_none() {
                    let nx = s.next().get();
                    s.set_next(Idx::new((nx as i64 + offset) as u32));
                }
            }
        }

        // rotate the bucket table forward by the outage, rebinding indices
        let rot = (elapsed & WHEEL_MASK) as usize;
        for (j, b) in buf.iter().enumerate() {
            let mut b = *b;
            if offset != 0 && !b.head.is_none() {
                b.head = shift(b.head.get());
                b.tail = shift(b.tail.get());
            }
            self.wheel.buckets[(j + rot) & (WHEEL_SIZE - 1)] = b;
        }

        // peel the spliced immediate callouts off the current bucket
        if nzero != 0 {
            let cur = (self.timestamp & WHEEL_MASK) as usize;
            let head = self.wheel.buckets[cur].head;
            let mut last = head;
            for _ in 1..nzero {
                last = self.arena.slot(last).next();
            }
            self.wheel.immediate = Bucket { head, tail: last };
            self.arena.slot_mut(head).set_count(nzero as u16);
            self.wheel.buckets[cur].head = self.arena.slot(last).next();
            self.arena.slot_mut(last).set_next(Idx::NONE);
        }

        // rebuild per-bucket counts by walking the lists
        for b in 0..WHEEL_SIZE {
            let head = self.wheel.buckets[b].head;
            if !head.is_none() {
                let mut count = 0u16;
                let mut i = head;
                while !i.is_none() {
                    count += 1;
                    i = self.arena.slot(i).next();
                }
                self.arena.slot_mut(head).set_count(count);
            }
        }

        // recompute the wheel timeout and program the alarm
        self.timeout = 0;
        if self.wheel.nshort != self.wheel.nzero {
            for off in 0..WHEEL_SIZE as u32 {
                let b = ((self.timestamp.wrapping_add(off)) & WHEEL_MASK) as usize;
                if !self.wheel.buckets[b].head.is_none() {
                    self.timeout = self.timestamp.wrapping_add(off);
                    break;
                }
            }
        }
        self.atimeout = 0;
        self.amtime = 0;
        self.restart(self.timeout);

        debug!(
            nshort = self.wheel.nshort,
            nlong = self.arena.queuebrk,
            timediff = self.timediff,
            "restored callout table"
        );
        Ok(())
    }
}
