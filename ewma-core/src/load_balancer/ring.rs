//! Fixed-capacity sample ring with lock-free concurrent writers.
//!
//! Writers claim a monotonically increasing index with a single
//! `fetch_add`, then claim the slot itself by swinging its sequence word
//! to a "writing" marker, store the sample and publish the index with a
//! `Release` store. The drain reads the sequence word before and after the
//! sample, seqlock style, so a half-written slot is never mistaken for a
//! complete one. Every slot is independent: writers to different slots, or
//! to different hosts, never contend.

use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Set while the slot's sample is being written.
const WRITING: u64 = 1 << 63;
/// The index in the sequence word was claimed but its sample was lost.
const DROPPED: u64 = 1 << 62;
const SEQ_MASK: u64 = DROPPED - 1;

/// A single round-trip-time observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttSample {
    /// Round-trip time in milliseconds.
    pub rtt_ms: f64,
    /// Monotonic timestamp in nanoseconds.
    pub timestamp_ns: u64,
}

/// One ring slot. The low bits of `seq` hold the claimed write index plus
/// one (zero means never written); the top bits are `WRITING`/`DROPPED`.
#[derive(Debug, Default)]
struct Slot {
    seq: AtomicU64,
    rtt_bits: AtomicU64,
    timestamp_ns: AtomicU64,
}

impl Slot {
    /// Store the sample for `seq` and publish it. The caller owns the slot
    /// through a `WRITING | seq` marker.
    fn finish_write(&self, seq: u64, rtt_ms: f64, timestamp_ns: u64) {
        fence(Ordering::Release);
        self.rtt_bits.store(rtt_ms.to_bits(), Ordering::Relaxed);
        self.timestamp_ns.store(timestamp_ns, Ordering::Relaxed);
        self.publish(seq);
    }

    /// Clear the writing marker. If a newer index took the slot over while
    /// the sample was being stored, the slot is left as a lost sample for
    /// that index instead.
    fn publish(&self, seq: u64) {
        let mut claimed = WRITING | seq;
        loop {
            let owner = claimed & SEQ_MASK;
            let published = if owner == seq { seq } else { DROPPED | owner };
            match self
                .seq
                .compare_exchange_weak(claimed, published, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => claimed = actual,
            }
        }
    }
}

/// What the drain found at a given write index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum SlotRead {
    /// The sample written at this index.
    Ready(RttSample),
    /// A later write replaced this index, or its sample was lost.
    Overwritten,
    /// The index is claimed but its writer has not published yet.
    Pending,
}

/// Bounded circular buffer of [`RttSample`]s.
pub struct SampleRing {
    slots: Box<[Slot]>,
    write_cursor: AtomicU64,
}

impl SampleRing {
    /// Create a ring with room for `capacity` samples (at least one).
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1)).map(|_| Slot::default()).collect();
        Self {
            slots,
            write_cursor: AtomicU64::new(0),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Total number of samples ever appended. Never wraps.
    pub fn write_cursor(&self) -> u64 {
        self.write_cursor.load(Ordering::Acquire)
    }

    /// Append a sample. Safe from any number of threads and never waits on
    /// other writers or the drain.
    ///
    /// When two writers meet on one slot, only one sample survives: a
    /// sample older than the slot's current index is dropped, and a writer
    /// finding the slot mid-write hands it to its own index and drops its
    /// sample.
    pub fn push(&self, rtt_ms: f64, timestamp_ns: u64) {
        let index = self.write_cursor.fetch_add(1, Ordering::AcqRel);
        let slot = &self.slots[self.slot_index(index)];
        let seq = index + 1;

        let mut current = slot.seq.load(Ordering::Acquire);
        loop {
            if current & SEQ_MASK >= seq {
                return;
            }
            let taking_over = current & WRITING != 0;
            match slot.seq.compare_exchange_weak(
                current,
                WRITING | seq,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if taking_over => return,
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        slot.finish_write(seq, rtt_ms, timestamp_ns);
    }

    /// Inspect the slot that write index `index` maps to.
    pub(crate) fn read(&self, index: u64) -> SlotRead {
        let slot = &self.slots[self.slot_index(index)];
        let expected = index + 1;

        let before = slot.seq.load(Ordering::Acquire);
        let seq = before & SEQ_MASK;
        if seq > expected || (seq == expected && before & DROPPED != 0) {
            return SlotRead::Overwritten;
        }
        if before != expected {
            return SlotRead::Pending;
        }

        let rtt_bits = slot.rtt_bits.load(Ordering::Relaxed);
        let timestamp_ns = slot.timestamp_ns.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        // Only a newer index can claim the slot once it is published.
        if slot.seq.load(Ordering::Relaxed) != before {
            return SlotRead::Overwritten;
        }

        SlotRead::Ready(RttSample {
            rtt_ms: f64::from_bits(rtt_bits),
            timestamp_ns,
        })
    }

    fn slot_index(&self, index: u64) -> usize {
        (index % self.slots.len() as u64) as usize
    }
}

impl std::fmt::Debug for SampleRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleRing")
            .field("capacity", &self.capacity())
            .field("write_cursor", &self.write_cursor())
            .finish()
    }
}
