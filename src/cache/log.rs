use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use crate::config::{BUCKET_WAYS, VALUE_MAX};
use crate::key::KeyFingerprint;

/// Byte size of one log record. Offsets handed to bucket slots are
/// multiples of this.
pub const ENTRY_SIZE: u64 = mem::size_of::<LogEntry>() as u64;

const IN_USE: u64 = 1 << 63;
const OFFSET_MASK: u64 = IN_USE - 1;

/// Payload of a log record, guarded by the record's version counter.
#[repr(C)]
#[derive(Clone, Copy)]
struct EntryData {
    key: KeyFingerprint,
    val_len: u16,
    value: [u8; VALUE_MAX],
}

/// One record in the circular log.
///
/// `meta` is the entry's version counter: odd means a write is in
/// progress, even means stable. A read that observes the same even
/// version before and after copying the payload is consistent.
pub struct LogEntry {
    meta: AtomicU64,
    data: UnsafeCell<EntryData>,
}

// Safety: `data` is only written between an odd and the following even
// `meta` transition, and readers discard any copy whose surrounding
// version observations disagree or are odd.
unsafe impl Sync for LogEntry {}

impl LogEntry {
    fn new() -> LogEntry {
        LogEntry {
            meta: AtomicU64::new(0),
            data: UnsafeCell::new(EntryData {
                key: KeyFingerprint::from_parts(0, 0),
                val_len: 0,
                value: [0; VALUE_MAX],
            }),
        }
    }
}

struct Slot {
    tag: AtomicU64,
    /// Bit 63: in_use. Low bits: byte offset of the record in the log.
    state: AtomicU64,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            tag: AtomicU64::new(0),
            state: AtomicU64::new(0),
        }
    }
}

struct Bucket {
    slots: [Slot; BUCKET_WAYS],
}

impl Bucket {
    fn new() -> Bucket {
        Bucket {
            slots: std::array::from_fn(|_| Slot::new()),
        }
    }
}

/// An associative log: an open-addressed bucket array over a circular
/// record log. Readers are lock-free; writers serialize per record via
/// the version counter's odd phase.
///
/// A slot is valid iff the log head has not wrapped past its record:
/// `log_head - offset < log_cap`.
pub struct HashLog {
    buckets: Box<[Bucket]>,
    bucket_mask: u64,
    entries: Box<[LogEntry]>,
    /// Bytes appended since creation; monotonically increasing.
    log_head: AtomicU64,
    /// Capacity of the circular log in bytes.
    log_cap: u64,
}

impl HashLog {
    /// Creates a log with `buckets` buckets (power of two) and
    /// `log_slots` record slots.
    pub fn new(buckets: usize, log_slots: usize) -> HashLog {
        assert!(buckets.is_power_of_two());
        assert!(log_slots >= 1);
        HashLog {
            buckets: (0..buckets).map(|_| Bucket::new()).collect(),
            bucket_mask: buckets as u64 - 1,
            entries: (0..log_slots).map(|_| LogEntry::new()).collect(),
            log_head: AtomicU64::new(0),
            log_cap: log_slots as u64 * ENTRY_SIZE,
        }
    }

    fn bucket_of(&self, key: &KeyFingerprint) -> &Bucket {
        &self.buckets[(key.bucket & self.bucket_mask) as usize]
    }

    fn entry_at(&self, offset: u64) -> &LogEntry {
        let idx = (offset / ENTRY_SIZE) as usize % self.entries.len();
        &self.entries[idx]
    }

    fn offset_is_live(&self, offset: u64) -> bool {
        self.log_head.load(Ordering::Acquire) - offset < self.log_cap
    }

    /// Lock-free versioned read. On a hit, copies the value into `out`
    /// and returns its length.
    pub fn get(&self, key: &KeyFingerprint, out: &mut [u8; VALUE_MAX]) -> Option<u16> {
        let bucket = self.bucket_of(key);
        for slot in &bucket.slots {
            let tag = slot.tag.load(Ordering::Acquire);
            let state = slot.state.load(Ordering::Acquire);
            if state & IN_USE == 0 || tag != key.tag {
                continue;
            }
            let offset = state & OFFSET_MASK;
            if !self.offset_is_live(offset) {
                // The log wrapped over this record; the slot is dead.
                return None;
            }
            return self.read_entry(self.entry_at(offset), key, out);
        }
        None
    }

    /// The version-consistency protocol: retry until the same even
    /// version brackets the payload copy.
    fn read_entry(
        &self,
        entry: &LogEntry,
        key: &KeyFingerprint,
        out: &mut [u8; VALUE_MAX],
    ) -> Option<u16> {
        loop {
            let m0 = entry.meta.load(Ordering::Acquire);
            if m0 & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            // Safety: the copy is discarded unless the version check
            // below passes, per the seqlock contract on `meta`.
            let data = unsafe { ptr::read_volatile(entry.data.get()) };
            fence(Ordering::Acquire);
            let m1 = entry.meta.load(Ordering::Acquire);
            if m0 != m1 {
                continue;
            }
            // The record may have been reclaimed for a different key
            // after the slot was read; reject by fingerprint.
            if data.key != *key {
                return None;
            }
            out[..data.val_len as usize].copy_from_slice(&data.value[..data.val_len as usize]);
            return Some(data.val_len);
        }
    }

    /// Writes the record under its version lock: advance to odd, store
    /// the payload, publish even.
    fn write_entry(&self, entry: &LogEntry, key: &KeyFingerprint, value: &[u8]) {
        let mut m = entry.meta.load(Ordering::Relaxed);
        loop {
            if m & 1 == 1 {
                std::hint::spin_loop();
                m = entry.meta.load(Ordering::Relaxed);
                continue;
            }
            match entry
                .meta
                .compare_exchange_weak(m, m + 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(cur) => m = cur,
            }
        }
        let mut data = EntryData {
            key: *key,
            val_len: value.len() as u16,
            value: [0; VALUE_MAX],
        };
        data.value[..value.len()].copy_from_slice(value);
        // Safety: the odd `meta` phase acquired above excludes other
        // writers; readers discard copies that overlap this store.
        unsafe { ptr::write_volatile(entry.data.get(), data) };
        entry.meta.store(m + 2, Ordering::Release);
    }

    /// Inserts or updates `key`. An existing live entry with the same
    /// tag is updated in place (the version still advances even when
    /// the value bits are unchanged); otherwise a fresh record is
    /// appended and a bucket slot claimed.
    pub fn put(&self, key: &KeyFingerprint, value: &[u8]) {
        debug_assert!(value.len() <= VALUE_MAX);
        let bucket = self.bucket_of(key);

        for slot in &bucket.slots {
            let tag = slot.tag.load(Ordering::Acquire);
            let state = slot.state.load(Ordering::Acquire);
            if state & IN_USE == 0 || tag != key.tag {
                continue;
            }
            let offset = state & OFFSET_MASK;
            if self.offset_is_live(offset) {
                self.write_entry(self.entry_at(offset), key, value);
                return;
            }
            // Dead slot with our tag: reclaim it with a fresh record.
            let new_offset = self.append_record(key, value);
            slot.state.store(new_offset | IN_USE, Ordering::Release);
            return;
        }

        let new_offset = self.append_record(key, value);
        let victim = self.pick_victim(bucket);
        victim.tag.store(key.tag, Ordering::Release);
        victim.state.store(new_offset | IN_USE, Ordering::Release);
    }

    fn append_record(&self, key: &KeyFingerprint, value: &[u8]) -> u64 {
        let offset = self.log_head.fetch_add(ENTRY_SIZE, Ordering::AcqRel);
        self.write_entry(self.entry_at(offset), key, value);
        offset
    }

    /// Victim policy: first unused or wrapped slot, else the slot with
    /// the oldest record.
    fn pick_victim<'a>(&self, bucket: &'a Bucket) -> &'a Slot {
        let mut oldest: &Slot = &bucket.slots[0];
        let mut oldest_offset = u64::MAX;
        for slot in &bucket.slots {
            let state = slot.state.load(Ordering::Acquire);
            if state & IN_USE == 0 {
                return slot;
            }
            let offset = state & OFFSET_MASK;
            if !self.offset_is_live(offset) {
                return slot;
            }
            if offset < oldest_offset {
                oldest_offset = offset;
                oldest = slot;
            }
        }
        oldest
    }

    /// Advances the log head by `records` without installing entries.
    /// Test hook for exercising wrap invalidation.
    #[cfg(test)]
    pub(crate) fn force_wrap(&self, records: u64) {
        self.log_head
            .fetch_add(records * ENTRY_SIZE, Ordering::AcqRel);
    }
}
