use super::entry::{Entry, EntryHandle};
use crate::error::{Error, Result};
use crate::sync::{HybridRwLock, LockMode};
use ahash::RandomState;
use crossbeam_queue::SegQueue;
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, enabled, trace, Level};

static HASHER: Lazy<RandomState> = Lazy::new(|| {
    RandomState::with_seeds(
        0x9e3779b97f4a7c15,
        0xbf58476d1ce4e5b9,
        0x94d049bb133111eb,
        0x2545f4914f6cdd1d,
    )
});

/// Retired entries trigger a reclaim pass once this many pile up.
const RECLAIM_THRESHOLD: usize = 64;

/// Fixed 64-bit hash of `key` used to place it in the table
pub fn lookup_hash(key: &[u8]) -> u64 {
    HASHER.hash_one(key)
}

/// Newest entry first
type Chain = VecDeque<Arc<Entry>>;
type Slot = HybridRwLock<Chain>;

/// Sharded, chained hash table with per-slot and per-entry locks.
///
/// Readers capture the layout generation before taking a slot lock and retry
/// when it moved underneath them. The layout never changes today, see
/// [`HashTable::resize`].
pub struct HashTable {
    shards: Vec<Box<[Slot]>>,
    max_shards: usize,
    slot_bits: u32,
    generation: AtomicU64,
    retries: AtomicU64,
    retired: SegQueue<Arc<Entry>>,
    len: AtomicUsize,
}

impl HashTable {
    /// Table with one shard of `1 << slot_bits` slots and room for
    /// `max_shards` shards.
    pub fn new(slot_bits: u32, max_shards: usize) -> Result<Self> {
        if !(1..=28).contains(&slot_bits) {
            return Err(Error::InvalidArgument("slot_bits out of range"));
        }
        if max_shards == 0 {
            return Err(Error::InvalidArgument("max_shards must be > 0"));
        }

        let mut shards = Vec::new();
        shards
            .try_reserve_exact(max_shards)
            .map_err(|_| Error::OutOfMemory)?;
        shards.push(Self::allocate_shard(1 << slot_bits)?);

        debug!(
            "hash table: slots = {} : shards = 1/{}",
            1usize << slot_bits,
            max_shards
        );

        Ok(Self {
            shards,
            max_shards,
            slot_bits,
            generation: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            retired: SegQueue::new(),
            len: AtomicUsize::new(0),
        })
    }

    fn allocate_shard(slot_count: usize) -> Result<Box<[Slot]>> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(slot_count)
            .map_err(|_| Error::OutOfMemory)?;
        slots.extend((0..slot_count).map(|_| HybridRwLock::new(Chain::new())));
        Ok(slots.into_boxed_slice())
    }

    pub fn slot_count(&self) -> usize {
        1 << self.slot_bits
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn max_shards(&self) -> usize {
        self.max_shards
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Lookups restarted because the generation moved under them
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    fn generation_moved(&self, captured: u64) -> bool {
        if self.generation() == captured {
            return false;
        }
        self.retries.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Live entries
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaced entries not reclaimed yet
    pub fn retired(&self) -> usize {
        self.retired.len()
    }

    /// `(shard, slot)` position for `hash`
    pub fn index(&self, hash: u64) -> (usize, usize) {
        let shard = ((hash >> self.slot_bits) % self.shards.len() as u64) as usize;
        let slot = (hash % self.slot_count() as u64) as usize;
        (shard, slot)
    }

    fn slot(&self, hash: u64) -> &Slot {
        let (shard, slot) = self.index(hash);
        &self.shards[shard][slot]
    }

    /// Find `key` and return it locked in `mode`.
    pub fn get(&self, key: &[u8], mode: LockMode) -> Result<EntryHandle> {
        let hash = lookup_hash(key);

        loop {
            let generation = self.generation();
            let chain = self.slot(hash).read();

            if self.generation_moved(generation) {
                trace!("hash get: generation moved, retrying");
                continue;
            }

            let entry = chain
                .iter()
                .find(|entry| entry.matches(hash, key))
                .cloned()
                .ok_or(Error::NotFound)?;

            entry.lock().acquire(mode);
            drop(chain);

            trace!("hash get: {:#018x} : found", hash);
            return Ok(EntryHandle::new(entry, mode));
        }
    }

    /// Store `value` under `key` and return the entry locked in `mode`.
    ///
    /// Overwrites that fit the existing value buffer happen in place under a
    /// shared slot lock. Inserts and replacements take the slot exclusively.
    pub fn set(&self, key: &[u8], value: &[u8], mode: LockMode) -> Result<EntryHandle> {
        let hash = lookup_hash(key);

        loop {
            let generation = self.generation();
            let chain = self.slot(hash).read();

            if self.generation_moved(generation) {
                trace!("hash set: generation moved, retrying");
                continue;
            }

            if let Some(entry) = chain.iter().find(|entry| entry.matches(hash, key)) {
                if value.len() <= entry.capacity() {
                    let entry = Arc::clone(entry);
                    let handle = Self::overwrite(entry, value, mode)?;
                    trace!("hash set: {:#018x} : in place", hash);
                    return Ok(handle);
                }
            }

            break;
        }

        loop {
            let generation = self.generation();
            let mut chain = self.slot(hash).write();

            if self.generation_moved(generation) {
                trace!("hash set: generation moved, retrying insert");
                continue;
            }

            if let Some(pos) = chain.iter().position(|entry| entry.matches(hash, key)) {
                if value.len() <= chain[pos].capacity() {
                    let entry = Arc::clone(&chain[pos]);
                    return Self::overwrite(entry, value, mode);
                }

                if let Some(old) = chain.remove(pos) {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    self.retired.push(old);
                }
            }

            let entry = Arc::new(Entry::allocate(hash, key, value)?);
            entry.lock().acquire(mode);
            chain.push_front(Arc::clone(&entry));
            self.len.fetch_add(1, Ordering::Relaxed);
            drop(chain);

            trace!("hash set: {:#018x} : new entry", hash);

            if self.retired.len() >= RECLAIM_THRESHOLD {
                self.reclaim();
            }

            return Ok(EntryHandle::new(entry, mode));
        }
    }

    fn overwrite(entry: Arc<Entry>, value: &[u8], mode: LockMode) -> Result<EntryHandle> {
        entry.lock().acquire(LockMode::Exclusive);
        unsafe { entry.overwrite(value) };

        if mode == LockMode::Shared {
            entry.lock().release(LockMode::Exclusive)?;
            entry.lock().acquire(LockMode::Shared);
        }

        Ok(EntryHandle::new(entry, mode))
    }

    /// Free retired entries no handle refers to any more.
    ///
    /// Returns how many were freed.
    pub fn reclaim(&self) -> usize {
        let mut freed = 0;

        for _ in 0..self.retired.len() {
            let Some(entry) = self.retired.pop() else {
                break;
            };

            // unlinked, so no new references can appear
            if Arc::strong_count(&entry) == 1 {
                freed += 1;
            } else {
                self.retired.push(entry);
            }
        }

        if freed > 0 {
            debug!("hash reclaim: freed = {} : pending = {}", freed, self.retired.len());
        }
        freed
    }

    /// Grow the shard layout.
    ///
    /// Migration is not implemented: the layout stays as is and the
    /// generation does not move. Readers already retry on a generation
    /// change, so a real migration only has to bump it once slots are moved.
    pub fn resize(&self) -> Result<()> {
        debug!(
            "hash resize: shards = {}/{} : layout unchanged",
            self.shards.len(),
            self.max_shards()
        );
        self.dump();
        Ok(())
    }

    /// Trace every non-empty slot.
    pub fn dump(&self) {
        if !enabled!(Level::TRACE) {
            return;
        }

        trace!(
            "hash dump: shards = {} : slots = {} : len = {} : retired = {} : retries = {}",
            self.shards.len(),
            self.slot_count(),
            self.len(),
            self.retired(),
            self.retries()
        );

        for (s, shard) in self.shards.iter().enumerate() {
            for (i, slot) in shard.iter().enumerate() {
                let chain = slot.read();
                for entry in chain.iter() {
                    trace!("hash dump: [{}][{}] : {:?}", s, i, entry);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn table() -> HashTable {
        HashTable::new(8, 4).unwrap()
    }

    fn read(table: &HashTable, key: &[u8]) -> Vec<u8> {
        let handle = table.get(key, LockMode::Shared).unwrap();
        let value = handle.value().to_vec();
        handle.release().unwrap();
        value
    }

    #[test]
    fn test_set_shrink_grow() {
        let table = table();

        table.set(b"k", b"1234567890", LockMode::Exclusive).unwrap();
        assert_eq!(read(&table, b"k"), b"1234567890");

        table.set(b"k", b"ab", LockMode::Exclusive).unwrap();
        assert_eq!(read(&table, b"k"), b"ab");

        table.set(b"k", b"1234567890", LockMode::Exclusive).unwrap();
        assert_eq!(read(&table, b"k"), b"1234567890");

        table.set(b"k", b"12345678901234567890", LockMode::Exclusive).unwrap();
        assert_eq!(read(&table, b"k"), b"12345678901234567890");

        assert_eq!(table.len(), 1);
        assert_eq!(table.retired(), 1);
        assert_eq!(table.reclaim(), 1);
        assert_eq!(table.retired(), 0);
    }

    #[test]
    fn test_missing_key() {
        let table = table();
        table.set(b"present", b"v", LockMode::Exclusive).unwrap();
        assert!(matches!(
            table.get(b"missing", LockMode::Shared),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            table.get(b"presen", LockMode::Shared),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_set_returns_locked_entry() {
        let table = table();
        let handle = table.set(b"k", b"v", LockMode::Exclusive).unwrap();
        assert_eq!(handle.mode(), LockMode::Exclusive);
        assert_eq!(handle.key(), b"k");
        assert_eq!(handle.value(), b"v");
        drop(handle);

        let handle = table.set(b"k", b"w", LockMode::Shared).unwrap();
        assert_eq!(handle.mode(), LockMode::Shared);
        assert_eq!(handle.value(), b"w");

        // other readers share the entry with the writer's handle
        let reader = table.get(b"k", LockMode::Shared).unwrap();
        assert_eq!(reader.value(), b"w");
        reader.release().unwrap();
        handle.release().unwrap();
    }

    #[test]
    fn test_handle_survives_replacement() {
        let table = Arc::new(table());
        table.set(b"k", b"old", LockMode::Exclusive).unwrap();

        let handle = table.get(b"k", LockMode::Shared).unwrap();

        let writer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                table
                    .set(b"k", b"a much longer value", LockMode::Exclusive)
                    .unwrap();
            })
        };
        writer.join().unwrap();

        // replaced in the table, still readable through the handle
        assert_eq!(handle.value(), b"old");
        assert_eq!(table.reclaim(), 0);
        drop(handle);

        assert_eq!(read(&table, b"k"), b"a much longer value");
        assert_eq!(table.reclaim(), 1);
    }

    #[test]
    fn test_index_math() {
        let table = HashTable::new(4, 8).unwrap();
        assert_eq!(table.slot_count(), 16);
        assert_eq!(table.shard_count(), 1);
        assert_eq!(table.index(0x1234_5678_9abc_def3), (0, 3));
        assert_eq!(table.index(0xffff_ffff_ffff_ffff), (0, 15));
        assert_eq!(lookup_hash(b"abc"), lookup_hash(b"abc"));
        assert_ne!(lookup_hash(b"abc"), lookup_hash(b"abd"));

        assert_eq!(table.max_shards(), 8);
        assert!(table.resize().is_ok());
        assert_eq!(table.shard_count(), 1);
        assert_eq!(table.generation(), 0);

        assert!(HashTable::new(0, 1).is_err());
        assert!(HashTable::new(4, 0).is_err());
    }

    /// Spin until some thread is parked on the slot holding `key`.
    fn wait_parked(table: &HashTable, key: &[u8]) {
        while !table.slot(lookup_hash(key)).raw().has_waiters() {
            thread::yield_now();
        }
    }

    #[test]
    fn test_get_retries_when_generation_moves() {
        let table = Arc::new(table());
        table.set(b"k", b"v", LockMode::Exclusive).unwrap();

        let guard = table.slot(lookup_hash(b"k")).write();
        let reader = {
            let table = Arc::clone(&table);
            thread::spawn(move || read(&table, b"k"))
        };

        // the reader captured the old generation before blocking
        wait_parked(&table, b"k");
        table.bump_generation();
        drop(guard);

        assert_eq!(reader.join().unwrap(), b"v");
        assert_eq!(table.retries(), 1);
    }

    #[test]
    fn test_set_retries_when_generation_moves() {
        let table = Arc::new(table());
        table.set(b"k", b"0123456789", LockMode::Exclusive).unwrap();

        // in-place pass blocked behind a structural writer
        let guard = table.slot(lookup_hash(b"k")).write();
        let writer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                table.set(b"k", b"abc", LockMode::Exclusive).unwrap();
            })
        };
        wait_parked(&table, b"k");
        table.bump_generation();
        drop(guard);
        writer.join().unwrap();

        assert_eq!(read(&table, b"k"), b"abc");
        assert_eq!(table.retries(), 1);

        // insert pass blocked behind a reader
        let guard = table.slot(lookup_hash(b"k")).read();
        let writer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                table
                    .set(b"k", b"a value too long to fit", LockMode::Exclusive)
                    .unwrap();
            })
        };
        wait_parked(&table, b"k");
        table.bump_generation();
        drop(guard);
        writer.join().unwrap();

        assert_eq!(read(&table, b"k"), b"a value too long to fit");
        assert_eq!(table.retries(), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.retired(), 1);
    }

    #[test]
    fn test_dump_walks_populated_table() {
        let table = table();
        for i in 0..32 {
            let key = format!("dump-{}", i);
            table.set(key.as_bytes(), b"v", LockMode::Exclusive).unwrap();
        }

        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_test_writer()
            .finish();
        tracing::subscriber::with_default(subscriber, || table.dump());

        assert_eq!(table.len(), 32);
        // dump takes and drops every slot lock
        assert!(table.set(b"dump-0", b"w", LockMode::Exclusive).is_ok());
    }

    #[test]
    fn test_concurrent_distinct_keys() {
        let table = Arc::new(HashTable::new(4, 1).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..500 {
                        let key = format!("key-{}-{}", t, i);
                        let value = format!("value-{}-{}-{}", t, i, "x".repeat(i % 13));
                        table
                            .set(key.as_bytes(), value.as_bytes(), LockMode::Exclusive)
                            .unwrap();
                    }
                    for i in 0..500 {
                        let key = format!("key-{}-{}", t, i);
                        let value = format!("value-{}-{}-{}", t, i, "x".repeat(i % 13));
                        let handle = table.get(key.as_bytes(), LockMode::Shared).unwrap();
                        assert_eq!(handle.value(), value.as_bytes());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 8 * 500);
    }

    #[test]
    fn test_concurrent_same_key() {
        let table = Arc::new(table());
        let values: Vec<Vec<u8>> = (0..8u8)
            .map(|t| vec![b'a' + t; 16 + t as usize * 7])
            .collect();

        let handles: Vec<_> = values
            .iter()
            .cloned()
            .map(|value| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        table.set(b"shared", &value, LockMode::Exclusive).unwrap();
                        let handle = table.get(b"shared", LockMode::Shared).unwrap();
                        let seen = handle.value();
                        // every byte comes from the same write
                        assert!(seen.iter().all(|b| *b == seen[0]));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let last = read(&table, b"shared");
        assert!(values.contains(&last));
        assert_eq!(table.len(), 1);
    }
}
