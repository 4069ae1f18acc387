use crate::error::{Error, Result};
use crate::sync::{HybridLock, LockMode};
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::error;

/// One stored key/value record with its own lock.
///
/// The value buffer is sized exactly on allocation; later writes that fit
/// reuse it, anything larger needs a fresh entry.
pub struct Entry {
    lock: HybridLock,
    hash: u64,
    key: Box<[u8]>,
    capacity: usize,
    value: UnsafeCell<Value>,
}

struct Value {
    bytes: Box<[u8]>,
    len: usize,
}

// value is only touched with `lock` held in a compatible mode
unsafe impl Send for Entry {}
unsafe impl Sync for Entry {}

impl Entry {
    pub(crate) fn allocate(hash: u64, key: &[u8], value: &[u8]) -> Result<Self> {
        Ok(Self {
            lock: HybridLock::new(),
            hash,
            key: copy_fallible(key)?,
            capacity: value.len(),
            value: UnsafeCell::new(Value {
                bytes: copy_fallible(value)?,
                len: value.len(),
            }),
        })
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn lock(&self) -> &HybridLock {
        &self.lock
    }

    pub(crate) fn matches(&self, hash: u64, key: &[u8]) -> bool {
        self.hash == hash && *self.key == *key
    }

    /// Bytes the value buffer can hold without reallocation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// # Safety
    ///
    /// The entry lock must be held in either mode.
    pub(crate) unsafe fn value(&self) -> &[u8] {
        let value = &*self.value.get();
        &value.bytes[..value.len]
    }

    /// # Safety
    ///
    /// The entry lock must be held exclusively and `value` must fit within
    /// [`Entry::capacity`].
    pub(crate) unsafe fn overwrite(&self, value: &[u8]) {
        debug_assert!(value.len() <= self.capacity);
        let cell = &mut *self.value.get();
        cell.bytes[..value.len()].copy_from_slice(value);
        cell.len = value.len();
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("hash", &format_args!("{:#018x}", self.hash))
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("capacity", &self.capacity())
            .field("lock", &self.lock)
            .finish()
    }
}

fn copy_fallible(src: &[u8]) -> Result<Box<[u8]>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(src.len())
        .map_err(|_| Error::OutOfMemory)?;
    buf.extend_from_slice(src);
    Ok(buf.into_boxed_slice())
}

/// Locked reference to an entry returned by table lookups.
///
/// The entry lock is held in [`EntryHandle::mode`] until the handle is
/// released or dropped. The entry stays allocated for as long as the handle
/// lives, even if a concurrent write replaces it in the table.
pub struct EntryHandle {
    entry: Arc<Entry>,
    mode: LockMode,
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl EntryHandle {
    /// Wrap an entry whose lock the caller already holds in `mode`.
    pub(crate) fn new(entry: Arc<Entry>, mode: LockMode) -> Self {
        Self {
            entry,
            mode,
            released: false,
            _not_send: PhantomData,
        }
    }

    pub fn key(&self) -> &[u8] {
        self.entry.key()
    }

    pub fn value(&self) -> &[u8] {
        // the handle holds the entry lock
        unsafe { self.entry.value() }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Release the entry lock, reporting misuse instead of logging it.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.entry.lock().release(self.mode)
    }
}

impl Drop for EntryHandle {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.entry.lock().release(self.mode) {
                error!("entry handle release failed: {}", e);
            }
        }
    }
}

impl fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryHandle")
            .field("entry", &self.entry)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overwrite_within_capacity() {
        let entry = Entry::allocate(1, b"k", b"12345").unwrap();
        assert_eq!(entry.capacity(), 5);
        assert!(entry.matches(1, b"k"));
        assert!(!entry.matches(2, b"k"));
        assert!(!entry.matches(1, b"kk"));

        entry.lock().acquire(LockMode::Exclusive);
        unsafe {
            entry.overwrite(b"ab");
            assert_eq!(entry.value(), b"ab");
        }
        entry.lock().release(LockMode::Exclusive).unwrap();
        assert_eq!(entry.capacity(), 5);
    }

    #[test]
    fn test_capacity_readable_during_overwrite() {
        let entry = Arc::new(Entry::allocate(1, b"k", b"0123456789").unwrap());

        let writer = {
            let entry = Arc::clone(&entry);
            std::thread::spawn(move || {
                for i in 0..10_000usize {
                    entry.lock().acquire(LockMode::Exclusive);
                    unsafe { entry.overwrite(&b"0123456789"[..i % 11]) };
                    entry.lock().release(LockMode::Exclusive).unwrap();
                }
            })
        };

        // capacity needs no entry lock
        for _ in 0..10_000 {
            assert_eq!(entry.capacity(), 10);
        }
        writer.join().unwrap();

        entry.lock().acquire(LockMode::Shared);
        assert!(unsafe { entry.value() }.len() <= 10);
        entry.lock().release(LockMode::Shared).unwrap();
    }

    #[test]
    fn test_handle_releases_on_drop() {
        let entry = Arc::new(Entry::allocate(1, b"k", b"v").unwrap());
        entry.lock().acquire(LockMode::Shared);
        let handle = EntryHandle::new(Arc::clone(&entry), LockMode::Shared);
        assert_eq!(handle.value(), b"v");
        assert_eq!(entry.lock().holders(), 1);

        drop(handle);
        assert_eq!(entry.lock().mode(), None);

        entry.lock().acquire(LockMode::Exclusive);
        let handle = EntryHandle::new(Arc::clone(&entry), LockMode::Exclusive);
        handle.release().unwrap();
        assert_eq!(entry.lock().mode(), None);
    }
}
