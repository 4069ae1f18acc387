//! Hybrid spin/futex shared-exclusive lock.
//!
//! The whole lock state lives in one 32-bit word:
//!
//! ```text
//!  31        30         29        28 ............ 0
//! [waiters] [exclusive] [shared] [holder count | owner id]
//! ```
//!
//! Shared holders bump the low count; an exclusive holder stores its thread
//! id in the low bits. Contended acquirers spin with a growing budget and
//! then park in the kernel on the word itself after setting the waiters bit.
//! The releaser that clears the word wakes every parked thread.
//!
//! There is no fairness between shared and exclusive waiters and no
//! recursion: an exclusive holder re-acquiring the same lock deadlocks.

use super::futex;
use crate::error::{Error, Result};
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use tracing::{debug, error, trace};

const STATE_SHARED: u32 = 1 << 29;
const STATE_EXCL: u32 = 1 << 30;
const STATE_WAIT: u32 = 1 << 31;
const STATE_MASK: u32 = STATE_SHARED - 1;

/// Initial spin budget; quadrupled after every failed round.
const SPIN_START: u32 = 16;
/// Once the budget reaches this, contended acquirers park in the kernel.
const SPIN_LIMIT: u32 = 2048;

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_ID: u32 = {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed) & STATE_MASK;
        id.max(1)
    };
}

/// Small non-zero identifier of the calling thread, used as lock owner id
/// and as the thread index in trace lines.
pub fn current_thread_id() -> u32 {
    THREAD_ID.with(|id| *id)
}

/// Lock acquisition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Raw shared-exclusive lock without attached data.
///
/// Callers pair every successful acquire with a release in the same mode
/// from the same thread. [`HybridRwLock`] does the pairing with guards.
pub struct HybridLock {
    state: AtomicU32,
    owner: AtomicU32,
    acquired_at: AtomicPtr<Location<'static>>,
    released_at: AtomicPtr<Location<'static>>,
}

impl HybridLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            owner: AtomicU32::new(0),
            acquired_at: AtomicPtr::new(ptr::null_mut()),
            released_at: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Acquire in `mode`, spinning and then parking until granted.
    #[track_caller]
    pub fn acquire(&self, mode: LockMode) {
        let acquired = self.acquire_inner(mode, true, Location::caller());
        debug_assert!(acquired);
    }

    /// Acquire in `mode` only if that is possible right now.
    ///
    /// Fails with [`Error::Busy`] when the lock is held in a conflicting mode.
    #[track_caller]
    pub fn try_acquire(&self, mode: LockMode) -> Result<()> {
        if self.acquire_inner(mode, false, Location::caller()) {
            Ok(())
        } else {
            Err(Error::Busy)
        }
    }

    fn acquire_inner(&self, mode: LockMode, wait: bool, loc: &'static Location<'static>) -> bool {
        let tid = current_thread_id();
        let mut spins = SPIN_START;

        trace!(
            "lock acquire: {:p} : state = {:#x} : mode = {:?}, wait = {} {}",
            self,
            self.state.load(Ordering::Relaxed),
            mode,
            wait,
            loc
        );

        loop {
            let cur = self.state.load(Ordering::Relaxed);

            let next = match mode {
                LockMode::Shared if cur & STATE_EXCL == 0 => {
                    let count = ((cur & STATE_MASK) + 1) & STATE_MASK;
                    Some(count | STATE_SHARED | (cur & STATE_WAIT))
                }
                LockMode::Exclusive if cur & !STATE_WAIT == 0 => {
                    Some(STATE_EXCL | tid | (cur & STATE_WAIT))
                }
                _ => None,
            };

            if let Some(next) = next {
                if self
                    .state
                    .compare_exchange_weak(cur, next, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
                continue;
            }

            if !wait {
                return false;
            }

            if spins < SPIN_LIMIT {
                for _ in 0..spins {
                    std::hint::spin_loop();
                }
                spins <<= 2;
            } else {
                let parked = cur | STATE_WAIT;

                if cur & STATE_WAIT == 0
                    && self
                        .state
                        .compare_exchange(cur, parked, Ordering::Relaxed, Ordering::Relaxed)
                        .is_err()
                {
                    continue;
                }

                futex::wait(&self.state, parked);
            }
        }

        if mode == LockMode::Exclusive {
            self.owner.store(tid, Ordering::Relaxed);
        }
        self.acquired_at
            .store(loc as *const Location<'static> as *mut _, Ordering::Relaxed);

        true
    }

    /// Release a hold taken in `mode`.
    ///
    /// Fails with [`Error::InvalidState`] and leaves the word untouched when
    /// the lock is not held in `mode`, or, for exclusive mode, when the
    /// caller is not the owner.
    #[track_caller]
    pub fn release(&self, mode: LockMode) -> Result<()> {
        let loc = Location::caller();
        let tid = current_thread_id();

        loop {
            let cur = self.state.load(Ordering::Relaxed);
            let mut wake = true;

            trace!(
                "lock release: {:p} : state = {:#x} : mode = {:?} : owner = {} : {}",
                self,
                cur,
                mode,
                self.owner.load(Ordering::Relaxed),
                loc
            );

            let next = match mode {
                LockMode::Shared => {
                    let count = cur & STATE_MASK;

                    if count == 0 || cur & STATE_SHARED == 0 {
                        error!(
                            "lock release: shared release of {:p} in state {:#x} (acq = {}, rel = {})",
                            self,
                            cur,
                            describe(&self.acquired_at),
                            loc
                        );
                        self.dump();
                        return Err(Error::InvalidState(format!(
                            "shared release of lock in state {:#x}",
                            cur
                        )));
                    }

                    let count = count - 1;
                    if count > 0 {
                        wake = false;
                        count | STATE_SHARED | (cur & STATE_WAIT)
                    } else {
                        0
                    }
                }
                LockMode::Exclusive => {
                    if cur & STATE_EXCL == 0 || cur & STATE_MASK != tid {
                        error!(
                            "lock release: exclusive release of {:p} in state {:#x} by {} (acq = {}, rel = {})",
                            self,
                            cur,
                            tid,
                            describe(&self.acquired_at),
                            loc
                        );
                        self.dump();
                        return Err(Error::InvalidState(format!(
                            "exclusive release of lock in state {:#x} by thread {}",
                            cur, tid
                        )));
                    }
                    0
                }
            };

            if self
                .state
                .compare_exchange_weak(cur, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.released_at
                    .store(loc as *const Location<'static> as *mut _, Ordering::Relaxed);

                if wake && cur & STATE_WAIT != 0 {
                    futex::wake_all(&self.state);
                }
                return Ok(());
            }
        }
    }

    /// Mode the lock is currently held in, if any.
    pub fn mode(&self) -> Option<LockMode> {
        let cur = self.state.load(Ordering::Relaxed);
        if cur & STATE_EXCL != 0 {
            Some(LockMode::Exclusive)
        } else if cur & STATE_SHARED != 0 {
            Some(LockMode::Shared)
        } else {
            None
        }
    }

    /// Number of shared holders.
    pub fn holders(&self) -> u32 {
        let cur = self.state.load(Ordering::Relaxed);
        if cur & STATE_SHARED != 0 {
            cur & STATE_MASK
        } else {
            0
        }
    }

    /// True while some thread is parked in the kernel on this lock.
    pub fn has_waiters(&self) -> bool {
        self.state.load(Ordering::Relaxed) & STATE_WAIT != 0
    }

    /// Trace the lock state.
    pub fn dump(&self) {
        let val = self.state.load(Ordering::Relaxed);
        debug!(
            "lock dump: {:p} : owner (or last) = {} : val = {} : {}{}{}",
            self,
            self.owner.load(Ordering::Relaxed),
            val & STATE_MASK,
            if val & STATE_WAIT != 0 { "[waiting]" } else { "" },
            if val & STATE_SHARED != 0 { "[shared]" } else { "" },
            if val & STATE_EXCL != 0 { "[excl]" } else { "" },
        );
    }
}

impl Default for HybridLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HybridLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridLock")
            .field("state", &format_args!("{:#x}", self.state.load(Ordering::Relaxed)))
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .field("acquired_at", &describe(&self.acquired_at))
            .field("released_at", &describe(&self.released_at))
            .finish()
    }
}

fn describe(loc: &AtomicPtr<Location<'static>>) -> String {
    // only ever stores pointers derived from &'static Location
    match unsafe { loc.load(Ordering::Relaxed).as_ref() } {
        Some(loc) => loc.to_string(),
        None => "-".to_string(),
    }
}

/// Data guarded by a [`HybridLock`], accessed through RAII guards.
pub struct HybridRwLock<T> {
    lock: HybridLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for HybridRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for HybridRwLock<T> {}

impl<T> HybridRwLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: HybridLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    #[track_caller]
    pub fn read(&self) -> ReadGuard<'_, T> {
        self.lock.acquire(LockMode::Shared);
        ReadGuard {
            owner: self,
            _not_send: PhantomData,
        }
    }

    #[track_caller]
    pub fn write(&self) -> WriteGuard<'_, T> {
        self.lock.acquire(LockMode::Exclusive);
        WriteGuard {
            owner: self,
            _not_send: PhantomData,
        }
    }

    #[track_caller]
    pub fn try_read(&self) -> Result<ReadGuard<'_, T>> {
        self.lock.try_acquire(LockMode::Shared)?;
        Ok(ReadGuard {
            owner: self,
            _not_send: PhantomData,
        })
    }

    #[track_caller]
    pub fn try_write(&self) -> Result<WriteGuard<'_, T>> {
        self.lock.try_acquire(LockMode::Exclusive)?;
        Ok(WriteGuard {
            owner: self,
            _not_send: PhantomData,
        })
    }

    /// The underlying lock, for state inspection.
    pub fn raw(&self) -> &HybridLock {
        &self.lock
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for HybridRwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for HybridRwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridRwLock")
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

/// Shared access. Released on drop; must be dropped on the acquiring thread.
pub struct ReadGuard<'a, T> {
    owner: &'a HybridRwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.owner.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.owner.lock.release(LockMode::Shared) {
            error!("read guard release failed: {}", e);
        }
    }
}

/// Exclusive access. Released on drop; must be dropped on the acquiring thread.
pub struct WriteGuard<'a, T> {
    owner: &'a HybridRwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.owner.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.owner.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.owner.lock.release(LockMode::Exclusive) {
            error!("write guard release failed: {}", e);
        }
    }
}
