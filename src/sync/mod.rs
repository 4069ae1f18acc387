mod futex;
mod lock;

pub use lock::{
    current_thread_id, HybridLock, HybridRwLock, LockMode, ReadGuard, WriteGuard,
};
