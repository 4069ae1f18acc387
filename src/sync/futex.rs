//! Kernel wait/wake on a 32-bit word.
//!
//! On Linux this is `futex(2)` in process-private mode. Elsewhere the wait
//! degrades to a yield so callers fall back to spinning.

use std::sync::atomic::AtomicU32;

/// Block while `*word == expected`. Returns on wake, on value mismatch, or
/// spuriously; callers re-check the word in a loop.
#[cfg(target_os = "linux")]
pub fn wait(word: &AtomicU32, expected: u32) {
    loop {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                std::ptr::null::<libc::timespec>(),
            )
        };

        if ret != 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }

        break;
    }
}

/// Wake every thread parked on `word`.
#[cfg(target_os = "linux")]
pub fn wake_all(word: &AtomicU32) {
    loop {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                i32::MAX,
            )
        };

        if ret < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }

        break;
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wait(word: &AtomicU32, expected: u32) {
    use std::sync::atomic::Ordering;

    if word.load(Ordering::Acquire) == expected {
        std::thread::yield_now();
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wake_all(_word: &AtomicU32) {}
