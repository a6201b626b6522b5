//! Bounded thread joins
//!
//! Shutdown must never deadlock the host, so joins are waited with a
//! deadline and the thread is detached (with an error log) if it fails to
//! exit in time.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Wait for a thread to finish, detaching it when the timeout elapses.
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, name: &str) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::error!("thread '{name}' did not stop within {timeout:?}, detaching");
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    handle.join().is_ok()
}
