//! Boundary helpers that turn plugin panics and overruns into values.
//!
//! Plugin code never unwinds into the dispatch core: every call into a
//! plugin goes through [`caught`] (same thread) or [`with_timeout`] (worker
//! thread + deadline).

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

/// Outcome of a guarded plugin call.
#[derive(Debug)]
pub enum Guarded<T> {
    Completed(T),
    Panicked(String),
    /// The deadline passed. The call may still be running in the background.
    TimedOut,
    /// The worker thread could not be spawned.
    Unavailable(String),
}

pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "plugin panicked".to_string()
    }
}

/// Run `f` on the current thread, catching panics.
pub fn caught<T>(f: impl FnOnce() -> T) -> Guarded<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => Guarded::Completed(v),
        Err(payload) => Guarded::Panicked(panic_message(payload)),
    }
}

/// Run `f` on a named worker thread and wait at most `timeout` for it.
///
/// On timeout the worker is detached, not killed; Rust threads cannot be
/// cancelled from outside. Callers pass a cooperative flag into `f` when the
/// work supports early exit.
pub fn with_timeout<T, F>(name: String, timeout: Duration, f: F) -> Guarded<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    let spawned = thread::Builder::new().name(name).spawn(move || {
        let _ = tx.send(caught(f));
    });
    if let Err(e) = spawned {
        return Guarded::Unavailable(e.to_string());
    }

    match rx.recv_timeout(timeout) {
        Ok(outcome) => outcome,
        Err(RecvTimeoutError::Timeout) => Guarded::TimedOut,
        Err(RecvTimeoutError::Disconnected) => {
            Guarded::Panicked("worker exited without a result".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caught_converts_panic_to_message() {
        let outcome: Guarded<()> = caught(|| panic!("speaker unplugged"));
        assert!(matches!(outcome, Guarded::Panicked(ref m) if m == "speaker unplugged"));

        let formatted: Guarded<()> = caught(|| panic!("code {}", 7));
        assert!(matches!(formatted, Guarded::Panicked(ref m) if m == "code 7"));
    }

    #[test]
    fn with_timeout_returns_fast_results() {
        let outcome = with_timeout("guard-test".into(), Duration::from_secs(1), || 41 + 1);
        assert!(matches!(outcome, Guarded::Completed(42)));
    }

    #[test]
    fn with_timeout_gives_up_on_slow_work() {
        let outcome = with_timeout("guard-slow".into(), Duration::from_millis(20), || {
            thread::sleep(Duration::from_millis(300));
        });
        assert!(matches!(outcome, Guarded::TimedOut));
    }
}
