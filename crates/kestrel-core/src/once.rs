//! One-time initialisation.
//!
//! A tri-state atomic (not started / running / done). Losers of the race
//! spin (yielding) while the winner runs the initialiser. This does not use
//! TSS or any other runtime service, so TSS setup and the lazily started
//! services can depend on it.

use std::sync::atomic::{AtomicU8, Ordering};

const NEW: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;

/// Run-once flag.
#[derive(Debug)]
pub struct Once {
    state: AtomicU8,
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

// Puts the flag back to NEW if the initialiser unwinds, so a later caller
// retries instead of spinning forever.
struct ResetOnUnwind<'a>(&'a AtomicU8);

impl Drop for ResetOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.store(NEW, Ordering::Release);
        }
    }
}

impl Once {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(NEW),
        }
    }

    /// Runs `f` if no call has completed yet. Returns once some call has.
    pub fn call_once(&self, f: impl FnOnce()) {
        loop {
            match self
                .state
                .compare_exchange(NEW, RUNNING, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    let guard = ResetOnUnwind(&self.state);
                    f();
                    std::mem::forget(guard);
                    self.state.store(DONE, Ordering::Release);
                    return;
                }
                Err(DONE) => return,
                Err(_) => std::thread::yield_now(),
            }
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }
}

/// C11 `call_once`.
pub fn call_once(flag: &Once, f: impl FnOnce()) {
    flag.call_once(f);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_exactly_once_under_contention() {
        let once = Arc::new(Once::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let once = Arc::clone(&once);
                let hits = Arc::clone(&hits);
                std::thread::spawn(move || {
                    once.call_once(|| {
                        std::thread::sleep(std::time::Duration::from_millis(5));
                        hits.fetch_add(1, Ordering::SeqCst);
                    });
                    assert!(once.is_completed());
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_initialiser_allows_retry() {
        let once = Once::new();
        let first = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            once.call_once(|| panic!("boom"));
        }));
        assert!(first.is_err());
        assert!(!once.is_completed());
        let mut ran = false;
        call_once(&once, || ran = true);
        assert!(ran);
        assert!(once.is_completed());
    }
}
