use parking_lot::{Condvar, Mutex};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

/// Cloneable stop flag for the dispatch loop.
///
/// Blocking waits go through `sleep`, so a cancel wakes them up right away
/// instead of after a full poll interval.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<Inner>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        *self.0.cancelled.lock() = true;
        self.0.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.cancelled.lock()
    }

    /// sleep for `duration`, returns false if the token was cancelled before or during the wait
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut cancelled = self.0.cancelled.lock();

        match Instant::now().checked_add(duration) {
            Some(deadline) => {
                while !*cancelled {
                    if self.0.condvar.wait_until(&mut cancelled, deadline).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while !*cancelled {
                    self.0.condvar.wait(&mut cancelled);
                }
            }
        }

        !*cancelled
    }
}
