use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

/// One-shot termination event of a job.
///
/// Terminating callers first claim the event with [`Completion::claim`]; only
/// the winner of that race may assign a terminal state and [`fire`] it.
/// Firing is observed by every waiter, including ones arriving later.
///
/// [`fire`]: Completion::fire
pub struct Completion {
    claimed: AtomicBool,
    done: watch::Sender<bool>,
}

impl Completion {
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            claimed: AtomicBool::new(false),
            done,
        }
    }

    /// Returns true for exactly one caller until the claim is released.
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Gives up a claim whose termination attempt failed.
    pub fn release(&self) {
        if !self.is_fired() {
            self.claimed.store(false, Ordering::Release);
        }
    }

    pub fn fire(&self) {
        self.done.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.done.borrow()
    }

    pub async fn wait(&self) {
        let mut done = self.done.subscribe();
        // the sender lives in self, so the channel cannot close while we wait
        let _ = done.wait_for(|fired| *fired).await;
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
