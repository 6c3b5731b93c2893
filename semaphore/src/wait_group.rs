use std::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

use crate::{Mutex, Semaphore};

/// Waits for a group of tasks to finish.
///
/// The counter only changes while `mutex` is held. `finished` holds its single
/// token exactly when the counter is zero, except while a waiter has
/// borrowed it.
#[derive(Debug)]
pub struct WaitGroup {
    mutex: Mutex,
    // ordering comes from `mutex`; the atomic only makes the field Sync
    outstanding: AtomicUsize,
    finished: Semaphore,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new("wait-group"),
            outstanding: AtomicUsize::new(0),
            finished: Semaphore::full("wait-group-finished", 1),
        }
    }

    pub fn add(&self) {
        self.mutex.enter();
        if self.outstanding.load(Ordering::Relaxed) == 0 {
            let _ = self.finished.try_acquire();
        }
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        self.mutex.leave();
    }

    /// Marks one task as finished. An unmatched call changes nothing and
    /// returns `false`.
    pub fn done(&self) -> bool {
        self.mutex.enter();
        let outstanding = self.outstanding.load(Ordering::Relaxed);
        if outstanding == 0 {
            self.mutex.leave();
            warn!("wait group: done called without a matching add");
            return false;
        }
        self.outstanding.store(outstanding - 1, Ordering::Relaxed);
        if outstanding == 1 {
            self.finished.release();
        }
        self.mutex.leave();
        true
    }

    /// Parks until every added task is done.
    pub fn wait(&self) {
        loop {
            self.finished.acquire();

            self.mutex.enter();
            let idle = self.outstanding.load(Ordering::Relaxed) == 0;
            // pass the token on to the next waiter; a done() may already
            // have put one back
            if idle && self.finished.available() == 0 {
                self.finished.release();
            }
            self.mutex.leave();

            if idle {
                return;
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}
