use std::fmt;

use anyhow::Context;
use log::{debug, trace};

use crate::primitives::{Condvar, Lock};

#[derive(Debug)]
struct Pool {
    tokens: usize,
    valid: bool,
}

/// Named counting semaphore with a bounded token pool.
///
/// The pool holds at most `capacity` tokens: [`Semaphore::release`] on a full
/// pool parks until an acquirer makes room. Pairing of acquire and release is
/// the caller's job.
///
/// Closing is permanent. Every parked acquirer and releaser wakes up and
/// reports `false`, and later calls return `false` without blocking.
///
/// Wakeup order among parked acquirers is whatever the condition variable
/// gives, not FIFO.
pub struct Semaphore {
    name: String,
    capacity: usize,
    initial: usize,
    pool: Lock<Pool>,
    // signalled when a token enters the pool
    filled: Condvar,
    // signalled when a token leaves the pool
    drained: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` tokens.
    ///
    /// `capacity` is raised to at least 1 and `initial` is clamped to
    /// `capacity`.
    ///
    /// # Panics
    ///
    /// If the underlying pthread objects cannot be initialised.
    pub fn new(name: impl Into<String>, capacity: usize, initial: usize) -> Self {
        Self::try_new(name, capacity, initial).unwrap_or_else(|e| panic!("{e:#}"))
    }

    pub fn try_new(
        name: impl Into<String>,
        capacity: usize,
        initial: usize,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        let capacity = capacity.max(1);
        let initial = initial.min(capacity);

        let pool = Lock::new(Pool {
            tokens: initial,
            valid: true,
        })
        .with_context(|| format!("creating semaphore {name}"))?;
        let filled = Condvar::new().with_context(|| format!("creating semaphore {name}"))?;
        let drained = Condvar::new().with_context(|| format!("creating semaphore {name}"))?;

        Ok(Self {
            name,
            capacity,
            initial,
            pool,
            filled,
            drained,
        })
    }

    /// Semaphore starting with no tokens, counting items ready to be read.
    pub fn empty(name: impl Into<String>, capacity: usize) -> Self {
        Self::new(name, capacity, 0)
    }

    /// Semaphore starting with all `capacity` tokens, counting free slots.
    pub fn full(name: impl Into<String>, capacity: usize) -> Self {
        Self::new(name, capacity, capacity)
    }

    /// Takes a token, parking until one is available.
    ///
    /// Returns `false` if the semaphore was closed, in which case no token
    /// was taken.
    pub fn acquire(&self) -> bool {
        let mut pool = self
            .filled
            .wait_while(self.pool.lock(), |pool| pool.tokens == 0 && pool.valid);

        if !pool.valid {
            return false;
        }
        pool.tokens -= 1;
        self.drained.signal();
        true
    }

    /// Takes a token if one is pooled right now.
    ///
    /// `None` means the call would have blocked. Otherwise carries the same
    /// validity flag as [`Semaphore::acquire`].
    pub fn try_acquire(&self) -> Option<bool> {
        let mut pool = self.pool.lock();
        if !pool.valid {
            return Some(false);
        }
        if pool.tokens == 0 {
            return None;
        }
        pool.tokens -= 1;
        self.drained.signal();
        Some(true)
    }

    /// Returns a token to the pool, parking while the pool is full.
    ///
    /// Returns `false` once the semaphore is closed; nothing is pooled then.
    pub fn release(&self) -> bool {
        let mut pool = self.drained.wait_while(self.pool.lock(), |pool| {
            pool.tokens == self.capacity && pool.valid
        });

        if !pool.valid {
            return false;
        }
        pool.tokens += 1;
        self.filled.signal();
        true
    }

    pub fn wait(&self) -> bool {
        self.acquire()
    }

    pub fn p(&self) -> bool {
        self.acquire()
    }

    pub fn signal(&self) -> bool {
        self.release()
    }

    pub fn v(&self) -> bool {
        self.release()
    }

    /// Drains the pool and refills it with the initial token count.
    ///
    /// Outstanding holders are not tracked, so releases made for tokens
    /// acquired before the reset count on top of the refill. A closed
    /// semaphore stays closed and empty.
    pub fn reset(&self) {
        let mut pool = self.pool.lock();
        if !pool.valid {
            trace!("semaphore {}: reset ignored, closed", self.name);
            return;
        }
        let drained = pool.tokens;
        pool.tokens = self.initial;
        self.filled.broadcast();
        self.drained.broadcast();
        trace!(
            "semaphore {}: reset from {drained} to {} tokens",
            self.name,
            self.initial
        );
    }

    /// Closes the semaphore and wakes everything parked on it. Idempotent.
    pub fn close(&self) {
        let mut pool = self.pool.lock();
        if !pool.valid {
            return;
        }
        pool.valid = false;
        self.filled.broadcast();
        self.drained.broadcast();
        debug!("semaphore {}: closed", self.name);
    }

    pub fn is_valid(&self) -> bool {
        self.pool.lock().valid
    }

    /// Tokens currently pooled.
    pub fn available(&self) -> usize {
        self.pool.lock().tokens
    }

    /// Tokens taken out of the pool and not yet returned.
    pub fn held(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn initial(&self) -> usize {
        self.initial
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool = self.pool.lock();
        f.debug_struct("Semaphore")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("initial", &self.initial)
            .field("tokens", &pool.tokens)
            .field("valid", &pool.valid)
            .finish()
    }
}
