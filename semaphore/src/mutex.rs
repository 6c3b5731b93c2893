use crate::Semaphore;

/// Mutual exclusion on top of a single-token [`Semaphore`].
///
/// Unlike [`crate::primitives::Lock`] this guards no data and hands out no
/// guard: [`Mutex::enter`] and [`Mutex::leave`] must be paired by the caller.
#[derive(Debug)]
pub struct Mutex {
    sem: Semaphore,
}

impl Mutex {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            sem: Semaphore::new(name, 1, 1),
        }
    }

    pub fn try_new(name: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            sem: Semaphore::try_new(name, 1, 1)?,
        })
    }

    /// Enters the critical section. `false` means the mutex was closed and
    /// nothing is held.
    pub fn enter(&self) -> bool {
        self.sem.acquire()
    }

    pub fn try_enter(&self) -> Option<bool> {
        self.sem.try_acquire()
    }

    pub fn leave(&self) -> bool {
        self.sem.release()
    }

    /// Forces the mutex back to unlocked, whoever holds it.
    pub fn reset(&self) {
        self.sem.reset();
    }

    pub fn close(&self) {
        self.sem.close();
    }

    pub fn is_valid(&self) -> bool {
        self.sem.is_valid()
    }

    pub fn is_locked(&self) -> bool {
        self.sem.available() == 0
    }

    pub fn name(&self) -> &str {
        self.sem.name()
    }
}
