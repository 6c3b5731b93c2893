use std::{cell::UnsafeCell, mem::MaybeUninit};

use libc::{
    pthread_cond_broadcast, pthread_cond_destroy, pthread_cond_init, pthread_cond_signal,
    pthread_cond_t, pthread_cond_wait, pthread_condattr_destroy, pthread_condattr_init,
};

use crate::CheckOk;

use super::LockGuard;

/// Process-private pthread condition variable, paired with a [`super::Lock`].
#[derive(Debug)]
pub struct Condvar {
    raw: Box<UnsafeCell<MaybeUninit<pthread_cond_t>>>,
}

impl Condvar {
    pub fn new() -> anyhow::Result<Self> {
        let raw = Box::new(UnsafeCell::new(MaybeUninit::uninit()));
        let mut attr = MaybeUninit::uninit();
        unsafe {
            pthread_condattr_init(attr.as_mut_ptr()).r("condattr_init")?;
            let res = pthread_cond_init((*raw.get()).as_mut_ptr(), attr.as_ptr());
            pthread_condattr_destroy(attr.as_mut_ptr());
            res.r("cond_init")?;
        }

        Ok(Self { raw })
    }

    pub fn signal(&self) {
        unsafe {
            if pthread_cond_signal(self.raw()) != 0 {
                panic!("failed to signal condvar");
            }
        }
    }

    pub fn broadcast(&self) {
        unsafe {
            if pthread_cond_broadcast(self.raw()) != 0 {
                panic!("failed to broadcast condvar");
            }
        }
    }

    /// Parks until signalled. Wakeups may be spurious; callers re-check
    /// their condition, or use [`Condvar::wait_while`].
    pub fn wait<'m, T>(&self, guard: LockGuard<'m, T>) -> LockGuard<'m, T> {
        unsafe {
            if pthread_cond_wait(self.raw(), guard.raw_lock()) != 0 {
                panic!("failed to wait on condvar");
            }
        }
        guard
    }

    pub fn wait_while<'m, T>(
        &self,
        mut guard: LockGuard<'m, T>,
        mut condition: impl FnMut(&mut T) -> bool,
    ) -> LockGuard<'m, T> {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    fn raw(&self) -> *mut pthread_cond_t {
        unsafe { (*self.raw.get()).as_mut_ptr() }
    }
}

unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

impl Drop for Condvar {
    fn drop(&mut self) {
        if unsafe { pthread_cond_destroy(self.raw()) } != 0 {
            panic!("failed to destroy condvar");
        }
    }
}
