use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ops::{Deref, DerefMut},
};

use libc::{
    pthread_mutex_destroy, pthread_mutex_init, pthread_mutex_lock, pthread_mutex_t,
    pthread_mutex_unlock, pthread_mutexattr_destroy, pthread_mutexattr_init,
};

use crate::CheckOk;

/// Process-private pthread mutex owning the value it protects.
///
/// The pthread object is boxed: an initialised `pthread_mutex_t` must not
/// move, while a `Lock` is moved around freely by its owners.
#[derive(Debug)]
pub struct Lock<T> {
    raw: Box<UnsafeCell<MaybeUninit<pthread_mutex_t>>>,
    data: UnsafeCell<T>,
}

impl<T> Lock<T> {
    pub fn new(value: T) -> anyhow::Result<Self> {
        let raw = Box::new(UnsafeCell::new(MaybeUninit::uninit()));
        let mut attr = MaybeUninit::uninit();
        unsafe {
            pthread_mutexattr_init(attr.as_mut_ptr()).r("mutexattr_init")?;
            let res = pthread_mutex_init((*raw.get()).as_mut_ptr(), attr.as_ptr());
            pthread_mutexattr_destroy(attr.as_mut_ptr());
            res.r("mutex_init")?;
        }

        Ok(Self {
            raw,
            data: UnsafeCell::new(value),
        })
    }

    pub fn lock(&self) -> LockGuard<'_, T> {
        unsafe {
            if pthread_mutex_lock(self.raw()) != 0 {
                panic!("failed to lock mutex");
            }
            LockGuard {
                lock: self,
                data: &mut *self.data.get(),
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn raw(&self) -> *mut pthread_mutex_t {
        unsafe { (*self.raw.get()).as_mut_ptr() }
    }
}

pub struct LockGuard<'a, T: 'a> {
    lock: &'a Lock<T>,
    data: &'a mut T,
}

impl<'a, T: 'a> LockGuard<'a, T> {
    pub(crate) fn raw_lock(&self) -> *mut pthread_mutex_t {
        self.lock.raw()
    }
}

impl<T> Deref for LockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<T> DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<T> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            if pthread_mutex_unlock(self.lock.raw()) != 0 {
                panic!("failed to unlock mutex");
            }
        }
    }
}

unsafe impl<T: Send> Send for Lock<T> {}
unsafe impl<T: Send> Sync for Lock<T> {}

impl<T> Drop for Lock<T> {
    fn drop(&mut self) {
        if unsafe { pthread_mutex_destroy(self.raw()) } != 0 {
            panic!("failed to destroy mutex");
        }
    }
}
