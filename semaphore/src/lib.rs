//! Counting semaphores, a semaphore-backed mutex and a wait group, all
//! parking on process-private pthread primitives.
//!
//! Blocking operations report a validity flag instead of errors: `false`
//! means the primitive was closed and the wakeup did not carry a token.

use anyhow::bail;
use libc::c_int;

pub mod primitives;

mod mutex;
mod semaphore;
mod wait_group;

pub use mutex::Mutex;
pub use semaphore::Semaphore;
pub use wait_group::WaitGroup;

pub trait CheckOk<R> {
    fn r(self, op: &str) -> Result<R, anyhow::Error>;
}

impl CheckOk<()> for c_int {
    fn r(self, op: &str) -> Result<(), anyhow::Error> {
        if self != 0 {
            bail!("Operation {op} failed: Code {self}");
        }
        Ok(())
    }
}

impl<T> CheckOk<T> for Result<T, c_int> {
    fn r(self, op: &str) -> Result<T, anyhow::Error> {
        match self {
            Ok(t) => Ok(t),
            Err(i) => bail!("Operation {op} failed: Code {i}"),
        }
    }
}
