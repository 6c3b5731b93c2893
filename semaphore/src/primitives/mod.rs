mod condvar;
mod lock;

pub use condvar::*;
pub use lock::*;
