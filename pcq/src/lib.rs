//! Counting semaphore and bounded producer/consumer queue over pthread primitives.

use std::collections::TryReserveError;

use libc::c_int;
use thiserror::Error;

pub mod queue;
pub mod semaphore;
pub(crate) mod sync;

pub use queue::{InsertError, Queue};
pub use semaphore::Semaphore;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("initial count must not be negative, got {0}")]
    NegativeCount(isize),
    #[error("queue capacity must be positive")]
    ZeroCapacity,
    #[error("queue capacity {0} exceeds the semaphore count range")]
    CapacityOverflow(usize),
    #[error("failed to allocate {slots} queue slots")]
    Alloc {
        slots: usize,
        #[source]
        source: TryReserveError,
    },
    #[error("operation {op} failed: code {code}")]
    Os { op: &'static str, code: c_int },
    #[error("failed to destroy {primitive}: code {code}")]
    Teardown {
        primitive: &'static str,
        code: c_int,
    },
    #[error("semaphore count overflow")]
    Overflow,
    #[error("primitive is closed")]
    Closed,
}

pub trait CheckOk {
    fn r(self, op: &'static str) -> Result<()>;
}

impl CheckOk for c_int {
    fn r(self, op: &'static str) -> Result<()> {
        if self != 0 {
            return Err(Error::Os { op, code: self });
        }
        Ok(())
    }
}
