//! The `utils` module holds the pieces shared across the crate: the error
//! types, the logging setup and a poison-tolerant lock helper.

pub mod error;
pub mod logging;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the guard if a panicking handler poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
