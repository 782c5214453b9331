use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, taking over the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
