#![doc = include_str!("../README.md")]

mod archive;
mod collect;
mod config;
mod data;
mod error;
mod ini;
mod inspect;
mod intern;
mod pacman;
mod paths;
mod pool;
mod resolve;
#[cfg(test)]
pub(crate) mod testelf;

pub use self::archive::*;
pub use self::collect::*;
pub use self::config::*;
pub use self::data::*;
pub use self::error::*;
pub use self::inspect::*;
pub use self::intern::*;
pub use self::pacman::*;
pub use self::paths::*;
pub use self::pool::*;
pub use self::resolve::*;

use std::sync::Mutex;
use std::sync::MutexGuard;

/// Lock a mutex, ignoring poisoning: a panicked worker thread has already
/// failed the run, and every guarded structure stays consistent under
/// per-operation locking.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
