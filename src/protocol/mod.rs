//! The line protocol shared by discovery and monitor tools.
//!
//! Commands are single lines of ASCII written to the tool's stdin.
//! The tool answers with JSON values on its stdout, each carrying an `eventType`.
//! Some tools also emit unsolicited values, which are routed as events instead of replies.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) mod client;
pub(crate) mod codec;

pub(crate) use client::{LineClient, ProtocolMessage, Route};

/// Lock a mutex, ignoring poisoning.
/// Nothing guarded by these mutexes can be left half-updated by a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
