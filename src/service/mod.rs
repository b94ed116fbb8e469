//! # Proxy Service
//!
//! The connection-facing half of the proxy: the TCP accept loop, the
//! per-connection session engine, and the per-card worker threads.
//!
//! ## Threading model
//! - The accept loop and every session's frame reader/writer are tokio tasks
//!   on the shared runtime.
//! - The three context-scoped PC/SC calls run on the blocking pool, awaited
//!   by the session task before it reads the next frame.
//! - Every open card gets one dedicated OS thread that serializes all PC/SC
//!   calls against that card. Card calls never run anywhere else.

pub mod server;
pub mod session;
mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a panicking thread poisoned it.
/// Nothing in the proxy holds a lock across an operation that can panic, so
/// the inner state is always consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
