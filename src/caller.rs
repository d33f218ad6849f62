//! Per-caller identity used for request (caller-binding) affinity.
//!
//! The source this crate is modeled on keys its per-thread socket map by
//! `threading.get_ident()`, relying on Python's implicit thread-local
//! identity. `async fn` bodies in Rust can migrate between executor threads
//! (and Tokio 0.2 has no public task-id primitive), so an implicit
//! thread-local `CallerId` would silently stop tracking a caller the moment
//! its future is polled from a different worker thread. Instead a caller
//! that wants request affinity asks for one explicitly via
//! [`Pool::start_request`](crate::pool::Pool::start_request), which hands
//! back a [`CallerId`] plus a [`RequestGuard`] whose `Drop` unwinds it. This
//! is the explicit-requests design pymongo's own source marks as a TODO
//! (`# TODO: Remove implicit threadlocal requests, use explicit requests.`)
//! -- see DESIGN.md.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CALLER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque per-caller token identifying one logical request scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerId(u64);

impl CallerId {
    pub(crate) fn fresh() -> CallerId {
        CallerId(NEXT_CALLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}
