//! Registry of live execution contexts.
//!
//! Every task the broker or its request channels spawn registers here under a
//! qualified name (`broker-<id>/<component>[/<detail>]`) and deregisters when
//! its future completes or is dropped. Supervisors query the registry after
//! shutdown to prove nothing foreground was left behind.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Whether a context keeps the broker "alive".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextKind {
    /// Must be gone once shutdown returns.
    Foreground,
    /// Periodic housekeeping that never blocks process exit.
    Background,
}

#[derive(Default)]
struct CensusInner {
    next_id: AtomicU64,
    live: Mutex<BTreeMap<u64, (String, ContextKind)>>,
}

/// Shared handle to one registry; clones observe the same contexts.
#[derive(Clone, Default)]
pub struct ThreadCensus {
    inner: Arc<CensusInner>,
}

/// Keeps a context registered until dropped.
pub struct ContextGuard {
    census: ThreadCensus,
    id: u64,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.census
            .inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl ThreadCensus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, kind: ContextKind) -> ContextGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (name.into(), kind));
        ContextGuard {
            census: self.clone(),
            id,
        }
    }

    /// Spawn `fut` on the current runtime as a registered context.
    pub fn spawn<F>(&self, name: impl Into<String>, kind: ContextKind, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_on(&Handle::current(), name, kind, fut)
    }

    /// Spawn `fut` on `handle` as a registered context.
    pub fn spawn_on<F>(
        &self,
        handle: &Handle,
        name: impl Into<String>,
        kind: ContextKind,
        fut: F,
    ) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        // Register before spawning so the context is visible as soon as the
        // handle exists; the guard moves into the task and drops with it.
        let guard = self.register(name, kind);
        handle.spawn(async move {
            let _guard = guard;
            fut.await
        })
    }

    /// Count live foreground contexts whose name starts with `owner_prefix`.
    pub fn count_foreign_contexts(&self, owner_prefix: &str) -> usize {
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|(name, kind)| *kind == ContextKind::Foreground && name.starts_with(owner_prefix))
            .count()
    }

    /// Names of every live context (either kind) under `owner_prefix`.
    pub fn live_contexts(&self, owner_prefix: &str) -> Vec<String> {
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|(name, _)| name.starts_with(owner_prefix))
            .map(|(name, _)| name.clone())
            .collect()
    }
}
