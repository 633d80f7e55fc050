//! Process registry adapter: name to instance lookup with a single-start
//! guarantee.
//!
//! Handles are stored type-erased so one registry can hold instances of
//! every aggregate kind; the dispatcher downcasts back to the typed
//! handle at the call site.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Registry key: one live instance per `(aggregate_kind, stream_uuid)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    /// The aggregate kind the instance belongs to.
    pub aggregate_kind: String,
    /// The stream the instance owns.
    pub stream_uuid: String,
}

impl InstanceKey {
    /// Build a key from an aggregate kind and stream UUID.
    pub fn new(aggregate_kind: impl Into<String>, stream_uuid: impl Into<String>) -> Self {
        Self {
            aggregate_kind: aggregate_kind.into(),
            stream_uuid: stream_uuid.into(),
        }
    }
}

/// Type-erased instance handle. Downcast to the concrete handle type
/// at the call site.
pub type ErasedHandle = Arc<dyn Any + Send + Sync>;

/// Probe reporting whether the instance behind a handle is still running.
pub type AliveProbe = Box<dyn Fn() -> bool + Send + Sync>;

/// Factory invoked at most once per `start_or_lookup` miss. Returns the
/// new handle plus its aliveness probe.
pub type InstanceFactory = Box<dyn FnOnce() -> (ErasedHandle, AliveProbe) + Send>;

/// Name-to-instance lookup with atomic find-or-create.
///
/// # Contract
///
/// - `start_or_lookup` is race free: concurrent calls with the same key
///   invoke the factory at most once and observe the same handle.
/// - A handle whose probe reports dead is evicted and replaced on the
///   next `start_or_lookup`; `whereis` never returns a dead handle.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Return the live handle for `key`, invoking `factory` exactly once
    /// if no live handle exists. The boolean reports whether the factory
    /// ran.
    async fn start_or_lookup(&self, key: InstanceKey, factory: InstanceFactory)
    -> (ErasedHandle, bool);

    /// Return the live handle for `key`, if any.
    async fn whereis(&self, key: &InstanceKey) -> Option<ErasedHandle>;

    /// Drop the entry for `key`, if any. The instance itself is not
    /// signalled; eviction only forgets the handle.
    async fn evict(&self, key: &InstanceKey);
}

struct RegistryEntry {
    handle: ErasedHandle,
    alive: AliveProbe,
}

/// In-process registry over a `tokio::sync::RwLock`-guarded map.
///
/// The write lock is held across the probe *and* the factory call, so
/// two concurrent dispatches to a new identity cannot both spawn an
/// instance.
#[derive(Default)]
pub struct LocalRegistry {
    entries: RwLock<HashMap<InstanceKey, RegistryEntry>>,
}

impl LocalRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

// Manual `Debug` because `dyn Any` and the probe are not `Debug`.
impl std::fmt::Debug for LocalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRegistry").finish_non_exhaustive()
    }
}

#[async_trait]
impl Registry for LocalRegistry {
    async fn start_or_lookup(
        &self,
        key: InstanceKey,
        factory: InstanceFactory,
    ) -> (ErasedHandle, bool) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(&key)
            && (entry.alive)()
        {
            return (entry.handle.clone(), false);
        }

        // Missing or dead: evict any stale entry and start fresh.
        entries.remove(&key);
        let (handle, alive) = factory();
        tracing::debug!(
            aggregate_kind = %key.aggregate_kind,
            stream_uuid = %key.stream_uuid,
            "starting aggregate instance"
        );
        entries.insert(
            key,
            RegistryEntry {
                handle: handle.clone(),
                alive,
            },
        );
        (handle, true)
    }

    async fn whereis(&self, key: &InstanceKey) -> Option<ErasedHandle> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| (entry.alive)())
            .map(|entry| entry.handle.clone())
    }

    async fn evict(&self, key: &InstanceKey) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
    }
}
