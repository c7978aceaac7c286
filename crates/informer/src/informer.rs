//! The informer: initial list, watch, periodic resync and the processing loop
//! that applies queued deltas to the store and fans them out to handlers.
//!
//! Reflector, resync timer and processing loop are separate tasks. They meet
//! in the per-key pending log and the work queue: producers append a delta to
//! the key's log and add the key to the queue; the processing loop takes a
//! key, applies its whole log in order, and marks it done. The queue's
//! in-flight tracking keeps each key on at most one worker, which is what
//! preserves per-key ordering.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use shoal_core::{ChangeEvent, Key, KeyFn, Listing, RemoteSource, ResourceVersion};
use shoal_queue::WorkQueue;
use shoal_store::{Lister, ObjectStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::InformerConfig;
use crate::delta::Delta;
use crate::dispatch::{EventDispatcher, EventHandler, HandlerHandle, Locked};
use crate::error::InformerError;
use crate::reflector;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InformerState {
    Created,
    Listing,
    Syncing,
    Running,
    Stopping,
    Stopped,
}

impl InformerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InformerState::Created => "created",
            InformerState::Listing => "listing",
            InformerState::Syncing => "syncing",
            InformerState::Running => "running",
            InformerState::Stopping => "stopping",
            InformerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for InformerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle snapshot published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: InformerState,
    /// `HasSynced`. Never reverts once set.
    pub synced: bool,
    /// Terminal error, set together with `Stopped`.
    pub error: Option<InformerError>,
}

pub(crate) struct Shared<T> {
    pub(crate) config: InformerConfig,
    key_fn: KeyFn<T>,
    store: Arc<ObjectStore<T>>,
    queue: WorkQueue<Key>,
    pending: Mutex<FxHashMap<Key, Vec<Delta<T>>>>,
    dispatcher: EventDispatcher<T>,
    status: watch::Sender<Status>,
    initial_remaining: AtomicUsize,
    last_version: Mutex<ResourceVersion>,
    started: AtomicBool,
}

impl<T> Shared<T> {
    fn pending(&self) -> MutexGuard<'_, FxHashMap<Key, Vec<Delta<T>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn key_of(&self, obj: &T) -> Option<Key> {
        match (self.key_fn)(obj) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(informer = %self.config.name, error = %e, "skipping object without a key");
                None
            }
        }
    }

    pub(crate) fn enqueue(&self, key: Key, delta: Delta<T>) {
        trace!(key = %key, delta = delta.as_str(), "enqueue");
        self.pending().entry(key.clone()).or_default().push(delta);
        self.queue.add(key);
    }

    /// Keys that are cached or have deltas not yet fully applied.
    pub(crate) fn known_keys(&self) -> Vec<Key> {
        let pending = self.pending();
        let mut keys = self.store.list_keys();
        keys.extend(pending.keys().filter(|k| self.store.get_by_key(k).is_none()).cloned());
        keys
    }

    pub(crate) fn cached_keys(&self) -> Vec<Key> {
        self.store.list_keys()
    }

    pub(crate) fn last_version(&self) -> ResourceVersion {
        self.last_version.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_version(&self, version: ResourceVersion) {
        *self.last_version.lock().unwrap_or_else(PoisonError::into_inner) = version;
    }

    pub(crate) fn is_synced(&self) -> bool {
        self.status.borrow().synced
    }

    fn set_state(&self, state: InformerState) {
        self.status.send_modify(|s| s.state = state);
        debug!(informer = %self.config.name, state = %state, "state transition");
    }

    fn mark_synced(&self) {
        self.status.send_modify(|s| {
            s.synced = true;
            if s.state == InformerState::Syncing {
                s.state = InformerState::Running;
            }
        });
        info!(informer = %self.config.name, objects = self.store.len(), "cache synced");
    }

    /// Queue the initial listing. `HasSynced` flips once every listed delta is applied.
    fn seed(&self, listing: Listing<T>) {
        let mut batch = Vec::with_capacity(listing.len());
        for item in listing.items {
            if let Some(key) = self.key_of(&item.object) {
                batch.push((key, Arc::new(item.object)));
            }
        }
        self.initial_remaining.store(batch.len(), Ordering::SeqCst);
        self.set_version(listing.version);
        self.set_state(InformerState::Syncing);
        if batch.is_empty() {
            self.mark_synced();
            return;
        }
        for (key, obj) in batch {
            self.enqueue(key, Delta::Listed(obj));
        }
    }

    /// Apply every pending delta of `key` in order.
    ///
    /// The entry stays in the pending map until applied, so a concurrent
    /// re-list still sees the key as known.
    fn process_key(&self, key: &Key) {
        let deltas = match self.pending().get_mut(key) {
            Some(log) => mem::take(log),
            None => return,
        };
        for delta in deltas {
            self.apply(key, delta);
        }
        let mut pending = self.pending();
        if pending.get(key).is_some_and(Vec::is_empty) {
            pending.remove(key);
        }
    }

    fn apply(&self, key: &Key, delta: Delta<T>) {
        let locked = self.dispatcher.lock();
        match delta {
            Delta::Listed(obj) => {
                self.upsert(&locked, key, obj);
                if self.initial_remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.mark_synced();
                }
            }
            Delta::Added(obj) | Delta::Updated(obj) | Delta::Replaced(obj) => self.upsert(&locked, key, obj),
            Delta::Deleted(last) => {
                // The final state from the source wins over the cached copy.
                match self.store.delete_by_key(key) {
                    Some(cached) => locked.dispatch(&ChangeEvent::deleted(key.clone(), last.unwrap_or(cached))),
                    None => trace!(key = %key, "delete of unknown key ignored"),
                }
            }
            Delta::Resync => match self.store.get_by_key(key) {
                Some(cur) => locked.dispatch(&ChangeEvent::updated(key.clone(), Arc::clone(&cur), cur)),
                None => trace!(key = %key, "resync of deleted key skipped"),
            },
        }
    }

    fn upsert(&self, locked: &Locked<'_, T>, key: &Key, obj: Arc<T>) {
        match self.store.add(Arc::clone(&obj)) {
            Ok(Some(old)) => locked.dispatch(&ChangeEvent::updated(key.clone(), old, obj)),
            Ok(None) => locked.dispatch(&ChangeEvent::added(key.clone(), obj)),
            Err(e) => warn!(key = %key, error = %e, "store rejected object"),
        }
    }
}

async fn process_loop<T>(shared: Arc<Shared<T>>) {
    let mut processed = 0u64;
    while let Some(key) = shared.queue.get().await {
        shared.process_key(&key);
        shared.queue.done(&key);
        processed += 1;
    }
    debug!(informer = %shared.config.name, processed, "processing loop drained");
}

/// Keeps a local cache of a remote collection in sync and notifies handlers.
///
/// Cheap to clone; clones share the same cache, handlers and lifecycle.
pub struct Informer<T, S> {
    shared: Arc<Shared<T>>,
    source: Arc<S>,
}

impl<T, S> Clone for Informer<T, S> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared), source: Arc::clone(&self.source) }
    }
}

impl<T, S> Informer<T, S>
where
    T: Send + Sync + 'static,
    S: RemoteSource<T> + 'static,
{
    pub fn new(source: S, key_fn: KeyFn<T>, config: InformerConfig) -> Self {
        let (status, _rx) = watch::channel(Status { state: InformerState::Created, synced: false, error: None });
        let shared = Shared {
            queue: WorkQueue::named(config.name.clone()),
            store: Arc::new(ObjectStore::new(Arc::clone(&key_fn))),
            key_fn,
            config,
            pending: Mutex::new(FxHashMap::default()),
            dispatcher: EventDispatcher::new(),
            status,
            initial_remaining: AtomicUsize::new(0),
            last_version: Mutex::new(ResourceVersion::default()),
            started: AtomicBool::new(false),
        };
        Self { shared: Arc::new(shared), source: Arc::new(source) }
    }

    pub fn config(&self) -> &InformerConfig {
        &self.shared.config
    }

    /// List, sync and keep watching until `cancel` fires; resolves once `Stopped`.
    ///
    /// Fails with `SyncFailed` when the initial listing exhausts its
    /// attempts, and with `AlreadyStarted` on a second call.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), InformerError> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            warn!(informer = %self.shared.config.name, "run called twice");
            return Err(InformerError::AlreadyStarted);
        }
        let shared = &self.shared;
        info!(
            informer = %shared.config.name,
            resync_secs = shared.config.resync_interval.as_secs(),
            list_attempts = shared.config.list_attempts,
            "informer starting"
        );
        let tasks = cancel.child_token();
        let processor = tokio::spawn(process_loop(Arc::clone(shared)));

        shared.set_state(InformerState::Listing);
        let outcome = match reflector::list_initial(shared, self.source.as_ref(), &tasks).await {
            Ok(Some(listing)) => {
                shared.seed(listing);
                let watcher = tokio::spawn(reflector::watch_loop(Arc::clone(shared), Arc::clone(&self.source), tasks.clone()));
                let resync = tokio::spawn(reflector::resync_loop(Arc::clone(shared), tasks.clone()));
                tasks.cancelled().await;
                for (task, handle) in [("reflector", watcher), ("resync", resync)] {
                    if let Err(e) = handle.await {
                        warn!(informer = %shared.config.name, task, error = %e, "task ended abnormally");
                    }
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        self.stop(processor, outcome.as_ref().err().cloned()).await;
        outcome
    }

    async fn stop(&self, processor: JoinHandle<()>, error: Option<InformerError>) {
        let shared = &self.shared;
        shared.set_state(InformerState::Stopping);
        shared.queue.shut_down();
        if let Err(e) = processor.await {
            warn!(informer = %shared.config.name, error = %e, "processing loop ended abnormally");
        }
        shared.dispatcher.clear();
        shared.store.clear();
        shared.pending().clear();
        if let Some(e) = &error {
            warn!(informer = %shared.config.name, error = %e, "informer stopped with error");
        }
        shared.status.send_modify(|s| {
            s.state = InformerState::Stopped;
            s.error = error;
        });
        info!(informer = %shared.config.name, "informer stopped");
    }

    /// Register a handler. It first receives an `on_add` for every cached
    /// object, then live events; nothing is missed or seen twice.
    pub fn add_handler(&self, handler: impl EventHandler<T> + 'static) -> HandlerHandle {
        let mut locked = self.shared.dispatcher.lock();
        let replay = self.shared.store.entries().into_iter().map(|(key, obj)| ChangeEvent::added(key, obj));
        locked.register_with_replay(Arc::new(handler), replay)
    }

    /// Returns whether the handle was registered. The handler receives nothing afterwards.
    pub fn remove_handler(&self, handle: HandlerHandle) -> bool {
        let removed = self.shared.dispatcher.remove_handler(handle);
        debug!(informer = %self.shared.config.name, handler = ?handle, removed, "handler removed");
        removed
    }

    pub fn lister(&self) -> Lister<T> {
        Lister::new(Arc::clone(&self.shared.store))
    }

    pub fn has_synced(&self) -> bool {
        self.shared.is_synced()
    }

    /// Block until synced. Fails with the terminal error if the informer
    /// stopped first, or `Cancelled` if `cancel` fires.
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> Result<(), InformerError> {
        let mut rx = self.shared.status.subscribe();
        let status = tokio::select! {
            _ = cancel.cancelled() => return Err(InformerError::Cancelled),
            r = rx.wait_for(|s| s.synced || s.state == InformerState::Stopped) => match r {
                Ok(s) => (*s).clone(),
                Err(_) => return Err(InformerError::Cancelled),
            },
        };
        if status.synced {
            Ok(())
        } else {
            Err(status.error.unwrap_or(InformerError::Cancelled))
        }
    }

    pub fn state(&self) -> InformerState {
        self.shared.status.borrow().state
    }

    pub fn status(&self) -> Status {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.shared.status.subscribe()
    }

    /// Version of the most recent listing or watch event seen.
    pub fn last_sync_version(&self) -> ResourceVersion {
        self.shared.last_version()
    }
}

#[async_trait::async_trait]
impl<T, S> crate::sync::Synced for Informer<T, S>
where
    T: Send + Sync + 'static,
    S: RemoteSource<T> + 'static,
{
    fn name(&self) -> &str {
        &self.shared.config.name
    }

    fn has_synced(&self) -> bool {
        self.shared.is_synced()
    }

    async fn wait_for_sync(&self, cancel: &CancellationToken) -> Result<(), InformerError> {
        Informer::wait_for_sync(self, cancel).await
    }
}

