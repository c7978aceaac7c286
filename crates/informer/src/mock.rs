//! In-memory remote source with a versioned change history.
//!
//! Every mutation gets the next version. `watch(since)` replays history after
//! `since` and then follows live changes; `compact` drops history so older
//! cursors become `Expired`. Failures can be scripted per call.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use shoal_core::{
    ChangeKind, Key, KeyFn, Listing, RemoteSource, ResourceVersion, SourceError, SourceEvent, StoreError,
    Versioned, WatchStream,
};
use tracing::{debug, trace};

type Feed<T> = mpsc::UnboundedSender<Result<SourceEvent<T>, SourceError>>;

struct State<T> {
    objects: BTreeMap<Key, (T, u64)>,
    history: Vec<SourceEvent<T>>,
    version: u64,
    compacted: u64,
    offline: bool,
    list_failures: VecDeque<SourceError>,
    watch_failures: VecDeque<SourceError>,
    watchers: Vec<Feed<T>>,
    list_calls: usize,
    watch_calls: usize,
}

pub struct MockSource<T> {
    key_fn: KeyFn<T>,
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for MockSource<T> {
    fn clone(&self) -> Self {
        Self { key_fn: Arc::clone(&self.key_fn), state: Arc::clone(&self.state) }
    }
}

impl<T: Clone + Send + Sync + 'static> MockSource<T> {
    pub fn new(key_fn: KeyFn<T>) -> Self {
        let state = State {
            objects: BTreeMap::new(),
            history: Vec::new(),
            version: 0,
            compacted: 0,
            offline: false,
            list_failures: VecDeque::new(),
            watch_failures: VecDeque::new(),
            watchers: Vec::new(),
            list_calls: 0,
            watch_calls: 0,
        };
        Self { key_fn, state: Arc::new(Mutex::new(state)) }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add each object; shorthand for repeated [`add`](Self::add).
    pub fn seed(&self, objs: impl IntoIterator<Item = T>) -> Result<ResourceVersion, StoreError> {
        let mut last = self.version();
        for obj in objs {
            last = self.add(obj)?;
        }
        Ok(last)
    }

    pub fn add(&self, obj: T) -> Result<ResourceVersion, StoreError> {
        self.apply(ChangeKind::Add, obj)
    }

    pub fn update(&self, obj: T) -> Result<ResourceVersion, StoreError> {
        self.apply(ChangeKind::Update, obj)
    }

    pub fn delete(&self, obj: T) -> Result<ResourceVersion, StoreError> {
        self.apply(ChangeKind::Delete, obj)
    }

    /// Record a change at the next version and push it to live watchers.
    pub fn apply(&self, kind: ChangeKind, obj: T) -> Result<ResourceVersion, StoreError> {
        let key = (self.key_fn)(&obj)?;
        let mut st = self.state();
        st.version += 1;
        let v = st.version;
        match kind {
            ChangeKind::Add | ChangeKind::Update => {
                st.objects.insert(key.clone(), (obj.clone(), v));
            }
            ChangeKind::Delete => {
                st.objects.remove(&key);
            }
        }
        let event = SourceEvent { kind, object: obj, version: ResourceVersion::from(v) };
        st.watchers.retain(|w| w.unbounded_send(Ok(event.clone())).is_ok());
        st.history.push(event);
        trace!(key = %key, kind = %kind, version = v, "mock change");
        Ok(ResourceVersion::from(v))
    }

    /// Make the next `list` call fail with `err`. Stacks.
    pub fn fail_next_list(&self, err: SourceError) {
        self.state().list_failures.push_back(err);
    }

    /// Make the next `watch` call fail with `err`. Stacks.
    pub fn fail_next_watch(&self, err: SourceError) {
        self.state().watch_failures.push_back(err);
    }

    /// Terminate every live watch, optionally delivering `err` first.
    pub fn break_watches(&self, err: Option<SourceError>) {
        let mut st = self.state();
        let watchers = std::mem::take(&mut st.watchers);
        debug!(watchers = watchers.len(), error = ?err, "breaking watches");
        if let Some(err) = err {
            for w in &watchers {
                let _ = w.unbounded_send(Err(err.clone()));
            }
        }
    }

    /// Go offline: live watches fail and every list/watch call is `Unavailable`
    /// until [`heal`](Self::heal). Mutations keep applying.
    pub fn partition(&self) {
        self.state().offline = true;
        self.break_watches(Some(SourceError::Unavailable("partitioned".into())));
    }

    pub fn heal(&self) {
        self.state().offline = false;
    }

    /// Forget history; watches from any earlier version now fail with `Expired`.
    pub fn compact(&self) {
        let mut st = self.state();
        st.compacted = st.version;
        st.history.clear();
    }

    /// Current objects in key order.
    pub fn snapshot(&self) -> Vec<T> {
        self.state().objects.values().map(|(obj, _)| obj.clone()).collect()
    }

    pub fn version(&self) -> ResourceVersion {
        ResourceVersion::from(self.state().version)
    }

    pub fn len(&self) -> usize {
        self.state().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    pub fn watch_calls(&self) -> usize {
        self.state().watch_calls
    }

    pub fn live_watches(&self) -> usize {
        let mut st = self.state();
        st.watchers.retain(|w| !w.is_closed());
        st.watchers.len()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> RemoteSource<T> for MockSource<T> {
    async fn list(&self) -> Result<Listing<T>, SourceError> {
        let mut st = self.state();
        st.list_calls += 1;
        if st.offline {
            return Err(SourceError::Unavailable("partitioned".into()));
        }
        if let Some(err) = st.list_failures.pop_front() {
            return Err(err);
        }
        let items = st
            .objects
            .values()
            .map(|(obj, v)| Versioned { object: obj.clone(), version: ResourceVersion::from(*v) })
            .collect();
        Ok(Listing { items, version: ResourceVersion::from(st.version) })
    }

    async fn watch(&self, since: &ResourceVersion) -> Result<WatchStream<T>, SourceError> {
        let mut st = self.state();
        st.watch_calls += 1;
        if st.offline {
            return Err(SourceError::Unavailable("partitioned".into()));
        }
        if let Some(err) = st.watch_failures.pop_front() {
            return Err(err);
        }
        let from: u64 = since
            .as_str()
            .parse()
            .map_err(|_| SourceError::Expired(format!("unparseable version {:?}", since.as_str())))?;
        if from < st.compacted {
            return Err(SourceError::Expired(format!("version {} is older than {}", from, st.compacted)));
        }
        let (tx, rx) = mpsc::unbounded();
        for event in st.history.iter().filter(|e| e.version.as_str().parse::<u64>().is_ok_and(|v| v > from)) {
            let _ = tx.unbounded_send(Ok(event.clone()));
        }
        st.watchers.push(tx);
        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::key_fn;

    fn source() -> MockSource<(String, u32)> {
        MockSource::new(key_fn(|o: &(String, u32)| Ok(o.0.clone())))
    }

    #[tokio::test]
    async fn list_reflects_latest_state() {
        let src = source();
        src.add(("a".into(), 1)).unwrap();
        src.add(("b".into(), 1)).unwrap();
        src.update(("a".into(), 2)).unwrap();
        src.delete(("b".into(), 1)).unwrap();
        let listing = src.list().await.unwrap();
        assert_eq!(listing.version.as_str(), "4");
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.items[0].object, ("a".to_string(), 2));
        assert_eq!(listing.items[0].version.as_str(), "3");
    }

    #[tokio::test]
    async fn watch_replays_after_cursor_then_follows() {
        let src = source();
        src.add(("a".into(), 1)).unwrap();
        src.add(("b".into(), 1)).unwrap();
        let mut stream = src.watch(&ResourceVersion::from(1u64)).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.object.0, "b");
        src.update(("a".into(), 5)).unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!((second.kind, second.object.1), (ChangeKind::Update, 5));
    }

    #[tokio::test]
    async fn compaction_expires_old_cursors() {
        let src = source();
        src.add(("a".into(), 1)).unwrap();
        src.add(("b".into(), 1)).unwrap();
        src.compact();
        let err = src.watch(&ResourceVersion::from(1u64)).await.err().unwrap();
        assert!(err.is_expired());
        assert!(src.watch(&src.version()).await.is_ok());
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let src = source();
        src.fail_next_list(SourceError::Unavailable("down".into()));
        assert!(src.list().await.is_err());
        assert!(src.list().await.is_ok());
        assert_eq!(src.list_calls(), 2);
    }

    #[tokio::test]
    async fn break_watches_ends_streams() {
        let src = source();
        let mut stream = src.watch(&ResourceVersion::from(0u64)).await.unwrap();
        src.break_watches(Some(SourceError::Unavailable("reset".into())));
        assert!(matches!(stream.next().await, Some(Err(SourceError::Unavailable(_)))));
        assert!(stream.next().await.is_none());
    }
}
