//! Shoal core types: keys, change events and the remote source contract.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Store identifier derived from an object by a key function.
pub type Key = String;

/// Deterministic mapping from an object to its store key.
///
/// Must depend only on object identity (never on fields that change across
/// updates), otherwise an update lands under a different key than its first insert.
pub type KeyFn<T> = Arc<dyn Fn(&T) -> Result<Key, StoreError> + Send + Sync>;

/// Wrap a closure into a shareable [`KeyFn`].
pub fn key_fn<T, F>(f: F) -> KeyFn<T>
where
    F: Fn(&T) -> Result<Key, StoreError> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change applied to the local cache, as handed to handlers.
///
/// Add carries only `new`, Delete only `old`, Update both. Use the
/// constructors; they keep that shape.
#[derive(Debug)]
pub struct ChangeEvent<T> {
    pub key: Key,
    pub kind: ChangeKind,
    pub old: Option<Arc<T>>,
    pub new: Option<Arc<T>>,
}

impl<T> ChangeEvent<T> {
    pub fn added(key: Key, new: Arc<T>) -> Self {
        Self { key, kind: ChangeKind::Add, old: None, new: Some(new) }
    }

    pub fn updated(key: Key, old: Arc<T>, new: Arc<T>) -> Self {
        Self { key, kind: ChangeKind::Update, old: Some(old), new: Some(new) }
    }

    pub fn deleted(key: Key, old: Arc<T>) -> Self {
        Self { key, kind: ChangeKind::Delete, old: Some(old), new: None }
    }

    /// The most recent value the event knows about.
    pub fn object(&self) -> Option<&Arc<T>> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

impl<T> Clone for ChangeEvent<T> {
    fn clone(&self) -> Self {
        Self { key: self.key.clone(), kind: self.kind, old: self.old.clone(), new: self.new.clone() }
    }
}

// ---- remote source contract ----

/// Opaque resource version cursor handed out by the remote source.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(v: impl Into<String>) -> Self {
        Self(v.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

impl From<u64> for ResourceVersion {
    fn from(v: u64) -> Self {
        Self(v.to_string())
    }
}

/// An object paired with the version it was observed at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub object: T,
    pub version: ResourceVersion,
}

/// Result of a full listing; `version` is the cursor to watch from.
#[derive(Debug, Clone)]
pub struct Listing<T> {
    pub items: Vec<Versioned<T>>,
    pub version: ResourceVersion,
}

impl<T> Listing<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A single element of a watch stream.
#[derive(Debug, Clone)]
pub struct SourceEvent<T> {
    pub kind: ChangeKind,
    pub object: T,
    pub version: ResourceVersion,
}

pub type WatchStream<T> = BoxStream<'static, Result<SourceEvent<T>, SourceError>>;

/// External system of record: a full listing plus an incremental change feed.
#[async_trait::async_trait]
pub trait RemoteSource<T>: Send + Sync {
    /// List every current object. Fails with `Unavailable` on transport trouble.
    async fn list(&self) -> Result<Listing<T>, SourceError>;

    /// Subscribe to changes after `since`. Fails with `Expired` when `since`
    /// is too old to resume from; the caller must list again.
    async fn watch(&self, since: &ResourceVersion) -> Result<WatchStream<T>, SourceError>;
}

// ---- object metadata ----

/// Identity accessors for namespaced resources.
pub trait ObjectMeta {
    fn name(&self) -> &str;
    fn namespace(&self) -> Option<&str>;
}

/// `namespace/name` for namespaced objects, `name` otherwise.
pub fn meta_namespace_key<T: ObjectMeta>(obj: &T) -> Result<Key, StoreError> {
    let name = obj.name();
    if name.is_empty() {
        return Err(StoreError::InvalidObject("object has no name".into()));
    }
    match obj.namespace() {
        Some(ns) if !ns.is_empty() => Ok(format!("{}/{}", ns, name)),
        _ => Ok(name.to_string()),
    }
}

/// Inverse of [`meta_namespace_key`]: `(namespace, name)`.
pub fn split_meta_namespace_key(key: &str) -> Result<(Option<&str>, &str), StoreError> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((None, *name)),
        [ns, name] if !name.is_empty() => Ok((Some(*ns), *name)),
        _ => Err(StoreError::InvalidObject(format!("unexpected key format: {:?}", key))),
    }
}

// ---- errors ----

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid object: {0}")]
    InvalidObject(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("remote source unavailable: {0}")]
    Unavailable(String),
    #[error("resource version expired: {0}")]
    Expired(String),
}

impl SourceError {
    pub fn is_expired(&self) -> bool {
        matches!(self, SourceError::Expired(_))
    }
}

pub mod prelude {
    pub use super::{
        key_fn, meta_namespace_key, ChangeEvent, ChangeKind, Key, KeyFn, Listing, ObjectMeta,
        RemoteSource, ResourceVersion, SourceError, SourceEvent, StoreError, Versioned,
        WatchStream,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pod {
        name: String,
        ns: Option<String>,
    }

    impl ObjectMeta for Pod {
        fn name(&self) -> &str { &self.name }
        fn namespace(&self) -> Option<&str> { self.ns.as_deref() }
    }

    #[test]
    fn namespaced_and_cluster_keys() {
        let p = Pod { name: "web-0".into(), ns: Some("prod".into()) };
        assert_eq!(meta_namespace_key(&p).unwrap(), "prod/web-0");
        let n = Pod { name: "node-a".into(), ns: None };
        assert_eq!(meta_namespace_key(&n).unwrap(), "node-a");
        let empty_ns = Pod { name: "x".into(), ns: Some(String::new()) };
        assert_eq!(meta_namespace_key(&empty_ns).unwrap(), "x");
    }

    #[test]
    fn nameless_object_is_invalid() {
        let p = Pod { name: String::new(), ns: Some("prod".into()) };
        assert!(matches!(meta_namespace_key(&p), Err(StoreError::InvalidObject(_))));
    }

    #[test]
    fn split_key_roundtrips_shape() {
        assert_eq!(split_meta_namespace_key("prod/web-0").unwrap(), (Some("prod"), "web-0"));
        assert_eq!(split_meta_namespace_key("node-a").unwrap(), (None, "node-a"));
        assert!(split_meta_namespace_key("a/b/c").is_err());
        assert!(split_meta_namespace_key("").is_err());
    }

    #[test]
    fn event_shapes() {
        let a = Arc::new(1u32);
        let b = Arc::new(2u32);
        let add = ChangeEvent::added("k".into(), a.clone());
        assert!(add.old.is_none() && add.new.is_some());
        let upd = ChangeEvent::updated("k".into(), a.clone(), b.clone());
        assert_eq!(upd.object().map(|v| **v), Some(2));
        let del = ChangeEvent::deleted("k".into(), b);
        assert_eq!(del.kind, ChangeKind::Delete);
        assert!(del.new.is_none());
        assert_eq!(serde_json::to_string(&ChangeKind::Update).unwrap(), "\"Update\"");
    }
}
