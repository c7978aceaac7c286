use std::sync::Arc;

/// One entry of a key's pending log, applied in order by the processing loop.
#[derive(Debug)]
pub(crate) enum Delta<T> {
    /// Part of the initial listing; counts toward `HasSynced`.
    Listed(Arc<T>),
    Added(Arc<T>),
    Updated(Arc<T>),
    /// Removal; carries the last known object when the source supplied one.
    Deleted(Option<Arc<T>>),
    /// Part of a re-list after the watch expired.
    Replaced(Arc<T>),
    /// Re-deliver the cached value as an update.
    Resync,
}

impl<T> Delta<T> {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Delta::Listed(_) => "listed",
            Delta::Added(_) => "added",
            Delta::Updated(_) => "updated",
            Delta::Deleted(_) => "deleted",
            Delta::Replaced(_) => "replaced",
            Delta::Resync => "resync",
        }
    }
}
