use shoal_core::SourceError;

/// Errors surfaced by the informer to callers of `run` and `wait_for_sync`.
///
/// Transport failures and expired versions are handled inside the reflector
/// and only show up here as the cause of `SyncFailed`.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum InformerError {
    /// The initial listing did not succeed within the configured attempts.
    #[error("initial sync failed after {attempts} attempt(s): {source}")]
    SyncFailed { attempts: usize, source: SourceError },

    /// `run` was called on an instance that already ran.
    #[error("informer already started; build a new instance to restart")]
    AlreadyStarted,

    /// The wait was cancelled, or the informer stopped before syncing.
    #[error("cancelled before the cache synced")]
    Cancelled,
}
