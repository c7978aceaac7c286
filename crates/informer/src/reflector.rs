//! Turns list/watch activity and the resync timer into queued deltas.

use std::sync::Arc;

use futures::StreamExt;
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use shoal_core::{ChangeKind, Listing, RemoteSource, SourceError, SourceEvent};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::delta::Delta;
use crate::error::InformerError;
use crate::informer::Shared;

/// One `list` call raced against cancellation. `None` when cancelled.
async fn list_once<T, S>(shared: &Shared<T>, source: &S, cancel: &CancellationToken) -> Option<Result<Listing<T>, SourceError>>
where
    S: RemoteSource<T>,
{
    let started = Instant::now();
    let res = tokio::select! {
        _ = cancel.cancelled() => return None,
        r = source.list() => r,
    };
    let took_ms = started.elapsed().as_millis() as u64;
    histogram!("informer_list_ms", took_ms as f64, "informer" => shared.config.name.clone());
    match &res {
        Ok(listing) => info!(informer = %shared.config.name, objects = listing.len(), version = %listing.version, took_ms, "listed"),
        Err(e) => warn!(informer = %shared.config.name, error = %e, took_ms, "list failed"),
    }
    Some(res)
}

/// Initial listing with up to `list_attempts` tries. `Ok(None)` when cancelled.
pub(crate) async fn list_initial<T, S>(
    shared: &Shared<T>,
    source: &S,
    cancel: &CancellationToken,
) -> Result<Option<Listing<T>>, InformerError>
where
    S: RemoteSource<T>,
{
    let attempts = shared.config.list_attempts.max(1);
    let mut backoff = Backoff::new(shared.config.backoff);
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let err = match list_once(shared, source, cancel).await {
            None => return Ok(None),
            Some(Ok(listing)) => return Ok(Some(listing)),
            Some(Err(e)) => e,
        };
        if attempt >= attempts {
            return Err(InformerError::SyncFailed { attempts, source: err });
        }
        debug!(informer = %shared.config.name, attempt, attempts, "retrying initial list");
        if !backoff.wait(cancel).await {
            return Ok(None);
        }
    }
}

/// Watch from the last seen version until cancelled, recovering from
/// transport errors with backoff and from expiry with a re-list.
pub(crate) async fn watch_loop<T, S>(shared: Arc<Shared<T>>, source: Arc<S>, cancel: CancellationToken)
where
    T: Send + Sync + 'static,
    S: RemoteSource<T> + 'static,
{
    let mut backoff = Backoff::new(shared.config.backoff);
    'watch: while !cancel.is_cancelled() {
        let since = shared.last_version();
        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            r = source.watch(&since) => r,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                if !recover(&shared, source.as_ref(), &cancel, &mut backoff, e).await {
                    break;
                }
                continue;
            }
        };
        debug!(informer = %shared.config.name, since = %since, "watch opened");

        let mut seen = 0u64;
        let ended = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                n = stream.next() => Some(n),
            };
            let Some(next) = next else { break 'watch };
            match next {
                Some(Ok(event)) => {
                    seen += 1;
                    backoff.reset();
                    observe(&shared, event);
                }
                Some(Err(e)) => break Some(e),
                None => break None,
            }
        };
        counter!("informer_watch_restarts_total", 1u64, "informer" => shared.config.name.clone());
        match ended {
            None if seen > 0 => debug!(informer = %shared.config.name, seen, "watch ended; reopening"),
            None => {
                debug!(informer = %shared.config.name, "watch ended without events; backing off");
                if !backoff.wait(&cancel).await {
                    break;
                }
            }
            Some(e) => {
                if !recover(&shared, source.as_ref(), &cancel, &mut backoff, e).await {
                    break;
                }
            }
        }
    }
    debug!(informer = %shared.config.name, "reflector stopped");
}

/// Returns `false` when cancelled while recovering.
async fn recover<T, S>(
    shared: &Shared<T>,
    source: &S,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
    err: SourceError,
) -> bool
where
    S: RemoteSource<T>,
{
    if err.is_expired() {
        warn!(informer = %shared.config.name, error = %err, "watch version expired; re-listing");
        return relist(shared, source, cancel, backoff).await;
    }
    warn!(
        informer = %shared.config.name,
        error = %err,
        attempt = backoff.attempts() + 1,
        ceiling_ms = backoff.ceiling().as_millis() as u64,
        "watch failed; backing off"
    );
    backoff.wait(cancel).await
}

async fn relist<T, S>(shared: &Shared<T>, source: &S, cancel: &CancellationToken, backoff: &mut Backoff) -> bool
where
    S: RemoteSource<T>,
{
    counter!("informer_relists_total", 1u64, "informer" => shared.config.name.clone());
    loop {
        match list_once(shared, source, cancel).await {
            None => return false,
            Some(Ok(listing)) => {
                replace(shared, listing);
                backoff.reset();
                return true;
            }
            Some(Err(_)) => {
                if !backoff.wait(cancel).await {
                    return false;
                }
            }
        }
    }
}

/// Queue a fresh listing: every listed object is replaced, every known key
/// missing from it is deleted.
fn replace<T>(shared: &Shared<T>, listing: Listing<T>) {
    let known = shared.known_keys();
    let mut listed = FxHashSet::default();
    for item in listing.items {
        if let Some(key) = shared.key_of(&item.object) {
            listed.insert(key.clone());
            shared.enqueue(key, Delta::Replaced(Arc::new(item.object)));
        }
    }
    let mut gone = 0usize;
    for key in known {
        if !listed.contains(&key) {
            shared.enqueue(key, Delta::Deleted(None));
            gone += 1;
        }
    }
    shared.set_version(listing.version);
    info!(informer = %shared.config.name, listed = listed.len(), gone, "re-list queued");
}

fn observe<T>(shared: &Shared<T>, event: SourceEvent<T>) {
    shared.set_version(event.version);
    let Some(key) = shared.key_of(&event.object) else { return };
    counter!("informer_events_total", 1u64, "informer" => shared.config.name.clone(), "kind" => event.kind.as_str());
    let obj = Arc::new(event.object);
    let delta = match event.kind {
        ChangeKind::Add => Delta::Added(obj),
        ChangeKind::Update => Delta::Updated(obj),
        ChangeKind::Delete => Delta::Deleted(Some(obj)),
    };
    shared.enqueue(key, delta);
}

/// Every `resync_interval`, queue a resync of every cached key.
pub(crate) async fn resync_loop<T>(shared: Arc<Shared<T>>, cancel: CancellationToken) {
    if !shared.config.resync_enabled() {
        debug!(informer = %shared.config.name, "periodic resync disabled");
        return;
    }
    let period = shared.config.resync_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => resync(&shared),
        }
    }
}

fn resync<T>(shared: &Shared<T>) {
    if !shared.is_synced() {
        return;
    }
    let keys = shared.cached_keys();
    let n = keys.len();
    for key in keys {
        shared.enqueue(key, Delta::Resync);
    }
    counter!("informer_resyncs_total", 1u64, "informer" => shared.config.name.clone());
    debug!(informer = %shared.config.name, objects = n, "resync queued");
}
