//! Shoal informer: keeps an [`ObjectStore`](shoal_store::ObjectStore) in sync
//! with a [`RemoteSource`](shoal_core::RemoteSource) and fans changes out to
//! registered handlers.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod config;
mod delta;
pub mod dispatch;
pub mod error;
mod informer;
pub mod mock;
mod reflector;
pub mod sync;

pub use backoff::{Backoff, BackoffConfig};
pub use config::{ConfigSummary, InformerConfig};
pub use dispatch::{EventDispatcher, EventHandler, HandlerFuncs, HandlerHandle};
pub use error::InformerError;
pub use informer::{Informer, InformerState, Status};
pub use mock::MockSource;
pub use sync::{wait_for_cache_sync, Synced};

pub use shoal_store::Lister;
