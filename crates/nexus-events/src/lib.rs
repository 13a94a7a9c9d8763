//! # nexus-events
//!
//! Change notifications and advisory locks, dual-track:
//!
//! - **Distributed**: pub/sub over an [`EventBus`] (zone-partitioned) and
//!   lease locks proposed through the replicated log.
//! - **Same-box**: an OS-native watcher over the passthrough backend's
//!   pointer tree and the backend's in-memory lock table.
//!
//! Operations and contracts are identical on both tracks; the
//! [`EventsService`] selects based on what infrastructure is wired in.

mod bus;
mod event;
mod locks;
mod service;
mod watcher;

pub use bus::{EventBus, EventStream, InMemoryEventBus};
pub use event::{path_matches, ChangeEvent, EventKind};
pub use locks::{LeaseLockManager, LockGuard, LockManager, SameBoxLockManager};
pub use service::EventsService;
pub use watcher::PointerWatcher;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("watch setup failed: {0}")]
    Watch(#[from] notify::Error),

    #[error("no event source available (neither bus nor passthrough watcher)")]
    NoEventSource,

    #[error("lock backend failure: {0}")]
    Lock(#[from] nexus_cas::CasError),

    #[error("log transport failure: {0}")]
    Meta(#[from] nexus_meta::MetaError),
}

pub type Result<T> = std::result::Result<T, EventError>;
