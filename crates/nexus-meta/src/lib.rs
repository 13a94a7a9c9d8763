//! # nexus-meta
//!
//! Path→metadata mapping with version history, backed by LMDB, plus the
//! replicated-log seam that serializes every write.
//!
//! Writes (`put`, `delete`) are proposed through a [`LogTransport`]; a
//! follower answers with the current leader's address so clients can
//! redirect. Reads may be served by any replica unless the caller asks for
//! a leader read.

mod gc;
mod log;
mod model;
mod replicated;
mod store;

pub use gc::{GcStats, VersionGc};
pub use log::{
    LeaseInfo, LocalLog, LogCommand, LogQuery, LogRpc, LogTransport, MetadataPut, ProposeReply,
    QueryReply, RemoteLog, WireError,
};
pub use model::{now_millis, AclEntry, FileMetadata, Page, SourceType, VersionRecord};
pub use replicated::{ReplicatedMetadataStore, VersionDiff};
pub use store::MetadataStore;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("LMDB error: {0}")]
    Heed(#[from] heed::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("path not found: {path}")]
    NotFound { path: String },

    #[error("version {version} not found for {path}")]
    VersionNotFound { path: String, version: u64 },

    #[error("etag precondition failed for {path}")]
    Conflict {
        path: String,
        current_etag: Option<String>,
    },

    #[error("not the leader{}", leader_address.as_deref().map(|a| format!(", redirect to {a}")).unwrap_or_default())]
    NotLeader { leader_address: Option<String> },

    #[error("log transport failure: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, MetaError>;
