//! # nexus-core
//!
//! The kernel façade and its supporting pieces: path validation, the mount
//! router, the read-set registry, the permission evaluator, and the error
//! sum type every public operation returns.
//!
//! Every user-visible operation flows through [`NexusFs`]: resolve the
//! path, check permission, touch metadata through the replicated log,
//! touch content through the backend, emit an event, record the access.

mod context;
mod error;
mod fs;
mod path;
mod perms;
mod read_set;
mod router;
mod snapshot;

pub use context::{OperationContext, ReadTracker};
pub use error::NexusError;
pub use fs::{
    GrepMatch, ListEntry, NexusFs, NexusFsBuilder, SearchMode, WriteOptions, WriteResult,
};
pub use path::{glob_to_regex, parent_of, validate_path};
pub use perms::{Permission, PermissionEvaluator};
pub use read_set::{AccessType, ReadSet, ReadSetEntry, ReadSetRegistry, RegistryStats, ResourceType};
pub use router::{Mount, Router};
pub use snapshot::{SnapshotRecord, WorkspaceRegistration};

pub type Result<T> = std::result::Result<T, NexusError>;
