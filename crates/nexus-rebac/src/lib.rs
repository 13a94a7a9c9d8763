//! # nexus-rebac
//!
//! Relationship-based access control: a tuple graph, namespace rewrite
//! rules, a depth-bounded check evaluator with caching, and directory-grant
//! pre-materialization into bitmap caches.
//!
//! The bitmap layer is strictly an accelerator. A cold path that walks the
//! graph must produce the same answer, and tests hold it to that.

mod bitmap;
mod engine;
mod grants;
mod schema;
mod tuple;

pub use bitmap::IdBitmap;
pub use engine::ReBacEngine;
pub use grants::{DirectoryGrant, DirectoryGrantManager, ExpansionStatus, GrantMetrics};
pub use schema::{file_schema, group_schema, NamespaceSchema, RewriteRule};
pub use tuple::{Entity, RelationTuple, TupleStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReBacError {
    #[error("cross-tenant relationship rejected: subject tenant {subject_tenant:?} != object tenant {object_tenant:?}")]
    CrossTenant {
        subject_tenant: Option<String>,
        object_tenant: Option<String>,
    },

    #[error("unknown namespace for object type: {object_type}")]
    UnknownNamespace { object_type: String },

    #[error("metadata error during grant expansion: {0}")]
    Meta(#[from] nexus_meta::MetaError),
}

pub type Result<T> = std::result::Result<T, ReBacError>;
