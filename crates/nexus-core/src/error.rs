//! Kernel error sum type.

use nexus_ipc::{ErrorCode, RpcError};
use thiserror::Error;

/// Every public kernel operation returns `T` or this.
#[derive(Error, Debug)]
pub enum NexusError {
    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("conflict on {path}")]
    Conflict {
        path: String,
        current_etag: Option<String>,
        provided_etag: Option<String>,
    },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("{operation} timed out")]
    Timeout { operation: String },

    #[error("not the leader{}", leader_address.as_deref().map(|a| format!(", redirect to {a}")).unwrap_or_default())]
    NotLeader { leader_address: Option<String> },

    #[error("integrity failure at {path}: {reason}")]
    Integrity { path: String, reason: String },

    #[error("backend {backend} failed at {path}: {reason}")]
    Backend {
        backend: String,
        path: String,
        reason: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl NexusError {
    pub fn not_found(path: impl Into<String>) -> Self {
        NexusError::NotFound { path: path.into() }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        NexusError::PermissionDenied {
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        NexusError::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            NexusError::NotFound { .. } => ErrorCode::NotFound,
            NexusError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            NexusError::Conflict { .. } => ErrorCode::Conflict,
            NexusError::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            NexusError::Timeout { .. } => ErrorCode::Timeout,
            NexusError::NotLeader { .. } => ErrorCode::NotLeader,
            NexusError::Integrity { .. } => ErrorCode::Integrity,
            NexusError::Backend { .. } => ErrorCode::Backend,
            NexusError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Expected kinds are part of normal operation: reported to callers,
    /// filtered out before the error observer.
    pub fn is_expected(&self) -> bool {
        self.code().is_expected()
    }

    pub fn http_status(&self) -> u16 {
        self.code().http_status()
    }

    pub fn to_rpc_error(&self) -> RpcError {
        let mut error = RpcError::new(self.code(), self.to_string());
        match self {
            NexusError::NotFound { path }
            | NexusError::Integrity { path, .. }
            | NexusError::Backend { path, .. } => error.path = Some(path.clone()),
            NexusError::Conflict {
                path, current_etag, ..
            } => {
                error.path = Some(path.clone());
                error.current_etag = current_etag.clone();
            }
            NexusError::NotLeader { leader_address } => {
                error.leader_address = leader_address.clone();
            }
            _ => {}
        }
        error
    }
}

impl From<nexus_cas::CasError> for NexusError {
    fn from(err: nexus_cas::CasError) -> Self {
        use nexus_cas::CasError;
        match err {
            CasError::Backend {
                backend,
                path,
                source,
            } => NexusError::Backend {
                backend: backend.to_string(),
                path,
                reason: source.to_string(),
            },
            CasError::NotFound { hash } => NexusError::NotFound { path: hash },
            CasError::PathNotFound { path } => NexusError::NotFound { path },
            CasError::AlreadyExists { path } => NexusError::Conflict {
                path,
                current_etag: None,
                provided_etag: None,
            },
            CasError::NotADirectory { path } => {
                NexusError::invalid(format!("not a directory: {path}"))
            }
            CasError::HashMismatch { expected, actual } => NexusError::Integrity {
                path: expected,
                reason: format!("content hash mismatch, got {actual}"),
            },
            CasError::MalformedPointer { path } => NexusError::Integrity {
                path,
                reason: "malformed pointer".to_string(),
            },
            CasError::InvalidHash { hash } => {
                NexusError::invalid(format!("invalid content hash: {hash}"))
            }
            CasError::LockLimitMismatch {
                path,
                expected,
                got,
            } => NexusError::invalid(format!(
                "max_holders mismatch for {path}: expected {expected}, got {got}"
            )),
            CasError::InvalidLockLimit { got } => {
                NexusError::invalid(format!("max_holders must be >= 1, got {got}"))
            }
        }
    }
}

impl From<nexus_meta::MetaError> for NexusError {
    fn from(err: nexus_meta::MetaError) -> Self {
        use nexus_meta::MetaError;
        match err {
            MetaError::NotFound { path } => NexusError::NotFound { path },
            MetaError::VersionNotFound { path, version } => NexusError::NotFound {
                path: format!("{path}@v{version}"),
            },
            MetaError::Conflict { path, current_etag } => NexusError::Conflict {
                path,
                current_etag,
                provided_etag: None,
            },
            MetaError::NotLeader { leader_address } => NexusError::NotLeader { leader_address },
            other => NexusError::Internal(other.to_string()),
        }
    }
}

impl From<nexus_rebac::ReBacError> for NexusError {
    fn from(err: nexus_rebac::ReBacError) -> Self {
        use nexus_rebac::ReBacError;
        match err {
            ReBacError::CrossTenant { .. } => NexusError::invalid(err.to_string()),
            ReBacError::UnknownNamespace { .. } => NexusError::invalid(err.to_string()),
            ReBacError::Meta(meta) => meta.into(),
        }
    }
}

impl From<nexus_events::EventError> for NexusError {
    fn from(err: nexus_events::EventError) -> Self {
        use nexus_events::EventError;
        match err {
            EventError::Lock(cas) => cas.into(),
            EventError::Meta(meta) => meta.into(),
            other => NexusError::Internal(other.to_string()),
        }
    }
}
