//! Request authentication.
//!
//! Callers authenticate with `Authorization: Bearer <token>`. Tokens are
//! either opaque (resolved by a configured provider) or the structured
//! fallback `sk-<zone>_<user>_<...>` whose first two underscore groups
//! encode zone and user. Optional override headers refine the subject.
//! When no provider is configured the server runs open-access: the
//! overrides and structured tokens are trusted as-is.

use serde::Deserialize;
use tracing::debug;

use nexus_core::{NexusError, OperationContext, Result};

/// Auth material carried alongside each RPC request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthHeaders {
    /// `Authorization: Bearer <token>`
    #[serde(default)]
    pub authorization: Option<String>,
    /// `X-Nexus-Subject: <type>:<id>`
    #[serde(default, rename = "x_nexus_subject")]
    pub subject: Option<String>,
    /// `X-Nexus-Zone-Id`
    #[serde(default, rename = "x_nexus_zone_id")]
    pub zone_id: Option<String>,
    /// `X-Agent-Id`
    #[serde(default, rename = "x_agent_id")]
    pub agent_id: Option<String>,
}

/// Resolves opaque bearer tokens. The DB-backed implementation lives with
/// the deployment; the kernel only needs the seam.
pub trait AuthProvider: Send + Sync {
    fn resolve(&self, token: &str) -> Option<ResolvedSubject>;
}

#[derive(Debug, Clone)]
pub struct ResolvedSubject {
    pub user: String,
    pub zone: String,
    pub groups: Vec<String>,
    pub is_admin: bool,
}

pub struct Authenticator {
    provider: Option<Box<dyn AuthProvider>>,
    default_zone: String,
}

impl Authenticator {
    pub fn new(provider: Option<Box<dyn AuthProvider>>, default_zone: impl Into<String>) -> Self {
        Self {
            provider,
            default_zone: default_zone.into(),
        }
    }

    /// Open-access fallback applies iff no provider is configured.
    pub fn open_access(&self) -> bool {
        self.provider.is_none()
    }

    pub fn authenticate(&self, headers: &AuthHeaders) -> Result<OperationContext> {
        let token = headers
            .authorization
            .as_deref()
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim);

        let resolved = match (token, &self.provider) {
            (Some(token), Some(provider)) => match provider.resolve(token) {
                Some(subject) => Some(subject),
                None => {
                    // Structured tokens still work as best-effort subject
                    // inference when the provider does not know them.
                    parse_structured_token(token)
                }
            },
            (Some(token), None) => parse_structured_token(token),
            (None, Some(_)) => None,
            (None, None) => None,
        };

        let mut ctx = match resolved {
            Some(subject) => {
                let mut ctx = OperationContext::user(subject.user, subject.zone);
                ctx.groups = subject.groups;
                ctx.is_admin = subject.is_admin;
                ctx
            }
            None => {
                if !self.open_access() {
                    return Err(NexusError::denied("missing or unknown bearer token"));
                }
                debug!("no auth provider configured, open-access fallback");
                OperationContext::user("anonymous", self.default_zone.clone())
            }
        };

        // Overrides are best-effort identity hints; an authenticating
        // deployment would gate them on an admin capability.
        if self.open_access() {
            if let Some(subject) = &headers.subject {
                if let Some((_, id)) = subject.split_once(':') {
                    ctx.user = id.to_string();
                }
            }
            if let Some(zone) = &headers.zone_id {
                ctx.zone = zone.clone();
            }
        }
        ctx.agent_id = headers.agent_id.clone();

        Ok(ctx)
    }
}

/// `sk-<zone>_<user>_<...>`: zone and user ride in the first two
/// underscore-delimited groups.
fn parse_structured_token(token: &str) -> Option<ResolvedSubject> {
    let rest = token.strip_prefix("sk-")?;
    let mut parts = rest.split('_');
    let zone = parts.next()?;
    let user = parts.next()?;
    if zone.is_empty() || user.is_empty() {
        return None;
    }
    Some(ResolvedSubject {
        user: user.to_string(),
        zone: zone.to_string(),
        groups: Vec::new(),
        is_admin: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(authorization: Option<&str>) -> AuthHeaders {
        AuthHeaders {
            authorization: authorization.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn structured_token_infers_zone_and_user() {
        let auth = Authenticator::new(None, "default");
        let ctx = auth
            .authenticate(&headers(Some("Bearer sk-acme_alice_8f3a")))
            .unwrap();
        assert_eq!(ctx.user, "alice");
        assert_eq!(ctx.zone, "acme");
    }

    #[test]
    fn open_access_without_token() {
        let auth = Authenticator::new(None, "default");
        let ctx = auth.authenticate(&headers(None)).unwrap();
        assert_eq!(ctx.user, "anonymous");
        assert_eq!(ctx.zone, "default");
    }

    #[test]
    fn overrides_apply_in_open_access() {
        let auth = Authenticator::new(None, "default");
        let mut h = headers(None);
        h.subject = Some("agent:worker-7".to_string());
        h.zone_id = Some("acme".to_string());
        h.agent_id = Some("worker-7".to_string());

        let ctx = auth.authenticate(&h).unwrap();
        assert_eq!(ctx.user, "worker-7");
        assert_eq!(ctx.zone, "acme");
        assert_eq!(ctx.agent_id.as_deref(), Some("worker-7"));
    }

    struct FixedProvider;
    impl AuthProvider for FixedProvider {
        fn resolve(&self, token: &str) -> Option<ResolvedSubject> {
            (token == "opaque-123").then(|| ResolvedSubject {
                user: "bob".to_string(),
                zone: "zone-b".to_string(),
                groups: vec!["eng".to_string()],
                is_admin: false,
            })
        }
    }

    #[test]
    fn provider_resolves_opaque_tokens() {
        let auth = Authenticator::new(Some(Box::new(FixedProvider)), "default");
        let ctx = auth
            .authenticate(&headers(Some("Bearer opaque-123")))
            .unwrap();
        assert_eq!(ctx.user, "bob");
        assert_eq!(ctx.groups, vec!["eng".to_string()]);
    }

    #[test]
    fn provider_mode_rejects_missing_token() {
        let auth = Authenticator::new(Some(Box::new(FixedProvider)), "default");
        assert!(auth.authenticate(&headers(None)).is_err());
    }

    #[test]
    fn malformed_structured_token_is_anonymous() {
        let auth = Authenticator::new(None, "default");
        let ctx = auth.authenticate(&headers(Some("Bearer sk-justzone"))).unwrap();
        assert_eq!(ctx.user, "anonymous");
    }
}
