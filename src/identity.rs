//! Caller identity
//!
//! Every task operation is scoped to the account resolved from the caller's
//! session token. [`TokenResolver`] is the seam: the built-in
//! [`StaticTokenResolver`] reads a token table from configuration, and an
//! embedding application can plug in its own session service.

use crate::config::AuthConfig;
use crate::types::AccountId;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// An authenticated session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountSession {
    /// Account the session belongs to
    pub account_id: AccountId,
    /// When the session stops being valid; `None` means never
    pub expires_at: Option<DateTime<Utc>>,
}

/// Resolves a bearer token to an account session
#[async_trait]
pub trait TokenResolver: Send + Sync {
    /// Resolve `token`, failing with [`Error::Unauthenticated`] when it is
    /// unknown or expired
    async fn resolve(&self, token: &str) -> Result<AccountSession>;
}

/// Token table loaded from [`AuthConfig`]
pub struct StaticTokenResolver {
    entries: Vec<(String, AccountSession)>,
}

impl StaticTokenResolver {
    /// Build the table from configuration
    pub fn new(config: &AuthConfig) -> Self {
        let entries = config
            .tokens
            .iter()
            .map(|t| {
                (
                    t.token.clone(),
                    AccountSession {
                        account_id: t.account_id,
                        expires_at: t.expires_at,
                    },
                )
            })
            .collect();
        Self { entries }
    }
}

#[async_trait]
impl TokenResolver for StaticTokenResolver {
    async fn resolve(&self, token: &str) -> Result<AccountSession> {
        // Scan the whole table so lookup time does not depend on which entry matched
        let mut found = None;
        for (candidate, session) in &self.entries {
            if constant_time_eq(candidate.as_bytes(), token.as_bytes()) && found.is_none() {
                found = Some(session);
            }
        }

        let session = found.ok_or_else(|| Error::Unauthenticated("unknown token".into()))?;
        if let Some(expires_at) = session.expires_at
            && expires_at <= Utc::now()
        {
            return Err(Error::Unauthenticated("token expired".into()));
        }

        Ok(session.clone())
    }
}

/// Constant-time byte comparison.
/// Always compares all bytes regardless of where the first mismatch occurs.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticTokenConfig;
    use chrono::Duration;

    fn resolver() -> StaticTokenResolver {
        StaticTokenResolver::new(&AuthConfig {
            tokens: vec![
                StaticTokenConfig {
                    token: "alice-token".into(),
                    account_id: AccountId(1),
                    expires_at: None,
                },
                StaticTokenConfig {
                    token: "bob-token".into(),
                    account_id: AccountId(2),
                    expires_at: Some(Utc::now() + Duration::hours(1)),
                },
                StaticTokenConfig {
                    token: "stale-token".into(),
                    account_id: AccountId(3),
                    expires_at: Some(Utc::now() - Duration::seconds(1)),
                },
            ],
        })
    }

    #[tokio::test]
    async fn known_tokens_resolve_to_their_account() {
        let resolver = resolver();
        assert_eq!(
            resolver.resolve("alice-token").await.unwrap().account_id,
            AccountId(1)
        );
        let bob = resolver.resolve("bob-token").await.unwrap();
        assert_eq!(bob.account_id, AccountId(2));
        assert!(bob.expires_at.is_some());
    }

    #[tokio::test]
    async fn unknown_token_is_unauthenticated() {
        let resolver = resolver();
        for token in ["", "alice", "alice-token ", "ALICE-TOKEN"] {
            assert!(
                matches!(resolver.resolve(token).await, Err(Error::Unauthenticated(_))),
                "token {:?} must not resolve",
                token
            );
        }
    }

    #[tokio::test]
    async fn expired_token_is_unauthenticated() {
        let result = resolver().resolve("stale-token").await;
        assert!(matches!(result, Err(Error::Unauthenticated(msg)) if msg.contains("expired")));
    }

    #[tokio::test]
    async fn empty_table_rejects_everything() {
        let resolver = StaticTokenResolver::new(&AuthConfig::default());
        assert!(resolver.resolve("anything").await.is_err());
    }

    #[test]
    fn constant_time_eq_compares_exactly() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
