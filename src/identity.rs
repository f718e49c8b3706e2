//! Inbound identity resolution.
//!
//! The engine never verifies credentials. An [`IdentityPort`] turns whatever
//! the transport authenticated with into the opaque [`UserId`] every
//! coordinator operation takes.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::slot::UserId;
use crate::error::{Result, SwapError};

#[async_trait]
pub trait IdentityPort: Send + Sync {
    /// Resolve a credential to the user it belongs to.
    ///
    /// # Errors
    /// Returns `Unauthenticated` if the credential is not recognised.
    async fn resolve(&self, credential: &str) -> Result<UserId>;
}

/// Trusts the credential as the user id. For deployments where an upstream
/// gateway has already verified the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedIdentity;

#[async_trait]
impl IdentityPort for TrustedIdentity {
    async fn resolve(&self, credential: &str) -> Result<UserId> {
        let id = credential.trim();
        if id.is_empty() {
            return Err(SwapError::Unauthenticated("empty user id".into()));
        }
        Ok(UserId::from(id))
    }
}

/// Fixed token → user table.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    tokens: HashMap<String, UserId>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user: impl Into<UserId>) -> Self {
        self.tokens.insert(token.into(), user.into());
        self
    }
}

#[async_trait]
impl IdentityPort for StaticIdentity {
    async fn resolve(&self, credential: &str) -> Result<UserId> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or_else(|| SwapError::Unauthenticated("unknown token".into()))
    }
}
