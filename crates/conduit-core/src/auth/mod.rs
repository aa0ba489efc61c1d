//! Shared-secret authentication for consumer and admin requests.
//!
//! Secrets arrive either in the `X-Conduit-Secret-Token` header or in the `token` query
//! parameter and are collected into an [`AuthPayload`] by the transport layer. Configured
//! secrets are stored as SHA-256 digests only, and the presented token is hashed before
//! lookup, so lookup time does not depend on how much of a secret matched.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::{context::RequestContext, errors::GatewayError, types::NormalizedRequest};

pub const SECRET_TOKEN_HEADER: &str = "x-conduit-secret-token";
pub const SECRET_TOKEN_QUERY: &str = "token";

/// Credentials presented with a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthPayload {
    pub secret: Option<String>,
}

impl AuthPayload {
    /// The header wins over the query parameter when both are present.
    #[must_use]
    pub fn from_parts(header: Option<&str>, query: Option<&str>) -> Self {
        let secret = header.or(query).map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        Self { secret }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync + std::fmt::Debug {
    /// # Errors
    ///
    /// Returns [`GatewayError::Unauthorized`] if the payload is not accepted.
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        request: &NormalizedRequest,
        payload: &AuthPayload,
    ) -> Result<(), GatewayError>;
}

/// Accepts any of a fixed set of secrets. An empty set accepts every request.
#[derive(Clone, Default)]
pub struct SecretAuthenticator {
    digests: HashSet<[u8; 32]>,
}

fn digest(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

impl SecretAuthenticator {
    #[must_use]
    pub fn new(secrets: &[String]) -> Self {
        Self { digests: secrets.iter().map(|s| digest(s)).collect() }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.digests.is_empty()
    }
}

impl std::fmt::Debug for SecretAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretAuthenticator").field("secrets", &self.digests.len()).finish()
    }
}

#[async_trait]
impl Authenticator for SecretAuthenticator {
    async fn authenticate(
        &self,
        _ctx: &RequestContext,
        request: &NormalizedRequest,
        payload: &AuthPayload,
    ) -> Result<(), GatewayError> {
        if self.is_open() {
            return Ok(());
        }

        match &payload.secret {
            Some(secret) if self.digests.contains(&digest(secret)) => Ok(()),
            Some(_) => {
                tracing::debug!(method = %request.method(), "rejected request with unknown secret");
                Err(GatewayError::Unauthorized("invalid secret token".to_string()))
            }
            None => Err(GatewayError::Unauthorized("missing secret token".to_string())),
        }
    }
}
