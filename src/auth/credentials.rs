//! Issue and verify registered credentials

use crate::auth::claims::Claims;
use crate::auth::registry::SessionRegistry;
use crate::auth::tokens::TokenCodec;
use crate::auth::AuthError;
use tracing::warn;

/// Codec plus registry: no token leaves `issue` without a registry entry,
/// and `verify` only accepts tokens whose entry is still live.
#[derive(Clone)]
pub struct Credentials {
    codec: TokenCodec,
    registry: SessionRegistry,
}

impl Credentials {
    pub fn new(codec: TokenCodec, registry: SessionRegistry) -> Self {
        Self { codec, registry }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Sign `claims` and record them as active. If the registry write fails
    /// the signed token is dropped and the error returned.
    pub async fn issue<C: Claims>(&self, claims: &C) -> Result<String, AuthError> {
        let token = self.codec.encode(claims)?;

        if let Err(e) = self.registry.store(claims).await {
            warn!(
                kind = %C::KIND,
                user_id = %claims.user_id(),
                error = %e,
                "Discarding credential: registry write failed"
            );
            return Err(e.into());
        }

        Ok(token)
    }

    /// Decode with temporal checks, then require a live registry entry
    pub async fn verify<C: Claims>(&self, token: &str) -> Result<C, AuthError> {
        let claims: C = self.codec.decode(token)?;
        self.registry.ensure_active(&claims).await?;
        Ok(claims)
    }

    pub async fn revoke<C: Claims>(&self, claims: &C) -> Result<bool, AuthError> {
        Ok(self
            .registry
            .revoke(C::KIND, claims.user_id(), claims.jti())
            .await?)
    }
}
