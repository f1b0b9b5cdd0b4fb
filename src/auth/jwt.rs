use std::time::Duration;

use axum::extract::FromRef;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use thiserror::Error;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::{
    auth::claims::{Claims, TokenKind},
    config::JwtConfig,
    state::AppState,
};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token")]
    InvalidToken,
    #[error("failed to sign token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// Freshly signed access/refresh tokens for one subject.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Clone)]
struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl SigningKeys {
    fn from_secret(secret: &str, ttl_minutes: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl: Duration::from_secs((ttl_minutes.max(0) as u64) * 60),
        }
    }
}

/// Issues and verifies tokens. Access and refresh tokens use separate secrets,
/// so neither kind can be passed off as the other.
#[derive(Clone)]
pub struct TokenService {
    access: SigningKeys,
    refresh: SigningKeys,
    issuer: String,
    audience: String,
}

impl FromRef<AppState> for TokenService {
    fn from_ref(state: &AppState) -> Self {
        state.tokens.clone()
    }
}

impl TokenService {
    pub fn new(cfg: &JwtConfig) -> Self {
        Self {
            access: SigningKeys::from_secret(&cfg.access_secret, cfg.access_ttl_minutes),
            refresh: SigningKeys::from_secret(&cfg.refresh_secret, cfg.refresh_ttl_minutes),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
        }
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh.ttl
    }

    fn keys(&self, kind: TokenKind) -> &SigningKeys {
        match kind {
            TokenKind::Access => &self.access,
            TokenKind::Refresh => &self.refresh,
        }
    }

    fn sign_with_kind(
        &self,
        kind: TokenKind,
        user_id: Uuid,
        email: &str,
        name: &str,
        now: OffsetDateTime,
    ) -> Result<String, TokenError> {
        let keys = self.keys(kind);
        let exp = now + TimeDuration::seconds(keys.ttl.as_secs() as i64);
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            name: name.to_string(),
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            kind,
            jti: Uuid::new_v4(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)?;
        debug!(user_id = %user_id, kind = ?kind, "jwt signed");
        Ok(token)
    }

    pub fn issue_token_pair(
        &self,
        user_id: Uuid,
        email: &str,
        name: &str,
    ) -> Result<TokenPair, TokenError> {
        self.issue_token_pair_at(user_id, email, name, OffsetDateTime::now_utc())
    }

    pub(crate) fn issue_token_pair_at(
        &self,
        user_id: Uuid,
        email: &str,
        name: &str,
        now: OffsetDateTime,
    ) -> Result<TokenPair, TokenError> {
        let access_token = self.sign_with_kind(TokenKind::Access, user_id, email, name, now)?;
        let refresh_token = self.sign_with_kind(TokenKind::Refresh, user_id, email, name, now)?;
        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }

    fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<Claims>(token, &self.keys(kind).decoding, &validation).map_err(|e| {
            debug!(error = %e, kind = ?kind, "jwt rejected");
            TokenError::InvalidToken
        })?;
        if data.claims.kind != kind {
            debug!(expected = ?kind, got = ?data.claims.kind, "jwt kind mismatch");
            return Err(TokenError::InvalidToken);
        }
        debug!(user_id = %data.claims.sub, kind = ?kind, "jwt verified");
        Ok(data.claims)
    }

    pub fn verify_access_token(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify(token, TokenKind::Access)
    }

    pub fn verify_refresh_token(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify(token, TokenKind::Refresh)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> JwtConfig {
    JwtConfig {
        access_secret: "test-access-secret".into(),
        refresh_secret: "test-refresh-secret".into(),
        issuer: "test-issuer".into(),
        audience: "test-aud".into(),
        access_ttl_minutes: 15,
        refresh_ttl_minutes: 60 * 24 * 7,
    }
}
