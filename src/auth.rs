//! Token-based authentication.
//!
//! The password is stored as a SHA-256 hex digest in the config KV table.
//! Successful login mints an unguessable 128-bit token (32 hex chars) with a
//! 24 h lifetime; tokens are verified against the `auth_tokens` table and
//! expired rows are deleted lazily during verification. Changing the
//! password invalidates every outstanding token.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use rand::RngCore;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::store::{Store, StoreError};
use crate::util::unix_timestamp;

/// Factory default password. The recovery flow resets back to this.
pub const DEFAULT_PASSWORD: &str = "admin";

/// Session lifetime in seconds (24 h).
const TOKEN_TTL_SECS: i64 = 24 * 3600;

/// Authentication errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("wrong password")]
    WrongPassword,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// SHA-256 hex digest of a UTF-8 string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Authentication component backed by [`Store`].
#[derive(Clone)]
pub struct Auth {
    store: Store,
}

impl Auth {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Current password hash, defaulting to the factory password on first
    /// read.
    async fn password_hash(&self) -> Result<String, StoreError> {
        match self.store.config_get("auth_password_hash").await? {
            Some(hash) => Ok(hash),
            None => Ok(sha256_hex(DEFAULT_PASSWORD)),
        }
    }

    /// Verify the password and mint a session token.
    pub async fn login(&self, password: &str) -> Result<String, AuthError> {
        if sha256_hex(password) != self.password_hash().await? {
            return Err(AuthError::WrongPassword);
        }

        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);

        let now = unix_timestamp();
        sqlx::query("INSERT INTO auth_tokens (token, created_at, expires_at) VALUES (?, ?, ?)")
            .bind(&token)
            .bind(now)
            .bind(now + TOKEN_TTL_SECS)
            .execute(self.store.pool())
            .await
            .map_err(StoreError::from)?;

        info!("login ok, token issued");
        Ok(token)
    }

    /// Check that a token exists and has not expired. Expired rows are
    /// deleted on the way through.
    pub async fn verify(&self, token: &str) -> Result<bool, StoreError> {
        let now = unix_timestamp();
        sqlx::query("DELETE FROM auth_tokens WHERE expires_at <= ?")
            .bind(now)
            .execute(self.store.pool())
            .await
            .map_err(StoreError::from)?;

        let found: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM auth_tokens WHERE token = ?")
            .bind(token)
            .fetch_one(self.store.pool())
            .await
            .map_err(StoreError::from)?;
        Ok(found > 0)
    }

    /// Delete one token.
    pub async fn logout(&self, token: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM auth_tokens WHERE token = ?")
            .bind(token)
            .execute(self.store.pool())
            .await
            .map_err(StoreError::from)?;
        Ok(result.rows_affected() > 0)
    }

    /// Change the password and drop every session.
    pub async fn change_password(&self, old: &str, new: &str) -> Result<(), AuthError> {
        if sha256_hex(old) != self.password_hash().await? {
            return Err(AuthError::WrongPassword);
        }
        self.store
            .config_set("auth_password_hash", &sha256_hex(new))
            .await?;
        self.drop_all_tokens().await?;
        info!("password changed, all sessions invalidated");
        Ok(())
    }

    /// Reset to the factory password and drop every session. Used by the
    /// recovery-question flow.
    pub async fn reset_password_to_default(&self) -> Result<(), StoreError> {
        self.store
            .config_set("auth_password_hash", &sha256_hex(DEFAULT_PASSWORD))
            .await?;
        self.drop_all_tokens().await
    }

    pub async fn drop_all_tokens(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM auth_tokens")
            .execute(self.store.pool())
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header.
pub fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}

/// Axum middleware guarding the authenticated route set. Login, auth status,
/// the recovery path, and static assets are mounted outside this layer.
pub async fn require_token(
    State(state): State<crate::AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(&request) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": "error", "message": "Missing or invalid Authorization header"})),
        )
            .into_response();
    };

    match state.auth.verify(token).await {
        Ok(true) => next.run(request).await,
        Ok(false) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": "error", "message": "Invalid or expired token"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "message": e.to_string()})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn auth() -> Auth {
        Auth::new(Store::open_in_memory().await.unwrap())
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn login_with_default_password() {
        let auth = auth().await;
        let token = auth.login(DEFAULT_PASSWORD).await.unwrap();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(auth.verify(&token).await.unwrap());
    }

    #[tokio::test]
    async fn login_wrong_password() {
        let auth = auth().await;
        assert!(matches!(
            auth.login("nope").await,
            Err(AuthError::WrongPassword)
        ));
    }

    #[tokio::test]
    async fn logout_removes_token() {
        let auth = auth().await;
        let token = auth.login(DEFAULT_PASSWORD).await.unwrap();
        assert!(auth.logout(&token).await.unwrap());
        assert!(!auth.verify(&token).await.unwrap());
        assert!(!auth.logout(&token).await.unwrap());
    }

    #[tokio::test]
    async fn change_password_invalidates_all_tokens() {
        let auth = auth().await;
        let t1 = auth.login(DEFAULT_PASSWORD).await.unwrap();
        let t2 = auth.login(DEFAULT_PASSWORD).await.unwrap();
        assert_ne!(t1, t2);

        auth.change_password(DEFAULT_PASSWORD, "s3cret").await.unwrap();
        assert!(!auth.verify(&t1).await.unwrap());
        assert!(!auth.verify(&t2).await.unwrap());

        assert!(matches!(
            auth.login(DEFAULT_PASSWORD).await,
            Err(AuthError::WrongPassword)
        ));
        let t3 = auth.login("s3cret").await.unwrap();
        assert!(auth.verify(&t3).await.unwrap());
    }

    #[tokio::test]
    async fn reset_restores_default_password() {
        let auth = auth().await;
        auth.change_password(DEFAULT_PASSWORD, "s3cret").await.unwrap();
        auth.reset_password_to_default().await.unwrap();
        assert!(auth.login(DEFAULT_PASSWORD).await.is_ok());
    }

    #[tokio::test]
    async fn verify_unknown_token() {
        let auth = auth().await;
        assert!(!auth.verify("deadbeef").await.unwrap());
    }
}
