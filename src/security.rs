//! Recovery-question flow: one-time setup, answer verification, password
//! reset and factory reset.
//!
//! The question pair can be set exactly once — "set" means a stored row
//! whose first answer hash is a well-formed SHA-256 hex digest, which guards
//! against half-written rows counting as configured. Every destructive
//! operation requires both answers *and* the literal risk-acknowledgement
//! constant.

use serde::Serialize;
use sqlx::Row;
use tracing::{info, warn};

use crate::auth::{sha256_hex, Auth};
use crate::store::{Store, StoreError};
use crate::util::unix_timestamp;

/// Literal confirmation string the client must echo ("I acknowledge the
/// risk"). Compared byte-for-byte.
pub const CONFIRM_TEXT: &str = "已知晓风险";

/// Security-flow errors, distinguishable at the API layer.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("security questions already set")]
    AlreadySet,

    #[error("security questions not set")]
    NotSet,

    #[error("confirmation text mismatch")]
    ConfirmMismatch,

    #[error("answers do not match")]
    VerifyFailed,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Whether the questions have been configured.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityStatus {
    pub is_set: bool,
    pub created_at: i64,
}

/// The two questions, shown to a locked-out operator.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityQuestions {
    pub question1: String,
    pub question2: String,
}

/// Setup request: both questions with their answers.
pub struct SetupRequest {
    pub question1: String,
    pub answer1: String,
    pub question2: String,
    pub answer2: String,
}

/// Verification request: both answers plus the confirmation constant.
pub struct VerifyRequest {
    pub answer1: String,
    pub answer2: String,
    pub confirm: String,
}

/// Recovery-question component.
#[derive(Clone)]
pub struct Security {
    store: Store,
}

impl Security {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Whether a valid question row exists.
    pub async fn status(&self) -> Result<SecurityStatus, StoreError> {
        let row = sqlx::query("SELECT answer1_hash, created_at FROM security_questions WHERE id = 1")
            .fetch_optional(self.store.pool())
            .await
            .map_err(StoreError::from)?;

        match row {
            Some(row) => {
                let hash: String = row.get(0);
                let is_set = is_well_formed_hash(&hash);
                Ok(SecurityStatus {
                    is_set,
                    created_at: if is_set { row.get(1) } else { 0 },
                })
            }
            None => Ok(SecurityStatus {
                is_set: false,
                created_at: 0,
            }),
        }
    }

    /// Set the questions. Fails with [`SecurityError::AlreadySet`] once a
    /// valid row exists; persisted state is left untouched in that case.
    pub async fn setup(&self, req: &SetupRequest, iccid: &str) -> Result<(), SecurityError> {
        if req.question1.is_empty()
            || req.answer1.is_empty()
            || req.question2.is_empty()
            || req.answer2.is_empty()
        {
            return Err(SecurityError::InvalidArgument(
                "questions and answers must not be empty".to_string(),
            ));
        }

        if self.status().await?.is_set {
            return Err(SecurityError::AlreadySet);
        }

        sqlx::query(
            "INSERT OR REPLACE INTO security_questions
             (id, question1, question2, answer1_hash, answer2_hash, iccid, created_at, locked)
             VALUES (1, ?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(&req.question1)
        .bind(&req.question2)
        .bind(sha256_hex(&req.answer1))
        .bind(sha256_hex(&req.answer2))
        .bind(iccid)
        .bind(unix_timestamp())
        .execute(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        info!("security questions set");
        Ok(())
    }

    /// Read the two questions for display.
    pub async fn questions(&self) -> Result<SecurityQuestions, SecurityError> {
        let row = sqlx::query("SELECT question1, question2 FROM security_questions WHERE id = 1")
            .fetch_optional(self.store.pool())
            .await
            .map_err(StoreError::from)?
            .ok_or(SecurityError::NotSet)?;

        Ok(SecurityQuestions {
            question1: row.get(0),
            question2: row.get(1),
        })
    }

    /// Verify both answers and the confirmation constant.
    pub async fn verify(&self, req: &VerifyRequest) -> Result<(), SecurityError> {
        if req.confirm != CONFIRM_TEXT {
            return Err(SecurityError::ConfirmMismatch);
        }

        let row = sqlx::query(
            "SELECT answer1_hash, answer2_hash FROM security_questions WHERE id = 1",
        )
        .fetch_optional(self.store.pool())
        .await
        .map_err(StoreError::from)?
        .ok_or(SecurityError::NotSet)?;

        let stored1: String = row.get(0);
        let stored2: String = row.get(1);
        if !is_well_formed_hash(&stored1) || !is_well_formed_hash(&stored2) {
            return Err(SecurityError::NotSet);
        }

        if sha256_hex(&req.answer1) != stored1 || sha256_hex(&req.answer2) != stored2 {
            warn!("security verification failed");
            return Err(SecurityError::VerifyFailed);
        }
        Ok(())
    }

    /// Verify, then reset the password to the factory default and drop all
    /// sessions.
    pub async fn reset_password(&self, req: &VerifyRequest, auth: &Auth) -> Result<(), SecurityError> {
        self.verify(req).await?;
        auth.reset_password_to_default().await?;
        info!("password reset to factory default");
        Ok(())
    }

    /// Verify, then wipe every persisted table and compact the database.
    /// The caller reboots the appliance after the response is flushed.
    pub async fn factory_reset(&self, req: &VerifyRequest) -> Result<(), SecurityError> {
        self.verify(req).await?;
        self.store.factory_wipe().await?;
        warn!("factory reset performed");
        Ok(())
    }
}

fn is_well_formed_hash(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_req() -> SetupRequest {
        SetupRequest {
            question1: "first pet".to_string(),
            answer1: "rex".to_string(),
            question2: "home town".to_string(),
            answer2: "leiden".to_string(),
        }
    }

    fn verify_req(a1: &str, a2: &str, confirm: &str) -> VerifyRequest {
        VerifyRequest {
            answer1: a1.to_string(),
            answer2: a2.to_string(),
            confirm: confirm.to_string(),
        }
    }

    async fn security() -> Security {
        Security::new(Store::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn setup_then_status_and_questions() {
        let sec = security().await;
        assert!(!sec.status().await.unwrap().is_set);
        assert!(matches!(sec.questions().await, Err(SecurityError::NotSet)));

        sec.setup(&setup_req(), "8986001234").await.unwrap();
        let status = sec.status().await.unwrap();
        assert!(status.is_set);
        assert!(status.created_at > 0);

        let qs = sec.questions().await.unwrap();
        assert_eq!(qs.question1, "first pet");
        assert_eq!(qs.question2, "home town");
    }

    #[tokio::test]
    async fn second_setup_is_rejected_and_state_unchanged() {
        let sec = security().await;
        sec.setup(&setup_req(), "").await.unwrap();

        let other = SetupRequest {
            question1: "other".to_string(),
            answer1: "x".to_string(),
            question2: "other2".to_string(),
            answer2: "y".to_string(),
        };
        assert!(matches!(
            sec.setup(&other, "").await,
            Err(SecurityError::AlreadySet)
        ));

        // Original questions and answers still verify.
        let qs = sec.questions().await.unwrap();
        assert_eq!(qs.question1, "first pet");
        sec.verify(&verify_req("rex", "leiden", CONFIRM_TEXT))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn verify_requires_confirmation_constant() {
        let sec = security().await;
        sec.setup(&setup_req(), "").await.unwrap();
        assert!(matches!(
            sec.verify(&verify_req("rex", "leiden", "yes")).await,
            Err(SecurityError::ConfirmMismatch)
        ));
    }

    #[tokio::test]
    async fn verify_rejects_wrong_answers() {
        let sec = security().await;
        sec.setup(&setup_req(), "").await.unwrap();
        assert!(matches!(
            sec.verify(&verify_req("rex", "utrecht", CONFIRM_TEXT)).await,
            Err(SecurityError::VerifyFailed)
        ));
    }

    #[tokio::test]
    async fn reset_password_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let sec = Security::new(store.clone());
        let auth = Auth::new(store);

        sec.setup(&setup_req(), "").await.unwrap();
        auth.change_password(crate::auth::DEFAULT_PASSWORD, "hunter2")
            .await
            .unwrap();
        let token = auth.login("hunter2").await.unwrap();

        sec.reset_password(&verify_req("rex", "leiden", CONFIRM_TEXT), &auth)
            .await
            .unwrap();

        assert!(!auth.verify(&token).await.unwrap());
        assert!(auth.login(crate::auth::DEFAULT_PASSWORD).await.is_ok());
    }

    #[tokio::test]
    async fn factory_reset_wipes_questions() {
        let sec = security().await;
        sec.setup(&setup_req(), "").await.unwrap();
        sec.factory_reset(&verify_req("rex", "leiden", CONFIRM_TEXT))
            .await
            .unwrap();
        assert!(!sec.status().await.unwrap().is_set);
    }
}
