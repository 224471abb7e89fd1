//! Server-side session registry.
//!
//! Sessions are the revocation authority for bearer tokens: the raw token is
//! never persisted, only its SHA-256 hash, and a token without a live session
//! row grants nothing no matter how valid its signature is.

use crate::auth::store::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::Instrument;
use utoipa::ToSchema;
use uuid::Uuid;

/// Hash a bearer token for storage and lookup. Raw tokens never touch the
/// database.
#[must_use]
pub fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip)]
    pub token_hash: Vec<u8>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Outcome of a session lookup. `Expired` and `NotFound` are distinguished
/// for logging; callers must deny both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookup {
    Active(Session),
    Expired,
    NotFound,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session expiring `ttl` from now. The token hash must be
    /// unique across live sessions; the store enforces this.
    async fn create(
        &self,
        user_id: Uuid,
        token_hash: Vec<u8>,
        ip: Option<String>,
        user_agent: Option<String>,
        ttl: Duration,
    ) -> Result<Session, StoreError>;
    async fn validate(&self, token_hash: &[u8]) -> Result<SessionLookup, StoreError>;
    /// Stamp activity on a session that just validated.
    async fn touch(&self, session_id: Uuid) -> Result<(), StoreError>;
    /// Revoke by token hash. Returns the revoked session, `None` if there was
    /// nothing to revoke; revoking twice is not an error.
    async fn revoke(&self, token_hash: &[u8]) -> Result<Option<Session>, StoreError>;
    /// Revoke a specific session, but only if it belongs to the given user.
    async fn revoke_by_id(&self, session_id: Uuid, user_id: Uuid) -> Result<bool, StoreError>;
    async fn revoke_all(&self, user_id: Uuid) -> Result<u64, StoreError>;
    async fn active_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, StoreError>;
    /// Delete sessions past their expiry. Safe to run concurrently with
    /// validation.
    async fn sweep_expired(&self) -> Result<u64, StoreError>;
}

#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SESSION_COLUMNS: &str =
    "id, user_id, token_hash, ip, user_agent, expires_at, created_at, last_activity_at";

fn session_from_row(row: &PgRow) -> Result<Session, StoreError> {
    Ok(Session {
        id: row.try_get("id").map_err(sqlx_backend)?,
        user_id: row.try_get("user_id").map_err(sqlx_backend)?,
        token_hash: row.try_get("token_hash").map_err(sqlx_backend)?,
        ip: row.try_get("ip").map_err(sqlx_backend)?,
        user_agent: row.try_get("user_agent").map_err(sqlx_backend)?,
        expires_at: row.try_get("expires_at").map_err(sqlx_backend)?,
        created_at: row.try_get("created_at").map_err(sqlx_backend)?,
        last_activity_at: row.try_get("last_activity_at").map_err(sqlx_backend)?,
    })
}

fn sqlx_backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(anyhow::Error::new(err))
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(
        &self,
        user_id: Uuid,
        token_hash: Vec<u8>,
        ip: Option<String>,
        user_agent: Option<String>,
        ttl: Duration,
    ) -> Result<Session, StoreError> {
        let expires_at = Utc::now()
            + ChronoDuration::from_std(ttl)
                .map_err(|err| StoreError::Backend(anyhow::Error::new(err)))?;
        let query = format!(
            "INSERT INTO sessions (user_id, token_hash, ip, user_agent, expires_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {SESSION_COLUMNS}"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT"
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(&token_hash)
            .bind(&ip)
            .bind(&user_agent)
            .bind(expires_at)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                if crate::auth::store::is_unique_violation(&err) {
                    StoreError::Duplicate {
                        entity: "session token",
                    }
                } else {
                    sqlx_backend(err)
                }
            })?;
        session_from_row(&row)
    }

    async fn validate(&self, token_hash: &[u8]) -> Result<SessionLookup, StoreError> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE token_hash = $1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let row = sqlx::query(&query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(sqlx_backend)?;
        match row {
            None => Ok(SessionLookup::NotFound),
            Some(row) => {
                let session = session_from_row(&row)?;
                if session.expires_at <= Utc::now() {
                    Ok(SessionLookup::Expired)
                } else {
                    Ok(SessionLookup::Active(session))
                }
            }
        }
    }

    async fn touch(&self, session_id: Uuid) -> Result<(), StoreError> {
        let query = "UPDATE sessions SET last_activity_at = NOW() WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE"
        );
        sqlx::query(query)
            .bind(session_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(sqlx_backend)?;
        Ok(())
    }

    async fn revoke(&self, token_hash: &[u8]) -> Result<Option<Session>, StoreError> {
        let query =
            format!("DELETE FROM sessions WHERE token_hash = $1 RETURNING {SESSION_COLUMNS}");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE"
        );
        let row = sqlx::query(&query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(sqlx_backend)?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn revoke_by_id(&self, session_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let query = "DELETE FROM sessions WHERE id = $1 AND user_id = $2";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE"
        );
        let result = sqlx::query(query)
            .bind(session_id)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(sqlx_backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_all(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let query = "DELETE FROM sessions WHERE user_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE"
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(sqlx_backend)?;
        Ok(result.rows_affected())
    }

    async fn active_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, StoreError> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE user_id = $1 AND expires_at > NOW() ORDER BY created_at"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .map_err(sqlx_backend)?;
        rows.iter().map(session_from_row).collect()
    }

    async fn sweep_expired(&self) -> Result<u64, StoreError> {
        let query = "DELETE FROM sessions WHERE expires_at <= NOW()";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE"
        );
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(sqlx_backend)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_token_is_stable_and_distinct() {
        let first = hash_token("token");
        let second = hash_token("token");
        let different = hash_token("other");
        assert_eq!(first, second);
        assert_ne!(first, different);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn session_serialization_skips_token_hash() {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            token_hash: vec![1, 2, 3],
            ip: Some("127.0.0.1".to_string()),
            user_agent: None,
            expires_at: now + ChronoDuration::hours(24),
            created_at: now,
            last_activity_at: now,
        };
        let json = serde_json::to_string(&session).unwrap();
        assert!(!json.contains("token_hash"));
        assert!(json.contains("127.0.0.1"));
    }
}
