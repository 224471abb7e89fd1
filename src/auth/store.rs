//! Credential storage behind a trait so tests and deployments inject their
//! own backend. The shipped backend is PostgreSQL.

use crate::auth::roles::Role;
use crate::auth::user::{NewUser, User};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} already exists")]
    Duplicate { entity: &'static str },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(anyhow::Error::new(err))
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// Row-atomic operations over user credentials. Each method maps to a single
/// statement; there are no read-modify-write cycles to race.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError>;
    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;
    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> Result<(), StoreError>;
    async fn set_role(&self, id: Uuid, role: Role) -> Result<(), StoreError>;
    async fn set_active(&self, id: Uuid, is_active: bool) -> Result<bool, StoreError>;
    /// Increment the failure counter and stamp the failure time.
    async fn record_failed_login(&self, id: Uuid) -> Result<(), StoreError>;
    /// Reset the failure counter and stamp the login time. Called only after
    /// every authentication step has passed.
    async fn record_successful_login(&self, id: Uuid) -> Result<(), StoreError>;
    /// Store an unconfirmed MFA secret; `mfa_enabled` stays false.
    async fn set_pending_mfa_secret(&self, id: Uuid, secret: &str) -> Result<(), StoreError>;
    /// Confirm the pending secret by flipping `mfa_enabled`.
    async fn enable_mfa(&self, id: Uuid) -> Result<(), StoreError>;
    async fn clear_mfa(&self, id: Uuid) -> Result<(), StoreError>;
    async fn delete_user(&self, id: Uuid) -> Result<bool, StoreError>;
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;
}

#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const USER_COLUMNS: &str = "id, username, password_hash, email, role, is_active, \
     mfa_enabled, mfa_secret, failed_login_attempts, last_failed_login_at, \
     last_login_at, created_at, updated_at";

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    let role_name: String = row.try_get("role").context("missing role column")?;
    let role = Role::parse(&role_name)
        .ok_or_else(|| StoreError::Backend(anyhow!("unknown role in database: {role_name}")))?;
    Ok(User {
        id: row.try_get("id").context("missing id column")?,
        username: row.try_get("username").context("missing username column")?,
        password_hash: row
            .try_get("password_hash")
            .context("missing password_hash column")?,
        email: row.try_get("email").context("missing email column")?,
        role,
        is_active: row.try_get("is_active").context("missing is_active column")?,
        mfa_enabled: row
            .try_get("mfa_enabled")
            .context("missing mfa_enabled column")?,
        mfa_secret: row
            .try_get("mfa_secret")
            .context("missing mfa_secret column")?,
        failed_login_attempts: row
            .try_get("failed_login_attempts")
            .context("missing failed_login_attempts column")?,
        last_failed_login_at: row
            .try_get("last_failed_login_at")
            .context("missing last_failed_login_at column")?,
        last_login_at: row
            .try_get("last_login_at")
            .context("missing last_login_at column")?,
        created_at: row.try_get("created_at").context("missing created_at column")?,
        updated_at: row.try_get("updated_at").context("missing updated_at column")?,
    })
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError> {
        let query = format!(
            "INSERT INTO users (username, password_hash, email, role) \
             VALUES ($1, $2, $3, $4) RETURNING {USER_COLUMNS}"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT"
        );
        let row = sqlx::query(&query)
            .bind(&new_user.username)
            .bind(&new_user.password_hash)
            .bind(&new_user.email)
            .bind(new_user.role.as_str())
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    StoreError::Duplicate { entity: "username" }
                } else {
                    StoreError::from(err)
                }
            })?;
        user_from_row(&row)
    }

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let row = sqlx::query(&query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> Result<(), StoreError> {
        let query = "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE"
        );
        sqlx::query(query)
            .bind(id)
            .bind(password_hash)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn set_role(&self, id: Uuid, role: Role) -> Result<(), StoreError> {
        let query = "UPDATE users SET role = $2, updated_at = NOW() WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE"
        );
        sqlx::query(query)
            .bind(id)
            .bind(role.as_str())
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn set_active(&self, id: Uuid, is_active: bool) -> Result<bool, StoreError> {
        let query = "UPDATE users SET is_active = $2, updated_at = NOW() WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE"
        );
        let result = sqlx::query(query)
            .bind(id)
            .bind(is_active)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_failed_login(&self, id: Uuid) -> Result<(), StoreError> {
        let query = "UPDATE users SET failed_login_attempts = failed_login_attempts + 1, \
             last_failed_login_at = NOW(), updated_at = NOW() WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE"
        );
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn record_successful_login(&self, id: Uuid) -> Result<(), StoreError> {
        let query = "UPDATE users SET failed_login_attempts = 0, last_login_at = NOW(), \
             updated_at = NOW() WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE"
        );
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn set_pending_mfa_secret(&self, id: Uuid, secret: &str) -> Result<(), StoreError> {
        let query = "UPDATE users SET mfa_secret = $2, mfa_enabled = FALSE, updated_at = NOW() \
             WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE"
        );
        sqlx::query(query)
            .bind(id)
            .bind(secret)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn enable_mfa(&self, id: Uuid) -> Result<(), StoreError> {
        let query = "UPDATE users SET mfa_enabled = TRUE, updated_at = NOW() \
             WHERE id = $1 AND mfa_secret IS NOT NULL";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE"
        );
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn clear_mfa(&self, id: Uuid) -> Result<(), StoreError> {
        let query = "UPDATE users SET mfa_enabled = FALSE, mfa_secret = NULL, updated_at = NOW() \
             WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE"
        );
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn delete_user(&self, id: Uuid) -> Result<bool, StoreError> {
        let query = "DELETE FROM users WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE"
        );
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users ORDER BY created_at");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .instrument(span)
            .await?;
        rows.iter().map(user_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test database error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &'static str {
            "test database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    #[test]
    fn is_unique_violation_matches_sqlstate() {
        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("23505"),
        }));
        assert!(is_unique_violation(&err));

        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("99999"),
        }));
        assert!(!is_unique_violation(&err));

        let err = sqlx::Error::RowNotFound;
        assert!(!is_unique_violation(&err));
    }

    #[test]
    fn duplicate_error_names_the_entity() {
        let err = StoreError::Duplicate { entity: "username" };
        assert_eq!(err.to_string(), "username already exists");
    }
}
