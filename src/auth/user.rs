//! User records and the profile view returned to callers.

use crate::auth::roles::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Full credential record as stored. Never serialized to the outside; the
/// password hash and MFA secret stay server-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub email: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub mfa_enabled: bool,
    /// Present while MFA is enabled or an enrollment is pending confirmation.
    pub mfa_secret: Option<String>,
    pub failed_login_attempts: i32,
    pub last_failed_login_at: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// True when an MFA secret exists but has not been confirmed yet.
    #[must_use]
    pub fn mfa_pending(&self) -> bool {
        !self.mfa_enabled && self.mfa_secret.is_some()
    }
}

/// Public view of a user, safe to return from the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub mfa_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role,
            is_active: user.is_active,
            mfa_enabled: user.mfa_enabled,
            created_at: user.created_at,
            last_login_at: user.last_login_at,
        }
    }
}

/// Fields needed to create a user. The password is hashed before this struct
/// is built.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub email: Option<String>,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_user(username: &str, role: Role) -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash: "$argon2id$stub".to_string(),
            email: None,
            role,
            is_active: true,
            mfa_enabled: false,
            mfa_secret: None,
            failed_login_attempts: 0,
            last_failed_login_at: None,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn mfa_pending_requires_unconfirmed_secret() {
        let mut user = sample_user("alice", Role::User);
        assert!(!user.mfa_pending());

        user.mfa_secret = Some("SECRET".to_string());
        assert!(user.mfa_pending());

        user.mfa_enabled = true;
        assert!(!user.mfa_pending());
    }

    #[test]
    fn profile_omits_credentials() {
        let user = sample_user("alice", Role::Admin);
        let profile = UserProfile::from(&user);
        assert_eq!(profile.username, "alice");
        assert_eq!(profile.role, Role::Admin);
        let json = serde_json::to_string(&profile).unwrap();
        assert!(!json.contains("password"));
        assert!(!json.contains("secret"));
    }
}
