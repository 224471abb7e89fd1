//! Authentication orchestrator.
//!
//! Composes the credential store, session registry, audit sink, rate
//! limiter, token issuer, and TOTP engine. Every terminal outcome of an
//! authentication attempt produces exactly one audit record.

use crate::auth::audit::{AuditEvent, AuditSink};
use crate::auth::error::AuthError;
use crate::auth::password::{self, validate_password};
use crate::auth::rate_limit::{RateLimitDecision, RateLimiter};
use crate::auth::roles::Role;
use crate::auth::session::{SessionLookup, SessionStore, hash_token};
use crate::auth::store::{CredentialStore, StoreError};
use crate::auth::token::TokenIssuer;
use crate::auth::totp::TotpEngine;
use crate::auth::user::{NewUser, User, UserProfile};
use crate::auth::Session;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Debug)]
pub struct AuthConfig {
    session_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }

    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }
}

/// Outcome of a successful authentication call. A missing MFA code on an
/// MFA-enabled account is a soft continuation, not an error.
#[derive(Debug, Clone)]
pub enum Authenticated {
    Granted { token: String, profile: UserProfile },
    MfaRequired { user_id: Uuid },
}

/// Secret and otpauth URL handed to the user during MFA enrollment. The
/// secret stays pending until the first code is confirmed.
#[derive(Debug, Clone)]
pub struct MfaEnrollment {
    pub secret: String,
    pub provisioning_uri: String,
}

pub struct AuthService {
    users: Arc<dyn CredentialStore>,
    sessions: Arc<dyn SessionStore>,
    audit: Arc<dyn AuditSink>,
    limiter: RateLimiter,
    tokens: TokenIssuer,
    totp: TotpEngine,
    config: AuthConfig,
}

fn is_valid_username(username: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]{3,100}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(username))
}

async fn verify_password_blocking(hash: String, candidate: String) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || password::verify_password(&hash, &candidate))
        .await
        .map_err(anyhow::Error::new)
        .map_err(AuthError::from)
}

async fn hash_password_blocking(candidate: String) -> Result<String, AuthError> {
    let hash = tokio::task::spawn_blocking(move || password::hash_password(&candidate))
        .await
        .map_err(anyhow::Error::new)??;
    Ok(hash)
}

impl AuthService {
    #[must_use]
    pub fn new(
        users: Arc<dyn CredentialStore>,
        sessions: Arc<dyn SessionStore>,
        audit: Arc<dyn AuditSink>,
        limiter: RateLimiter,
        tokens: TokenIssuer,
        totp: TotpEngine,
        config: AuthConfig,
    ) -> Self {
        Self {
            users,
            sessions,
            audit,
            limiter,
            tokens,
            totp,
            config,
        }
    }

    /// Run the full authentication sequence: rate check, lookup, active
    /// check, password check, MFA check, then token and session issuance.
    ///
    /// # Errors
    /// Returns `RateLimited`, `InvalidCredentials`, `AccountDisabled`, or
    /// `MfaInvalid` per the failing step, or a store/internal error.
    pub async fn authenticate(
        &self,
        username: &str,
        candidate_password: &str,
        mfa_code: Option<&str>,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Authenticated, AuthError> {
        if let RateLimitDecision::Limited {
            retry_after_seconds,
        } = self.limiter.check(username)
        {
            warn!(username, retry_after_seconds, "login attempt rate limited");
            self.audit
                .record(
                    AuditEvent::new("login_failed", "rate_limited")
                        .username(username)
                        .client(ip, user_agent)
                        .details(&format!("retry after {retry_after_seconds}s")),
                )
                .await;
            return Err(AuthError::RateLimited {
                retry_after_seconds,
            });
        }

        let Some(user) = self.users.user_by_username(username).await? else {
            // Burn a hash verification so unknown usernames cost the same as
            // known ones.
            let candidate = candidate_password.to_string();
            tokio::task::spawn_blocking(move || password::dummy_verify(&candidate))
                .await
                .map_err(anyhow::Error::new)?;
            self.limiter.record_failure(username);
            self.audit
                .record(
                    AuditEvent::new("login_failed", "invalid_credentials")
                        .username(username)
                        .client(ip, user_agent),
                )
                .await;
            return Err(AuthError::InvalidCredentials);
        };

        // Verify the password before branching on account state so the
        // disabled path is indistinguishable in cost from the live one.
        let password_ok = verify_password_blocking(
            user.password_hash.clone(),
            candidate_password.to_string(),
        )
        .await?;

        if !user.is_active {
            self.audit
                .record(
                    AuditEvent::new("login_failed", "account_disabled")
                        .user(user.id)
                        .username(username)
                        .client(ip, user_agent),
                )
                .await;
            return Err(AuthError::AccountDisabled);
        }

        if !password_ok {
            self.limiter.record_failure(username);
            self.users.record_failed_login(user.id).await?;
            self.audit
                .record(
                    AuditEvent::new("login_failed", "invalid_password")
                        .user(user.id)
                        .username(username)
                        .client(ip, user_agent),
                )
                .await;
            return Err(AuthError::InvalidCredentials);
        }

        if user.mfa_enabled {
            let Some(secret) = user.mfa_secret.as_deref() else {
                return Err(AuthError::Internal(anyhow::anyhow!(
                    "MFA enabled without a stored secret for user {}",
                    user.id
                )));
            };
            let Some(code) = mfa_code else {
                self.audit
                    .record(
                        AuditEvent::new("login_mfa_required", "pending")
                            .user(user.id)
                            .username(username)
                            .client(ip, user_agent),
                    )
                    .await;
                return Ok(Authenticated::MfaRequired { user_id: user.id });
            };
            if !self.totp.verify(secret, code)? {
                self.limiter.record_failure(username);
                self.users.record_failed_login(user.id).await?;
                self.audit
                    .record(
                        AuditEvent::new("login_failed", "invalid_mfa")
                            .user(user.id)
                            .username(username)
                            .client(ip, user_agent),
                    )
                    .await;
                return Err(AuthError::MfaInvalid);
            }
        }

        self.issue(&user, ip, user_agent).await
    }

    async fn issue(
        &self,
        user: &User,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Authenticated, AuthError> {
        self.limiter.reset(&user.username);
        self.users.record_successful_login(user.id).await?;

        let token = self
            .tokens
            .issue(user.id, &user.username, user.role, self.config.session_ttl)?;
        self.sessions
            .create(
                user.id,
                hash_token(&token),
                ip.map(ToString::to_string),
                user_agent.map(ToString::to_string),
                self.config.session_ttl,
            )
            .await?;

        self.audit
            .record(
                AuditEvent::new("login_success", "success")
                    .user(user.id)
                    .username(&user.username)
                    .client(ip, user_agent),
            )
            .await;
        info!(username = %user.username, "login succeeded");

        let profile = self
            .users
            .user_by_id(user.id)
            .await?
            .as_ref()
            .map_or_else(|| UserProfile::from(user), UserProfile::from);
        Ok(Authenticated::Granted { token, profile })
    }

    /// Verify a bearer token. Both the signature and a live session record
    /// are required; revocation always wins over cryptographic validity.
    ///
    /// # Errors
    /// Returns `InvalidSession` for every rejection; the distinct reason
    /// goes to the logs and audit trail only.
    pub async fn verify_token(&self, token: &str) -> Result<UserProfile, AuthError> {
        let claims = match self.tokens.verify(token) {
            Ok(claims) => claims,
            Err(err) => return self.reject_session(&format!("token rejected: {err}")).await,
        };

        let session = match self.sessions.validate(&hash_token(token)).await? {
            SessionLookup::Active(session) => session,
            SessionLookup::Expired => return self.reject_session("session expired").await,
            SessionLookup::NotFound => {
                return self.reject_session("session revoked or unknown").await;
            }
        };

        let Some(user) = self.users.user_by_id(claims.sub).await? else {
            return self.reject_session("user no longer exists").await;
        };
        if !user.is_active {
            return self.reject_session("account disabled").await;
        }

        self.sessions.touch(session.id).await?;
        debug!(username = %user.username, "session verified");
        Ok(UserProfile::from(&user))
    }

    async fn reject_session(&self, reason: &str) -> Result<UserProfile, AuthError> {
        debug!(reason, "session verification failed");
        self.audit
            .record(AuditEvent::new("session_verify_failed", "failed").details(reason))
            .await;
        Err(AuthError::InvalidSession)
    }

    /// Revoke the session behind a token. Revoking an unknown or already
    /// revoked token is a no-op.
    ///
    /// # Errors
    /// Returns an error only on store failure.
    pub async fn logout(
        &self,
        token: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(), AuthError> {
        if let Some(session) = self.sessions.revoke(&hash_token(token)).await? {
            self.audit
                .record(
                    AuditEvent::new("logout", "success")
                        .user(session.user_id)
                        .client(ip, user_agent),
                )
                .await;
        }
        Ok(())
    }

    /// Revoke every session a user holds. Returns the number revoked.
    ///
    /// # Errors
    /// Returns an error only on store failure.
    pub async fn logout_all(&self, user_id: Uuid) -> Result<u64, AuthError> {
        let revoked = self.sessions.revoke_all(user_id).await?;
        self.audit
            .record(
                AuditEvent::new("logout_all", "success")
                    .user(user_id)
                    .details(&format!("{revoked} sessions revoked")),
            )
            .await;
        Ok(revoked)
    }

    /// Create a user with an explicit role. There is no first-user-becomes-
    /// admin shortcut; bootstrap accounts are provisioned deliberately.
    ///
    /// # Errors
    /// Returns `Validation` for a malformed or taken username and
    /// `PasswordPolicy` when the password fails the policy.
    pub async fn register(
        &self,
        username: &str,
        candidate_password: &str,
        email: Option<&str>,
        role: Role,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<UserProfile, AuthError> {
        if !is_valid_username(username) {
            return Err(AuthError::Validation(
                "username must be 3-100 characters of letters, digits, '.', '_' or '-'"
                    .to_string(),
            ));
        }
        let violations = validate_password(candidate_password);
        if !violations.is_empty() {
            return Err(AuthError::PasswordPolicy(violations));
        }

        let password_hash = hash_password_blocking(candidate_password.to_string()).await?;
        let user = self
            .users
            .create_user(NewUser {
                username: username.to_string(),
                password_hash,
                email: email.map(ToString::to_string),
                role,
            })
            .await
            .map_err(|err| match err {
                StoreError::Duplicate { .. } => {
                    AuthError::Validation("username already taken".to_string())
                }
                other => AuthError::Store(other),
            })?;

        self.audit
            .record(
                AuditEvent::new("user_created", "success")
                    .user(user.id)
                    .username(&user.username)
                    .client(ip, user_agent)
                    .details(&format!("role {}", user.role)),
            )
            .await;
        info!(username = %user.username, role = %user.role, "user created");
        Ok(UserProfile::from(&user))
    }

    /// Change a password after re-confirming the old one.
    ///
    /// # Errors
    /// Returns `IncorrectPassword` when the old password does not match and
    /// `PasswordPolicy` when the new one fails the policy.
    pub async fn change_password(
        &self,
        user_id: Uuid,
        old_password: &str,
        new_password: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(), AuthError> {
        let user = self
            .users
            .user_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        let old_ok =
            verify_password_blocking(user.password_hash.clone(), old_password.to_string()).await?;
        if !old_ok {
            self.audit
                .record(
                    AuditEvent::new("password_change_failed", "incorrect_password")
                        .user(user.id)
                        .username(&user.username)
                        .client(ip, user_agent),
                )
                .await;
            return Err(AuthError::IncorrectPassword);
        }

        let violations = validate_password(new_password);
        if !violations.is_empty() {
            return Err(AuthError::PasswordPolicy(violations));
        }

        let password_hash = hash_password_blocking(new_password.to_string()).await?;
        self.users.set_password_hash(user.id, &password_hash).await?;
        self.audit
            .record(
                AuditEvent::new("password_changed", "success")
                    .user(user.id)
                    .username(&user.username)
                    .client(ip, user_agent),
            )
            .await;
        Ok(())
    }

    /// Begin MFA enrollment: store a pending secret and return it with the
    /// provisioning URL. MFA stays disabled until the first code confirms.
    ///
    /// # Errors
    /// Returns `Validation` when MFA is already enabled.
    pub async fn enable_mfa(
        &self,
        user_id: Uuid,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<MfaEnrollment, AuthError> {
        let user = self
            .users
            .user_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        if user.mfa_enabled {
            return Err(AuthError::Validation("MFA is already enabled".to_string()));
        }

        let secret = TotpEngine::generate_secret();
        let provisioning_uri = self.totp.provisioning_uri(&secret, &user.username)?;
        self.users.set_pending_mfa_secret(user.id, &secret).await?;

        self.audit
            .record(
                AuditEvent::new("mfa_enrollment_started", "pending")
                    .user(user.id)
                    .username(&user.username)
                    .client(ip, user_agent),
            )
            .await;
        Ok(MfaEnrollment {
            secret,
            provisioning_uri,
        })
    }

    /// Confirm a pending MFA enrollment with a first code.
    ///
    /// # Errors
    /// Returns `MfaNotPending` without a pending secret and `MfaInvalid`
    /// when the code does not verify.
    pub async fn confirm_mfa(
        &self,
        user_id: Uuid,
        code: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(), AuthError> {
        let user = self
            .users
            .user_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        if user.mfa_enabled {
            return Ok(());
        }
        let Some(secret) = user.mfa_secret.as_deref() else {
            return Err(AuthError::MfaNotPending);
        };

        if !self.totp.verify(secret, code)? {
            self.audit
                .record(
                    AuditEvent::new("mfa_confirm_failed", "invalid_code")
                        .user(user.id)
                        .username(&user.username)
                        .client(ip, user_agent),
                )
                .await;
            return Err(AuthError::MfaInvalid);
        }

        self.users.enable_mfa(user.id).await?;
        self.audit
            .record(
                AuditEvent::new("mfa_enabled", "success")
                    .user(user.id)
                    .username(&user.username)
                    .client(ip, user_agent),
            )
            .await;
        Ok(())
    }

    /// Disable MFA after re-confirming the password.
    ///
    /// # Errors
    /// Returns `IncorrectPassword` when the password does not match.
    pub async fn disable_mfa(
        &self,
        user_id: Uuid,
        candidate_password: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(), AuthError> {
        let user = self
            .users
            .user_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        let ok = verify_password_blocking(
            user.password_hash.clone(),
            candidate_password.to_string(),
        )
        .await?;
        if !ok {
            self.audit
                .record(
                    AuditEvent::new("mfa_disable_failed", "incorrect_password")
                        .user(user.id)
                        .username(&user.username)
                        .client(ip, user_agent),
                )
                .await;
            return Err(AuthError::IncorrectPassword);
        }

        self.users.clear_mfa(user.id).await?;
        self.audit
            .record(
                AuditEvent::new("mfa_disabled", "success")
                    .user(user.id)
                    .username(&user.username)
                    .client(ip, user_agent),
            )
            .await;
        Ok(())
    }

    /// Update a user's role or active flag. Absent fields are left alone.
    /// Deactivation takes effect on the next verification; live sessions are
    /// rejected by `verify_token`'s active check.
    ///
    /// # Errors
    /// Returns `UserNotFound` for an unknown id.
    pub async fn update_user(
        &self,
        user_id: Uuid,
        role: Option<Role>,
        is_active: Option<bool>,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<UserProfile, AuthError> {
        let user = self
            .users
            .user_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        let mut changes = Vec::new();
        if let Some(role) = role {
            self.users.set_role(user.id, role).await?;
            changes.push(format!("role {role}"));
        }
        if let Some(active) = is_active {
            self.users.set_active(user.id, active).await?;
            changes.push(format!("is_active {active}"));
        }

        if !changes.is_empty() {
            self.audit
                .record(
                    AuditEvent::new("user_updated", "success")
                        .user(user.id)
                        .username(&user.username)
                        .client(ip, user_agent)
                        .details(&changes.join(", ")),
                )
                .await;
            info!(username = %user.username, "user updated");
        }

        let updated = self
            .users
            .user_by_id(user.id)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        Ok(UserProfile::from(&updated))
    }

    /// Delete a user and every session they hold. The audit row keeps the
    /// username but no user id, since the row it would reference is gone.
    ///
    /// # Errors
    /// Returns `UserNotFound` for an unknown id.
    pub async fn delete_user(
        &self,
        user_id: Uuid,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(), AuthError> {
        let user = self
            .users
            .user_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        self.sessions.revoke_all(user.id).await?;
        if !self.users.delete_user(user.id).await? {
            return Err(AuthError::UserNotFound);
        }

        self.audit
            .record(
                AuditEvent::new("user_deleted", "success")
                    .username(&user.username)
                    .client(ip, user_agent),
            )
            .await;
        info!(username = %user.username, "user deleted");
        Ok(())
    }

    #[must_use]
    pub fn check_permission(&self, profile: &UserProfile, required: Role) -> bool {
        profile.role.allows(required)
    }

    /// Live sessions for a user, for the account security page.
    ///
    /// # Errors
    /// Returns an error only on store failure.
    pub async fn active_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, AuthError> {
        Ok(self.sessions.active_sessions(user_id).await?)
    }

    /// Revoke one session by id, only if it belongs to the user.
    ///
    /// # Errors
    /// Returns an error only on store failure.
    pub async fn revoke_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<bool, AuthError> {
        let revoked = self.sessions.revoke_by_id(session_id, user_id).await?;
        if revoked {
            self.audit
                .record(
                    AuditEvent::new("session_revoked", "success")
                        .user(user_id)
                        .resource(&session_id.to_string())
                        .client(ip, user_agent),
                )
                .await;
        }
        Ok(revoked)
    }

    /// Profiles of every user, for administrative listings.
    ///
    /// # Errors
    /// Returns an error only on store failure.
    pub async fn list_users(&self) -> Result<Vec<UserProfile>, AuthError> {
        let users = self.users.list_users().await?;
        Ok(users.iter().map(UserProfile::from).collect())
    }

    /// Delete expired sessions. Run periodically by the server.
    ///
    /// # Errors
    /// Returns an error only on store failure.
    pub async fn sweep_expired(&self) -> Result<u64, AuthError> {
        let swept = self.sessions.sweep_expired().await?;
        if swept > 0 {
            debug!(swept, "expired sessions removed");
        }
        Ok(swept)
    }
}
