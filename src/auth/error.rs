//! Error taxonomy for authentication flows.
//!
//! Unknown-username and wrong-password both surface as `InvalidCredentials`
//! and every session-verification failure surfaces as `InvalidSession`; the
//! distinct internal reasons live in logs and the audit trail only.

use crate::auth::password::PasswordViolation;
use crate::auth::store::StoreError;
use crate::auth::token::TokenError;
use crate::auth::totp::TotpError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("too many attempts, retry in {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("account is disabled")]
    AccountDisabled,
    #[error("invalid MFA code")]
    MfaInvalid,
    #[error("no MFA enrollment pending")]
    MfaNotPending,
    #[error("invalid or expired session")]
    InvalidSession,
    #[error("incorrect password")]
    IncorrectPassword,
    #[error("password does not meet policy requirements")]
    PasswordPolicy(Vec<PasswordViolation>),
    #[error("{0}")]
    Validation(String),
    #[error("user not found")]
    UserNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        Self::Internal(anyhow::Error::new(err))
    }
}

impl From<TotpError> for AuthError {
    fn from(err: TotpError) -> Self {
        Self::Internal(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_errors_share_a_uniform_message() {
        // Both lookup misses and password mismatches must read identically.
        assert_eq!(
            AuthError::InvalidCredentials.to_string(),
            "invalid username or password"
        );
    }

    #[test]
    fn policy_violations_carry_details() {
        let err = AuthError::PasswordPolicy(vec![PasswordViolation::TooShort]);
        match err {
            AuthError::PasswordPolicy(violations) => {
                assert_eq!(violations, vec![PasswordViolation::TooShort]);
            }
            _ => panic!("expected policy error"),
        }
    }
}
