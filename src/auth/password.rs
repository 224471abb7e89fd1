//! Password policy validation and Argon2id hashing.

use anyhow::{Result, anyhow};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use std::sync::OnceLock;
use thiserror::Error;

pub const MIN_PASSWORD_LENGTH: usize = 8;
const SPECIAL_CHARS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PasswordViolation {
    #[error("password must be at least {MIN_PASSWORD_LENGTH} characters long")]
    TooShort,
    #[error("password must contain an uppercase letter")]
    MissingUppercase,
    #[error("password must contain a lowercase letter")]
    MissingLowercase,
    #[error("password must contain a digit")]
    MissingDigit,
    #[error("password must contain a special character")]
    MissingSpecial,
}

/// Check a candidate password against the policy.
///
/// Every violated rule is reported, not just the first one, so callers can
/// surface the full list to the user.
#[must_use]
pub fn validate_password(password: &str) -> Vec<PasswordViolation> {
    let mut violations = Vec::new();
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        violations.push(PasswordViolation::TooShort);
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        violations.push(PasswordViolation::MissingUppercase);
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        violations.push(PasswordViolation::MissingLowercase);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        violations.push(PasswordViolation::MissingDigit);
    }
    if !password.chars().any(|c| SPECIAL_CHARS.contains(c)) {
        violations.push(PasswordViolation::MissingSpecial);
    }
    violations
}

/// Hash a password with Argon2id and a fresh random salt.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash password: {err}"))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored PHC-format hash.
///
/// A malformed stored hash counts as a mismatch rather than an error so the
/// login path stays uniform.
#[must_use]
pub fn verify_password(stored_hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Burn an Argon2 verification against a fixed hash.
///
/// Used on lookup misses so the unknown-username path costs the same as a
/// real password check and usernames cannot be enumerated by timing.
pub fn dummy_verify(password: &str) {
    static DUMMY_HASH: OnceLock<String> = OnceLock::new();
    let hash = DUMMY_HASH.get_or_init(|| {
        hash_password("vigil-timing-equalizer").unwrap_or_else(|_| String::new())
    });
    let _ = verify_password(hash, password);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_compliant_password() {
        assert!(validate_password("Secur3!pass").is_empty());
    }

    #[test]
    fn each_rule_reported_independently() {
        assert_eq!(
            validate_password("short"),
            vec![
                PasswordViolation::TooShort,
                PasswordViolation::MissingUppercase,
                PasswordViolation::MissingDigit,
                PasswordViolation::MissingSpecial,
            ]
        );
        assert_eq!(
            validate_password("alllowercase1!"),
            vec![PasswordViolation::MissingUppercase]
        );
        assert_eq!(
            validate_password("ALLUPPERCASE1!"),
            vec![PasswordViolation::MissingLowercase]
        );
        assert_eq!(
            validate_password("NoDigits!!"),
            vec![PasswordViolation::MissingDigit]
        );
        assert_eq!(
            validate_password("NoSpecial1"),
            vec![PasswordViolation::MissingSpecial]
        );
    }

    #[test]
    fn empty_password_violates_everything() {
        assert_eq!(validate_password("").len(), 5);
    }

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_password("Secur3!pass").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password(&hash, "Secur3!pass"));
        assert!(!verify_password(&hash, "Wrong3!pass"));
    }

    #[test]
    fn hashes_are_salted() {
        let first = hash_password("Secur3!pass").unwrap();
        let second = hash_password("Secur3!pass").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn malformed_hash_is_a_mismatch() {
        assert!(!verify_password("not-a-phc-string", "Secur3!pass"));
        assert!(!verify_password("", "Secur3!pass"));
    }

    #[test]
    fn dummy_verify_does_not_panic() {
        dummy_verify("anything");
        dummy_verify("");
    }
}
