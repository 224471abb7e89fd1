//! Time-based one-time passwords for the second authentication factor.

use thiserror::Error;
use totp_rs::{Algorithm, Secret, TOTP};

const DIGITS: usize = 6;
const SKEW: u8 = 1;
const STEP_SECONDS: u64 = 30;

#[derive(Debug, Error)]
pub enum TotpError {
    #[error("invalid TOTP secret")]
    InvalidSecret,
    #[error("failed to build TOTP instance: {0}")]
    Build(String),
    #[error("system clock error: {0}")]
    Clock(String),
}

/// Stateless TOTP engine: SHA-1, 6 digits, 30 second steps, one step of skew
/// in either direction. Secrets are handled as base32 strings and persistence
/// is left to the caller.
#[derive(Debug, Clone)]
pub struct TotpEngine {
    issuer: String,
}

impl TotpEngine {
    #[must_use]
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
        }
    }

    /// Generate a fresh random secret, base32 encoded.
    #[must_use]
    pub fn generate_secret() -> String {
        match Secret::generate_secret().to_encoded() {
            Secret::Encoded(secret) => secret,
            // to_encoded always yields the Encoded variant.
            Secret::Raw(_) => unreachable!("to_encoded returns an encoded secret"),
        }
    }

    /// Build the otpauth provisioning URL for an authenticator app.
    /// QR rendering is left to the client.
    ///
    /// # Errors
    /// Returns an error if the secret is not valid base32.
    pub fn provisioning_uri(&self, secret: &str, account: &str) -> Result<String, TotpError> {
        Ok(self.totp(secret, account)?.get_url())
    }

    /// Verify a code against the current time step, accepting one step of
    /// clock drift in either direction.
    ///
    /// # Errors
    /// Returns an error if the secret is invalid or the clock is unreadable.
    pub fn verify(&self, secret: &str, code: &str) -> Result<bool, TotpError> {
        let totp = self.totp(secret, "user")?;
        totp.check_current(code)
            .map_err(|err| TotpError::Clock(err.to_string()))
    }

    /// Verify a code at an explicit Unix timestamp.
    ///
    /// # Errors
    /// Returns an error if the secret is invalid.
    pub fn verify_at(&self, secret: &str, code: &str, unix_time: u64) -> Result<bool, TotpError> {
        Ok(self.totp(secret, "user")?.check(code, unix_time))
    }

    /// Compute the code for an explicit Unix timestamp. Test helper for
    /// driving full authentication flows without a real authenticator.
    ///
    /// # Errors
    /// Returns an error if the secret is invalid.
    pub fn code_at(&self, secret: &str, unix_time: u64) -> Result<String, TotpError> {
        Ok(self.totp(secret, "user")?.generate(unix_time))
    }

    fn totp(&self, secret: &str, account: &str) -> Result<TOTP, TotpError> {
        let secret_bytes = Secret::Encoded(secret.to_string())
            .to_bytes()
            .map_err(|_| TotpError::InvalidSecret)?;
        TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            SKEW,
            STEP_SECONDS,
            secret_bytes,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|err| TotpError::Build(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn engine() -> TotpEngine {
        TotpEngine::new("vigil")
    }

    #[test]
    fn generated_secret_is_usable() {
        let secret = TotpEngine::generate_secret();
        let code = engine().code_at(&secret, NOW).unwrap();
        assert_eq!(code.len(), 6);
        assert!(engine().verify_at(&secret, &code, NOW).unwrap());
    }

    #[test]
    fn accepts_adjacent_steps_rejects_beyond() {
        let secret = TotpEngine::generate_secret();
        let engine = engine();
        let code = engine.code_at(&secret, NOW).unwrap();

        assert!(engine.verify_at(&secret, &code, NOW).unwrap());
        assert!(engine.verify_at(&secret, &code, NOW + 30).unwrap());
        assert!(engine.verify_at(&secret, &code, NOW - 30).unwrap());
        assert!(!engine.verify_at(&secret, &code, NOW + 60).unwrap());
        assert!(!engine.verify_at(&secret, &code, NOW - 60).unwrap());
    }

    #[test]
    fn rejects_wrong_code() {
        let secret = TotpEngine::generate_secret();
        assert!(!engine().verify_at(&secret, "000000", NOW).unwrap()
            || !engine().verify_at(&secret, "999999", NOW).unwrap());
    }

    #[test]
    fn rejects_invalid_secret() {
        assert!(matches!(
            engine().verify_at("not base32!", "123456", NOW),
            Err(TotpError::InvalidSecret)
        ));
    }

    #[test]
    fn provisioning_uri_names_issuer_and_account() {
        let secret = TotpEngine::generate_secret();
        let uri = engine().provisioning_uri(&secret, "alice").unwrap();
        assert!(uri.starts_with("otpauth://totp/"));
        assert!(uri.contains("alice"));
        assert!(uri.contains("issuer=vigil"));
    }
}
