//! Authentication and session security.
//!
//! Leaf components (password policy, rate limiter, roles, TOTP, tokens) are
//! pure and synchronous; the stores are async traits with a PostgreSQL
//! backend and an in-memory one; [`AuthService`] composes the lot.

pub mod audit;
pub mod error;
pub mod memory;
pub mod password;
pub mod rate_limit;
pub mod roles;
pub mod service;
pub mod session;
pub mod store;
pub mod token;
pub mod totp;
pub mod user;

pub use audit::{AuditEvent, AuditSink, PgAuditSink};
pub use error::AuthError;
pub use memory::MemoryStore;
pub use password::{PasswordViolation, validate_password};
pub use rate_limit::{RateLimitDecision, RateLimiter};
pub use roles::Role;
pub use service::{AuthConfig, AuthService, Authenticated, MfaEnrollment};
pub use session::{PgSessionStore, Session, SessionLookup, SessionStore, hash_token};
pub use store::{CredentialStore, PgCredentialStore, StoreError};
pub use token::{Claims, TokenError, TokenIssuer};
pub use totp::{TotpEngine, TotpError};
pub use user::{NewUser, User, UserProfile};
