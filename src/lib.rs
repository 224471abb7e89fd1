//! Authentication and session security for the Vigil monitoring server.
//!
//! Credential verification, login rate limiting, signed bearer tokens backed
//! by revocable server-side sessions, TOTP based MFA and role checks, exposed
//! over an HTTP API.

pub mod api;
pub mod auth;
pub mod cli;
