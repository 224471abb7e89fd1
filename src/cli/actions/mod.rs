use secrecy::SecretString;

pub mod server;

#[derive(Debug)]
pub enum Action {
    Server {
        port: u16,
        dsn: String,
        token_secret: SecretString,
        totp_issuer: String,
        session_ttl_hours: u64,
        max_login_attempts: u64,
        rate_limit_window_seconds: u64,
    },
}
