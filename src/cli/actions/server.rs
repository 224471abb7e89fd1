use crate::{
    api,
    auth::{
        AuthConfig, AuthService, PgAuditSink, PgCredentialStore, PgSessionStore, RateLimiter,
        TokenIssuer, TotpEngine,
    },
    cli::actions::Action,
};
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tracing::{error, info};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Handle the server action
pub async fn handle(action: Action) -> Result<()> {
    let Action::Server {
        port,
        dsn,
        token_secret,
        totp_issuer,
        session_ttl_hours,
        max_login_attempts,
        rate_limit_window_seconds,
    } = action;

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let users = Arc::new(PgCredentialStore::new(pool.clone()));
    let sessions = Arc::new(PgSessionStore::new(pool.clone()));
    let audit = Arc::new(PgAuditSink::new(pool.clone()));

    let limiter = RateLimiter::new(
        usize::try_from(max_login_attempts).context("max login attempts out of range")?,
        Duration::from_secs(rate_limit_window_seconds),
    );
    let tokens = TokenIssuer::new(token_secret);
    let totp = TotpEngine::new(totp_issuer);
    let config =
        AuthConfig::new().with_session_ttl(Duration::from_secs(session_ttl_hours * 3600));

    let service = Arc::new(AuthService::new(
        users, sessions, audit, limiter, tokens, totp, config,
    ));

    tokio::spawn(sweep_expired_sessions(Arc::clone(&service)));

    api::serve(port, service, pool).await
}

/// Periodically delete sessions past their expiry.
async fn sweep_expired_sessions(service: Arc<AuthService>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        interval.tick().await;

        match service.sweep_expired().await {
            Ok(0) => {}
            Ok(removed) => info!("Swept {} expired sessions", removed),
            Err(err) => error!("Session sweep failed: {}", err),
        }
    }
}
