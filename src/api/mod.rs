//! HTTP surface: router construction and server startup.

use crate::auth::AuthService;
use anyhow::Result;
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::{delete, get, post, put},
};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;

pub mod handlers;

pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Build the API router. The service and pool ride along as extensions.
#[must_use]
pub fn router(service: Arc<AuthService>, pool: PgPool) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/v1/auth/login", post(handlers::auth::login))
        .route("/v1/auth/logout", post(handlers::auth::logout))
        .route("/v1/auth/logout-all", post(handlers::auth::logout_all))
        .route("/v1/auth/session", get(handlers::auth::session))
        .route("/v1/auth/sessions", get(handlers::auth::sessions))
        .route(
            "/v1/auth/sessions/:session_id",
            delete(handlers::auth::revoke_session),
        )
        .route("/v1/auth/password", post(handlers::auth::change_password))
        .route("/v1/auth/mfa/enroll", post(handlers::auth::mfa_enroll))
        .route("/v1/auth/mfa/confirm", post(handlers::auth::mfa_confirm))
        .route("/v1/auth/mfa/disable", post(handlers::auth::mfa_disable))
        .route(
            "/v1/users",
            get(handlers::auth::list_users).post(handlers::auth::create_user),
        )
        .route(
            "/v1/users/:user_id",
            put(handlers::auth::update_user).delete(handlers::auth::delete_user),
        )
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(service))
                .layer(Extension(pool)),
        )
}

/// Start the server and run until interrupted.
///
/// # Errors
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(port: u16, service: Arc<AuthService>, pool: PgPool) -> Result<()> {
    let app = router(service, pool);
    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
