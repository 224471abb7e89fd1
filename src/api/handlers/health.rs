use axum::{Extension, http::StatusCode, response::IntoResponse};
use sqlx::PgPool;
use tracing::error;

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service and database are healthy"),
        (status = 503, description = "Database is unreachable")
    ),
    tag = "health"
)]
pub async fn health(pool: Extension<PgPool>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(&*pool).await {
        Ok(_) => StatusCode::OK,
        Err(err) => {
            error!("Health check failed: {err}");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
