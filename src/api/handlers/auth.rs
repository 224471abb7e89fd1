//! Authentication endpoints over bearer tokens.

use crate::auth::{AuthError, AuthService, Authenticated, Role, Session, UserProfile};
use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub mfa_code: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub mfa_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    pub role: Role,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateUserRequest {
    pub role: Option<Role>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MfaEnrollmentResponse {
    pub secret: String,
    pub provisioning_uri: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MfaCodeRequest {
    pub code: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MfaDisableRequest {
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
}

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Extract a client IP from common proxy headers for audit records.
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn extract_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn error_body(message: &str, details: Option<Vec<String>>) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        error: message.to_string(),
        details,
    })
}

/// Map a domain error onto a wire response. Rate limiting carries a
/// `Retry-After` header; internal failures never leak their cause.
pub(crate) fn error_response(err: &AuthError) -> Response {
    match err {
        AuthError::RateLimited {
            retry_after_seconds,
        } => {
            let mut response =
                (StatusCode::TOO_MANY_REQUESTS, error_body(&err.to_string(), None))
                    .into_response();
            if let Ok(value) = retry_after_seconds.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
            response
        }
        AuthError::InvalidCredentials | AuthError::MfaInvalid | AuthError::InvalidSession => {
            (StatusCode::UNAUTHORIZED, error_body(&err.to_string(), None)).into_response()
        }
        AuthError::AccountDisabled | AuthError::IncorrectPassword => {
            (StatusCode::FORBIDDEN, error_body(&err.to_string(), None)).into_response()
        }
        AuthError::PasswordPolicy(violations) => {
            let details = violations.iter().map(ToString::to_string).collect();
            (
                StatusCode::BAD_REQUEST,
                error_body(&err.to_string(), Some(details)),
            )
                .into_response()
        }
        AuthError::MfaNotPending | AuthError::Validation(_) => {
            (StatusCode::BAD_REQUEST, error_body(&err.to_string(), None)).into_response()
        }
        AuthError::UserNotFound => {
            (StatusCode::NOT_FOUND, error_body(&err.to_string(), None)).into_response()
        }
        AuthError::Store(_) | AuthError::Internal(_) => {
            error!("Internal error: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internal server error", None),
            )
                .into_response()
        }
    }
}

/// Resolve the bearer token into a profile, or fail with 401.
async fn require_session(
    headers: &HeaderMap,
    service: &AuthService,
) -> Result<(UserProfile, String), Response> {
    let Some(token) = extract_bearer_token(headers) else {
        return Err((
            StatusCode::UNAUTHORIZED,
            error_body("missing bearer token", None),
        )
            .into_response());
    };
    match service.verify_token(&token).await {
        Ok(profile) => Ok((profile, token)),
        Err(err) => Err(error_response(&err)),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Token issued or MFA code required", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    service: Extension<Arc<AuthService>>,
    Json(request): Json<LoginRequest>,
) -> Response {
    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    let outcome = service
        .authenticate(
            &request.username,
            &request.password,
            request.mfa_code.as_deref(),
            ip.as_deref(),
            user_agent.as_deref(),
        )
        .await;
    match outcome {
        Ok(Authenticated::Granted { token, profile }) => (
            StatusCode::OK,
            Json(LoginResponse {
                token: Some(token),
                mfa_required: false,
                user: Some(profile),
            }),
        )
            .into_response(),
        Ok(Authenticated::MfaRequired { .. }) => (
            StatusCode::OK,
            Json(LoginResponse {
                token: None,
                mfa_required: true,
                user: None,
            }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 204, description = "Session revoked, or nothing to revoke")
    ),
    tag = "auth"
)]
pub async fn logout(headers: HeaderMap, service: Extension<Arc<AuthService>>) -> Response {
    if let Some(token) = extract_bearer_token(&headers) {
        let ip = extract_client_ip(&headers);
        let user_agent = extract_user_agent(&headers);
        if let Err(err) = service
            .logout(&token, ip.as_deref(), user_agent.as_deref())
            .await
        {
            return error_response(&err);
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout-all",
    responses(
        (status = 204, description = "Every session for the caller revoked"),
        (status = 401, description = "No valid session", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn logout_all(headers: HeaderMap, service: Extension<Arc<AuthService>>) -> Response {
    let (profile, _token) = match require_session(&headers, &service).await {
        Ok(authenticated) => authenticated,
        Err(response) => return response,
    };
    match service.logout_all(profile.id).await {
        Ok(_revoked) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    get,
    path = "/v1/auth/session",
    responses(
        (status = 200, description = "Session is active", body = UserProfile),
        (status = 401, description = "No valid session", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn session(headers: HeaderMap, service: Extension<Arc<AuthService>>) -> Response {
    match require_session(&headers, &service).await {
        Ok((profile, _token)) => (StatusCode::OK, Json(profile)).into_response(),
        Err(response) => response,
    }
}

#[utoipa::path(
    get,
    path = "/v1/auth/sessions",
    responses(
        (status = 200, description = "Active sessions for the caller", body = SessionListResponse),
        (status = 401, description = "No valid session", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn sessions(headers: HeaderMap, service: Extension<Arc<AuthService>>) -> Response {
    let (profile, _token) = match require_session(&headers, &service).await {
        Ok(authenticated) => authenticated,
        Err(response) => return response,
    };
    match service.active_sessions(profile.id).await {
        Ok(sessions) => (StatusCode::OK, Json(SessionListResponse { sessions })).into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    delete,
    path = "/v1/auth/sessions/{session_id}",
    params(("session_id" = Uuid, Path, description = "Session to revoke")),
    responses(
        (status = 204, description = "Session revoked"),
        (status = 404, description = "No such session for this user", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn revoke_session(
    headers: HeaderMap,
    service: Extension<Arc<AuthService>>,
    Path(session_id): Path<Uuid>,
) -> Response {
    let (profile, _token) = match require_session(&headers, &service).await {
        Ok(authenticated) => authenticated,
        Err(response) => return response,
    };
    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    match service
        .revoke_session(session_id, profile.id, ip.as_deref(), user_agent.as_deref())
        .await
    {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => {
            (StatusCode::NOT_FOUND, error_body("no such session", None)).into_response()
        }
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 204, description = "Password changed"),
        (status = 400, description = "New password fails the policy", body = ErrorResponse),
        (status = 403, description = "Old password incorrect", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn change_password(
    headers: HeaderMap,
    service: Extension<Arc<AuthService>>,
    Json(request): Json<ChangePasswordRequest>,
) -> Response {
    let (profile, _token) = match require_session(&headers, &service).await {
        Ok(authenticated) => authenticated,
        Err(response) => return response,
    };
    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    match service
        .change_password(
            profile.id,
            &request.old_password,
            &request.new_password,
            ip.as_deref(),
            user_agent.as_deref(),
        )
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/mfa/enroll",
    responses(
        (status = 200, description = "Enrollment started", body = MfaEnrollmentResponse),
        (status = 400, description = "MFA already enabled", body = ErrorResponse)
    ),
    tag = "mfa"
)]
pub async fn mfa_enroll(headers: HeaderMap, service: Extension<Arc<AuthService>>) -> Response {
    let (profile, _token) = match require_session(&headers, &service).await {
        Ok(authenticated) => authenticated,
        Err(response) => return response,
    };
    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    match service
        .enable_mfa(profile.id, ip.as_deref(), user_agent.as_deref())
        .await
    {
        Ok(enrollment) => (
            StatusCode::OK,
            Json(MfaEnrollmentResponse {
                secret: enrollment.secret,
                provisioning_uri: enrollment.provisioning_uri,
            }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/mfa/confirm",
    request_body = MfaCodeRequest,
    responses(
        (status = 204, description = "MFA enabled"),
        (status = 400, description = "No enrollment pending", body = ErrorResponse),
        (status = 401, description = "Code did not verify", body = ErrorResponse)
    ),
    tag = "mfa"
)]
pub async fn mfa_confirm(
    headers: HeaderMap,
    service: Extension<Arc<AuthService>>,
    Json(request): Json<MfaCodeRequest>,
) -> Response {
    let (profile, _token) = match require_session(&headers, &service).await {
        Ok(authenticated) => authenticated,
        Err(response) => return response,
    };
    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    match service
        .confirm_mfa(profile.id, &request.code, ip.as_deref(), user_agent.as_deref())
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/mfa/disable",
    request_body = MfaDisableRequest,
    responses(
        (status = 204, description = "MFA disabled"),
        (status = 403, description = "Password incorrect", body = ErrorResponse)
    ),
    tag = "mfa"
)]
pub async fn mfa_disable(
    headers: HeaderMap,
    service: Extension<Arc<AuthService>>,
    Json(request): Json<MfaDisableRequest>,
) -> Response {
    let (profile, _token) = match require_session(&headers, &service).await {
        Ok(authenticated) => authenticated,
        Err(response) => return response,
    };
    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    match service
        .disable_mfa(
            profile.id,
            &request.password,
            ip.as_deref(),
            user_agent.as_deref(),
        )
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "User created", body = UserProfile),
        (status = 400, description = "Validation failed", body = ErrorResponse),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse)
    ),
    tag = "users"
)]
pub async fn create_user(
    headers: HeaderMap,
    service: Extension<Arc<AuthService>>,
    Json(request): Json<CreateUserRequest>,
) -> Response {
    let (profile, _token) = match require_session(&headers, &service).await {
        Ok(authenticated) => authenticated,
        Err(response) => return response,
    };
    if !service.check_permission(&profile, Role::Admin) {
        return (
            StatusCode::FORBIDDEN,
            error_body("admin role required", None),
        )
            .into_response();
    }
    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    match service
        .register(
            &request.username,
            &request.password,
            request.email.as_deref(),
            request.role,
            ip.as_deref(),
            user_agent.as_deref(),
        )
        .await
    {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    get,
    path = "/v1/users",
    responses(
        (status = 200, description = "All user profiles", body = [UserProfile]),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse)
    ),
    tag = "users"
)]
pub async fn list_users(headers: HeaderMap, service: Extension<Arc<AuthService>>) -> Response {
    let (profile, _token) = match require_session(&headers, &service).await {
        Ok(authenticated) => authenticated,
        Err(response) => return response,
    };
    if !service.check_permission(&profile, Role::Admin) {
        return (
            StatusCode::FORBIDDEN,
            error_body("admin role required", None),
        )
            .into_response();
    }
    match service.list_users().await {
        Ok(users) => (StatusCode::OK, Json(users)).into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    put,
    path = "/v1/users/{user_id}",
    params(("user_id" = Uuid, Path, description = "User to update")),
    request_body = UpdateUserRequest,
    responses(
        (status = 200, description = "User updated", body = UserProfile),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 404, description = "No such user", body = ErrorResponse)
    ),
    tag = "users"
)]
pub async fn update_user(
    headers: HeaderMap,
    service: Extension<Arc<AuthService>>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<UpdateUserRequest>,
) -> Response {
    let (profile, _token) = match require_session(&headers, &service).await {
        Ok(authenticated) => authenticated,
        Err(response) => return response,
    };
    if !service.check_permission(&profile, Role::Admin) {
        return (
            StatusCode::FORBIDDEN,
            error_body("admin role required", None),
        )
            .into_response();
    }
    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    match service
        .update_user(
            user_id,
            request.role,
            request.is_active,
            ip.as_deref(),
            user_agent.as_deref(),
        )
        .await
    {
        Ok(updated) => (StatusCode::OK, Json(updated)).into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    delete,
    path = "/v1/users/{user_id}",
    params(("user_id" = Uuid, Path, description = "User to delete")),
    responses(
        (status = 204, description = "User and their sessions deleted"),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 404, description = "No such user", body = ErrorResponse)
    ),
    tag = "users"
)]
pub async fn delete_user(
    headers: HeaderMap,
    service: Extension<Arc<AuthService>>,
    Path(user_id): Path<Uuid>,
) -> Response {
    let (profile, _token) = match require_session(&headers, &service).await {
        Ok(authenticated) => authenticated,
        Err(response) => return response,
    };
    if !service.check_permission(&profile, Role::Admin) {
        return (
            StatusCode::FORBIDDEN,
            error_body("admin role required", None),
        )
            .into_response();
    }
    let ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    match service
        .delete_user(user_id, ip.as_deref(), user_agent.as_deref())
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extract_bearer_token_accepts_both_cases() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(extract_bearer_token(&headers), Some("abc123".to_string()));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer abc123"));
        assert_eq!(extract_bearer_token(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn extract_bearer_token_rejects_empty_or_missing() {
        let headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn extract_client_ip_prefers_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 5.6.7.8"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("1.2.3.4".to_string()));
    }

    #[test]
    fn extract_client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("9.9.9.9".to_string()));
    }

    #[test]
    fn rate_limited_response_sets_retry_after() {
        let response = error_response(&AuthError::RateLimited {
            retry_after_seconds: 42,
        });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("retry-after"),
            Some(&HeaderValue::from_static("42"))
        );
    }

    #[test]
    fn credential_failures_map_to_unauthorized() {
        assert_eq!(
            error_response(&AuthError::InvalidCredentials).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            error_response(&AuthError::InvalidSession).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            error_response(&AuthError::AccountDisabled).status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn internal_errors_never_leak() {
        let response = error_response(&AuthError::Internal(anyhow::anyhow!("secret detail")));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
