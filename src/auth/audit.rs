//! Append-only security audit trail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{Instrument, error};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    /// Absent for events that never resolved to a user, such as login
    /// attempts against unknown usernames.
    pub user_id: Option<Uuid>,
    /// Kept alongside the id so the trail stays readable after user deletion.
    pub username: Option<String>,
    pub action: String,
    pub resource: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub status: String,
    pub details: Option<String>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(action: &str, status: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            user_id: None,
            username: None,
            action: action.to_string(),
            resource: None,
            ip: None,
            user_agent: None,
            status: status.to_string(),
            details: None,
        }
    }

    #[must_use]
    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn username(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    #[must_use]
    pub fn resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_string());
        self
    }

    #[must_use]
    pub fn client(mut self, ip: Option<&str>, user_agent: Option<&str>) -> Self {
        self.ip = ip.map(ToString::to_string);
        self.user_agent = user_agent.map(ToString::to_string);
        self
    }

    #[must_use]
    pub fn details(mut self, details: &str) -> Self {
        self.details = Some(details.to_string());
        self
    }
}

/// Fire-and-forget audit recording. Implementations handle their own
/// failures; an unwritable audit row must not fail the authentication flow
/// it describes.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, event: AuditEvent) {
        let query = "INSERT INTO audit_log \
             (timestamp, user_id, username, action, resource, ip, user_agent, status, details) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT"
        );
        if let Err(err) = sqlx::query(query)
            .bind(event.timestamp)
            .bind(event.user_id)
            .bind(&event.username)
            .bind(&event.action)
            .bind(&event.resource)
            .bind(&event.ip)
            .bind(&event.user_agent)
            .bind(&event.status)
            .bind(&event.details)
            .execute(&self.pool)
            .instrument(span)
            .await
        {
            error!("Failed to write audit event {}: {err}", event.action);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_optional_fields() {
        let user_id = Uuid::new_v4();
        let event = AuditEvent::new("login_failed", "invalid_password")
            .user(user_id)
            .username("bob")
            .client(Some("10.0.0.1"), Some("curl/8"))
            .details("wrong password");

        assert_eq!(event.action, "login_failed");
        assert_eq!(event.status, "invalid_password");
        assert_eq!(event.user_id, Some(user_id));
        assert_eq!(event.username.as_deref(), Some("bob"));
        assert_eq!(event.ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(event.user_agent.as_deref(), Some("curl/8"));
        assert_eq!(event.details.as_deref(), Some("wrong password"));
        assert_eq!(event.resource, None);
    }
}
