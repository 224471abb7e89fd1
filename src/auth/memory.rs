//! In-memory backend implementing every storage trait.
//!
//! Used by the service tests and handy for single-process deployments where
//! durability does not matter. State is lost on restart.

use crate::auth::audit::{AuditEvent, AuditSink};
use crate::auth::roles::Role;
use crate::auth::session::{Session, SessionLookup, SessionStore};
use crate::auth::store::{CredentialStore, StoreError};
use crate::auth::user::{NewUser, User};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<Uuid, User>>,
    sessions: Mutex<Vec<Session>>,
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded audit events, oldest first.
    #[must_use]
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        lock(&self.events).clone()
    }

    /// Direct user lookup for assertions on stored state.
    #[must_use]
    pub fn user_snapshot(&self, id: Uuid) -> Option<User> {
        lock(&self.users).get(&id).cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError> {
        let mut users = lock(&self.users);
        if users
            .values()
            .any(|user| user.username == new_user.username)
        {
            return Err(StoreError::Duplicate { entity: "username" });
        }
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            username: new_user.username,
            password_hash: new_user.password_hash,
            email: new_user.email,
            role: new_user.role,
            is_active: true,
            mfa_enabled: false,
            mfa_secret: None,
            failed_login_attempts: 0,
            last_failed_login_at: None,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(lock(&self.users).get(&id).cloned())
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(lock(&self.users)
            .values()
            .find(|user| user.username == username)
            .cloned())
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> Result<(), StoreError> {
        if let Some(user) = lock(&self.users).get_mut(&id) {
            user.password_hash = password_hash.to_string();
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_role(&self, id: Uuid, role: Role) -> Result<(), StoreError> {
        if let Some(user) = lock(&self.users).get_mut(&id) {
            user.role = role;
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_active(&self, id: Uuid, is_active: bool) -> Result<bool, StoreError> {
        let mut users = lock(&self.users);
        match users.get_mut(&id) {
            Some(user) => {
                user.is_active = is_active;
                user.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_failed_login(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some(user) = lock(&self.users).get_mut(&id) {
            user.failed_login_attempts += 1;
            user.last_failed_login_at = Some(Utc::now());
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_successful_login(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some(user) = lock(&self.users).get_mut(&id) {
            user.failed_login_attempts = 0;
            user.last_login_at = Some(Utc::now());
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_pending_mfa_secret(&self, id: Uuid, secret: &str) -> Result<(), StoreError> {
        if let Some(user) = lock(&self.users).get_mut(&id) {
            user.mfa_secret = Some(secret.to_string());
            user.mfa_enabled = false;
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn enable_mfa(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some(user) = lock(&self.users).get_mut(&id) {
            if user.mfa_secret.is_some() {
                user.mfa_enabled = true;
                user.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn clear_mfa(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some(user) = lock(&self.users).get_mut(&id) {
            user.mfa_enabled = false;
            user.mfa_secret = None;
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_user(&self, id: Uuid) -> Result<bool, StoreError> {
        let removed = lock(&self.users).remove(&id).is_some();
        if removed {
            lock(&self.sessions).retain(|session| session.user_id != id);
        }
        Ok(removed)
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let mut users: Vec<User> = lock(&self.users).values().cloned().collect();
        users.sort_by_key(|user| user.created_at);
        Ok(users)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(
        &self,
        user_id: Uuid,
        token_hash: Vec<u8>,
        ip: Option<String>,
        user_agent: Option<String>,
        ttl: Duration,
    ) -> Result<Session, StoreError> {
        let mut sessions = lock(&self.sessions);
        if sessions.iter().any(|session| session.token_hash == token_hash) {
            return Err(StoreError::Duplicate {
                entity: "session token",
            });
        }
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl)
            .map_err(|err| StoreError::Backend(anyhow::Error::new(err)))?;
        let session = Session {
            id: Uuid::new_v4(),
            user_id,
            token_hash,
            ip,
            user_agent,
            expires_at: now + ttl,
            created_at: now,
            last_activity_at: now,
        };
        sessions.push(session.clone());
        Ok(session)
    }

    async fn validate(&self, token_hash: &[u8]) -> Result<SessionLookup, StoreError> {
        let sessions = lock(&self.sessions);
        match sessions
            .iter()
            .find(|session| session.token_hash == token_hash)
        {
            None => Ok(SessionLookup::NotFound),
            Some(session) if session.expires_at <= Utc::now() => Ok(SessionLookup::Expired),
            Some(session) => Ok(SessionLookup::Active(session.clone())),
        }
    }

    async fn touch(&self, session_id: Uuid) -> Result<(), StoreError> {
        if let Some(session) = lock(&self.sessions)
            .iter_mut()
            .find(|session| session.id == session_id)
        {
            session.last_activity_at = Utc::now();
        }
        Ok(())
    }

    async fn revoke(&self, token_hash: &[u8]) -> Result<Option<Session>, StoreError> {
        let mut sessions = lock(&self.sessions);
        let index = sessions
            .iter()
            .position(|session| session.token_hash == token_hash);
        Ok(index.map(|index| sessions.remove(index)))
    }

    async fn revoke_by_id(&self, session_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|session| !(session.id == session_id && session.user_id == user_id));
        Ok(sessions.len() < before)
    }

    async fn revoke_all(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|session| session.user_id != user_id);
        Ok((before - sessions.len()) as u64)
    }

    async fn active_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, StoreError> {
        let now = Utc::now();
        Ok(lock(&self.sessions)
            .iter()
            .filter(|session| session.user_id == user_id && session.expires_at > now)
            .cloned()
            .collect())
    }

    async fn sweep_expired(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|session| session.expires_at > now);
        Ok((before - sessions.len()) as u64)
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn record(&self, event: AuditEvent) {
        lock(&self.events).push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::hash_token;

    fn new_user(username: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            password_hash: "$argon2id$stub".to_string(),
            email: None,
            role: Role::User,
        }
    }

    #[tokio::test]
    async fn rejects_duplicate_usernames() {
        let store = MemoryStore::new();
        store.create_user(new_user("alice")).await.unwrap();
        let err = store.create_user(new_user("alice")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { entity: "username" }));
    }

    #[tokio::test]
    async fn rejects_duplicate_token_hashes() {
        let store = MemoryStore::new();
        let user = store.create_user(new_user("alice")).await.unwrap();
        let hash = hash_token("token");
        store
            .create(user.id, hash.clone(), None, None, Duration::from_secs(60))
            .await
            .unwrap();
        let err = store
            .create(user.id, hash, None, None, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let store = MemoryStore::new();
        let user = store.create_user(new_user("alice")).await.unwrap();
        let hash = hash_token("token");
        store
            .create(user.id, hash.clone(), None, None, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(store.revoke(&hash).await.unwrap().is_some());
        assert!(store.revoke(&hash).await.unwrap().is_none());
        assert_eq!(store.validate(&hash).await.unwrap(), SessionLookup::NotFound);
    }

    #[tokio::test]
    async fn lapsed_session_is_expired_until_swept() {
        let store = MemoryStore::new();
        let user = store.create_user(new_user("alice")).await.unwrap();
        let hash = hash_token("stale");
        store
            .create(user.id, hash.clone(), None, None, Duration::from_secs(0))
            .await
            .unwrap();

        // Not yet swept, but already past expiry.
        assert_eq!(store.validate(&hash).await.unwrap(), SessionLookup::Expired);

        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert_eq!(store.validate(&hash).await.unwrap(), SessionLookup::NotFound);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_sessions() {
        let store = MemoryStore::new();
        let user = store.create_user(new_user("alice")).await.unwrap();
        store
            .create(
                user.id,
                hash_token("live"),
                None,
                None,
                Duration::from_secs(3600),
            )
            .await
            .unwrap();
        store
            .create(
                user.id,
                hash_token("dead"),
                None,
                None,
                Duration::from_secs(0),
            )
            .await
            .unwrap();

        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert_eq!(store.active_sessions(user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_a_user_drops_their_sessions() {
        let store = MemoryStore::new();
        let user = store.create_user(new_user("alice")).await.unwrap();
        let hash = hash_token("token");
        store
            .create(user.id, hash.clone(), None, None, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(store.delete_user(user.id).await.unwrap());
        assert_eq!(store.validate(&hash).await.unwrap(), SessionLookup::NotFound);
    }
}
