use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session backend unavailable: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for SessionError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Traveler,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Traveler => "traveler",
            Self::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "traveler" => Some(Self::Traveler),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: Uuid,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn issue(user_id: Uuid, role: Role, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            token: Uuid::new_v4().simple().to_string(),
            user_id,
            role,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Session lifecycle: `create` on login, `load` on every authenticated
/// request, `refresh` to slide the expiry, `clear` on logout. Injected
/// into services as `Arc<dyn SessionStore>`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<(), SessionError>;
    /// Expired sessions load as `None` and are dropped from the backend.
    async fn load(&self, token: &str) -> Result<Option<Session>, SessionError>;
    async fn refresh(&self, token: &str, ttl: Duration) -> Result<Option<Session>, SessionError>;
    async fn clear(&self, token: &str) -> Result<(), SessionError>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: Session) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.token.clone(), session);
        Ok(())
    }

    async fn load(&self, token: &str) -> Result<Option<Session>, SessionError> {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(token) {
                Some(session) if !session.is_expired() => return Ok(Some(session.clone())),
                None => return Ok(None),
                Some(_) => {}
            }
        }

        let mut sessions = self.sessions.write().await;
        sessions.remove(token);
        Ok(None)
    }

    async fn refresh(&self, token: &str, ttl: Duration) -> Result<Option<Session>, SessionError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(token) {
            Some(session) if !session.is_expired() => {
                session.expires_at = Utc::now() + ttl;
                Ok(Some(session.clone()))
            }
            Some(_) => {
                sessions.remove(token);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn clear(&self, token: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(token);
        Ok(())
    }
}

const REDIS_KEY_PREFIX: &str = "tripline:session:";

/// Redis-backed store for multi-instance deployments; expiry is delegated
/// to key TTLs so stale sessions never need sweeping.
pub struct RedisSessionStore {
    client: redis::Client,
}

impl RedisSessionStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    fn key(token: &str) -> String {
        format!("{REDIS_KEY_PREFIX}{token}")
    }

    fn ttl_seconds(session: &Session) -> u64 {
        (session.expires_at - Utc::now()).num_seconds().max(1) as u64
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create(&self, session: Session) -> Result<(), SessionError> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(&session)?;
        let _: () = connection
            .set_ex(
                Self::key(&session.token),
                payload,
                Self::ttl_seconds(&session),
            )
            .await?;
        Ok(())
    }

    async fn load(&self, token: &str) -> Result<Option<Session>, SessionError> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let payload: Option<String> = connection.get(Self::key(token)).await?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        let session: Session = serde_json::from_str(&payload)?;
        if session.is_expired() {
            let _: () = connection.del(Self::key(token)).await?;
            return Ok(None);
        }

        Ok(Some(session))
    }

    async fn refresh(&self, token: &str, ttl: Duration) -> Result<Option<Session>, SessionError> {
        let Some(mut session) = self.load(token).await? else {
            return Ok(None);
        };

        session.expires_at = Utc::now() + ttl;
        self.create(session.clone()).await?;
        Ok(Some(session))
    }

    async fn clear(&self, token: &str) -> Result<(), SessionError> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let _: () = connection.del(Self::key(token)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_load_round_trips() {
        let store = InMemorySessionStore::default();
        let session = Session::issue(Uuid::new_v4(), Role::Traveler, Duration::hours(1));
        let token = session.token.clone();
        store.create(session).await.unwrap();

        let loaded = store.load(&token).await.unwrap().unwrap();
        assert_eq!(loaded.role, Role::Traveler);
        assert!(!loaded.is_expired());
    }

    #[tokio::test]
    async fn expired_sessions_load_as_none_and_are_dropped() {
        let store = InMemorySessionStore::default();
        let mut session = Session::issue(Uuid::new_v4(), Role::Admin, Duration::hours(1));
        session.expires_at = Utc::now() - Duration::seconds(5);
        let token = session.token.clone();
        store.create(session).await.unwrap();

        assert!(store.load(&token).await.unwrap().is_none());
        // Second load hits the removed entry.
        assert!(store.load(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_extends_a_live_session() {
        let store = InMemorySessionStore::default();
        let session = Session::issue(Uuid::new_v4(), Role::Traveler, Duration::seconds(30));
        let token = session.token.clone();
        let old_expiry = session.expires_at;
        store.create(session).await.unwrap();

        let refreshed = store
            .refresh(&token, Duration::hours(2))
            .await
            .unwrap()
            .unwrap();
        assert!(refreshed.expires_at > old_expiry);
    }

    #[tokio::test]
    async fn refresh_does_not_resurrect_expired_sessions() {
        let store = InMemorySessionStore::default();
        let mut session = Session::issue(Uuid::new_v4(), Role::Traveler, Duration::hours(1));
        session.expires_at = Utc::now() - Duration::seconds(1);
        let token = session.token.clone();
        store.create(session).await.unwrap();

        assert!(
            store
                .refresh(&token, Duration::hours(1))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn clear_removes_the_session() {
        let store = InMemorySessionStore::default();
        let session = Session::issue(Uuid::new_v4(), Role::Admin, Duration::hours(1));
        let token = session.token.clone();
        store.create(session).await.unwrap();

        store.clear(&token).await.unwrap();
        assert!(store.load(&token).await.unwrap().is_none());
    }
}
