//! Session service: CRUD over sessions plus the `sessions` topic.
//!
//! Mutations commit to the store before the corresponding event is
//! published, and a store-wide lock is held across commit+publish so the
//! order observed by any subscriber equals commit order.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::error::TetherErr;
use crate::pubsub::Broker;
use crate::pubsub::Event;
use crate::pubsub::EventKind;
use crate::util::now_ms;
use tether_protocol::Session;
use tether_protocol::TokenUsage;

pub struct SessionService {
    store: Mutex<HashMap<String, Session>>,
    broker: Broker<Session>,
}

impl Default for SessionService {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionService {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            broker: Broker::new("sessions"),
        }
    }

    pub async fn create(&self, title: &str) -> Session {
        let now = now_ms();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
            created_at: now,
            updated_at: now,
        };
        let mut store = self.store.lock().await;
        store.insert(session.id.clone(), session.clone());
        self.broker
            .publish(EventKind::Created, session.clone())
            .await;
        session
    }

    pub async fn get(&self, id: &str) -> Result<Session> {
        self.store
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TetherErr::SessionNotFound(id.to_string()))
    }

    /// Sessions ordered by creation time, newest first.
    pub async fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.store.lock().await.values().cloned().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Replace the stored session. Token counters are monotonic: a value
    /// lower than the stored one is ignored in favor of the stored value.
    pub async fn update(&self, mut session: Session) -> Result<Session> {
        let mut store = self.store.lock().await;
        let existing = store
            .get(&session.id)
            .ok_or_else(|| TetherErr::SessionNotFound(session.id.clone()))?;
        session.prompt_tokens = session.prompt_tokens.max(existing.prompt_tokens);
        session.completion_tokens = session.completion_tokens.max(existing.completion_tokens);
        session.updated_at = now_ms();
        store.insert(session.id.clone(), session.clone());
        self.broker
            .publish(EventKind::Updated, session.clone())
            .await;
        Ok(session)
    }

    /// Accumulate one turn's usage onto the session counters.
    pub async fn add_usage(&self, id: &str, usage: TokenUsage) -> Result<Session> {
        let mut store = self.store.lock().await;
        let session = store
            .get_mut(id)
            .ok_or_else(|| TetherErr::SessionNotFound(id.to_string()))?;
        session.prompt_tokens = session.prompt_tokens.saturating_add(usage.prompt_tokens);
        session.completion_tokens = session
            .completion_tokens
            .saturating_add(usage.completion_tokens);
        session.updated_at = now_ms();
        let session = session.clone();
        self.broker
            .publish(EventKind::Updated, session.clone())
            .await;
        Ok(session)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        let session = store
            .remove(id)
            .ok_or_else(|| TetherErr::SessionNotFound(id.to_string()))?;
        self.broker.publish(EventKind::Deleted, session).await;
        Ok(())
    }

    pub fn subscribe(&self, cancel: &CancellationToken) -> mpsc::Receiver<Event<Session>> {
        self.broker.subscribe(cancel)
    }

    pub fn shutdown(&self) {
        self.broker.shutdown();
    }
}
