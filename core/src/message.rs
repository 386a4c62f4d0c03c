//! Message service: per-session ordered history plus the `messages` topic.

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
use tether_protocol::ContentPart;
use tether_protocol::Message;
use tether_protocol::Role;

#[derive(Default)]
struct MessageStore {
    by_id: HashMap<String, Message>,
    /// Append order per session; list() returns this order.
    by_session: HashMap<String, Vec<String>>,
}

pub struct MessageService {
    store: Mutex<MessageStore>,
    broker: Broker<Message>,
}

impl Default for MessageService {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageService {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(MessageStore::default()),
            broker: Broker::new("messages"),
        }
    }

    pub async fn create(
        &self,
        session_id: &str,
        role: Role,
        parts: Vec<ContentPart>,
    ) -> Message {
        let now = now_ms();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            parts,
            created_at: now,
            updated_at: now,
        };
        let mut store = self.store.lock().await;
        store
            .by_session
            .entry(message.session_id.clone())
            .or_default()
            .push(message.id.clone());
        store.by_id.insert(message.id.clone(), message.clone());
        self.broker
            .publish(EventKind::Created, message.clone())
            .await;
        message
    }

    pub async fn get(&self, id: &str) -> Result<Message> {
        self.store
            .lock()
            .await
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| TetherErr::Other(anyhow::anyhow!("message not found: {id}")))
    }

    /// Messages of one session in append order.
    pub async fn list(&self, session_id: &str) -> Vec<Message> {
        let store = self.store.lock().await;
        store
            .by_session
            .get(session_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| store.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replace a stored message in place (streaming appends re-use this).
    pub async fn update(&self, mut message: Message) -> Result<Message> {
        let mut store = self.store.lock().await;
        if !store.by_id.contains_key(&message.id) {
            return Err(TetherErr::Other(anyhow::anyhow!(
                "message not found: {}",
                message.id
            )));
        }
        message.updated_at = now_ms();
        store.by_id.insert(message.id.clone(), message.clone());
        self.broker
            .publish(EventKind::Updated, message.clone())
            .await;
        Ok(message)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        let Some(message) = store.by_id.remove(id) else {
            return Err(TetherErr::Other(anyhow::anyhow!("message not found: {id}")));
        };
        if let Some(ids) = store.by_session.get_mut(&message.session_id) {
            ids.retain(|existing| existing != id);
        }
        self.broker.publish(EventKind::Deleted, message).await;
        Ok(())
    }

    pub fn subscribe(&self, cancel: &CancellationToken) -> mpsc::Receiver<Event<Message>> {
        self.broker.subscribe(cancel)
    }

    pub fn shutdown(&self) {
        self.broker.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn list_preserves_append_order() {
        let svc = MessageService::new();
        let m1 = svc.create("s1", Role::User, Vec::new()).await;
        let m2 = svc.create("s1", Role::Assistant, Vec::new()).await;
        svc.create("s2", Role::User, Vec::new()).await;

        let listed = svc.list("s1").await;
        assert_eq!(
            listed.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec![m1.id.as_str(), m2.id.as_str()]
        );
    }

    #[tokio::test]
    async fn subscribers_observe_commit_order() {
        let svc = MessageService::new();
        let cancel = CancellationToken::new();
        let mut events = svc.subscribe(&cancel);

        let mut message = svc.create("s1", Role::Assistant, Vec::new()).await;
        message.append_text("one");
        svc.update(message.clone()).await.expect("update");
        message.append_text(" two");
        svc.update(message).await.expect("update");

        assert_eq!(events.recv().await.expect("created").kind, EventKind::Created);
        let first = events.recv().await.expect("first update");
        let second = events.recv().await.expect("second update");
        assert_eq!(first.payload.content(), "one");
        assert_eq!(second.payload.content(), "one two");
    }

    #[tokio::test]
    async fn tool_results_follow_their_requests() {
        let svc = MessageService::new();
        let mut message = svc.create("s1", Role::Assistant, Vec::new()).await;
        message.parts.push(ContentPart::ToolCall {
            id: "c1".into(),
            name: "shell".into(),
            input: "{}".into(),
        });
        svc.update(message.clone()).await.expect("update");
        message.parts.push(ContentPart::ToolResult {
            tool_call_id: "c1".into(),
            name: "shell".into(),
            content: "ok".into(),
            is_error: false,
        });
        let stored = svc.update(message).await.expect("update");

        let call_idx = stored
            .parts
            .iter()
            .position(|p| matches!(p, ContentPart::ToolCall { .. }))
            .expect("call part");
        let result_idx = stored
            .parts
            .iter()
            .position(|p| matches!(p, ContentPart::ToolResult { .. }))
            .expect("result part");
        assert!(call_idx < result_idx);
    }
}
