//! File history service: tracks versions of files the agent touches within
//! a session, plus the `history` topic.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::pubsub::Broker;
use crate::pubsub::Event;
use crate::pubsub::EventKind;
use crate::util::now_ms;

/// Version tag of the first recorded copy of a file.
pub const INITIAL_VERSION: i64 = 0;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FileRecord {
    pub id: String,
    pub session_id: String,
    pub path: String,
    pub content: String,
    pub version: i64,
    pub created_at: i64,
}

#[derive(Default)]
struct HistoryStore {
    by_id: HashMap<String, FileRecord>,
    /// (session, path) -> record ids in version order.
    versions: HashMap<(String, String), Vec<String>>,
}

pub struct HistoryService {
    store: Mutex<HistoryStore>,
    broker: Broker<FileRecord>,
}

impl Default for HistoryService {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryService {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(HistoryStore::default()),
            broker: Broker::new("history"),
        }
    }

    /// Record the initial copy of a file for the session.
    pub async fn create(&self, session_id: &str, path: &str, content: &str) -> FileRecord {
        self.insert(session_id, path, content, INITIAL_VERSION).await
    }

    /// Record a new version, numbered after the latest existing one.
    pub async fn create_version(&self, session_id: &str, path: &str, content: &str) -> FileRecord {
        let next = {
            let store = self.store.lock().await;
            store
                .versions
                .get(&(session_id.to_string(), path.to_string()))
                .and_then(|ids| ids.last())
                .and_then(|id| store.by_id.get(id))
                .map(|record| record.version + 1)
                .unwrap_or(INITIAL_VERSION)
        };
        self.insert(session_id, path, content, next).await
    }

    async fn insert(&self, session_id: &str, path: &str, content: &str, version: i64) -> FileRecord {
        let record = FileRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            path: path.to_string(),
            content: content.to_string(),
            version,
            created_at: now_ms(),
        };
        let mut store = self.store.lock().await;
        store
            .versions
            .entry((record.session_id.clone(), record.path.clone()))
            .or_default()
            .push(record.id.clone());
        store.by_id.insert(record.id.clone(), record.clone());
        self.broker.publish(EventKind::Created, record.clone()).await;
        record
    }

    pub async fn get(&self, id: &str) -> Result<FileRecord> {
        self.store
            .lock()
            .await
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| crate::error::TetherErr::Other(anyhow::anyhow!("file not found: {id}")))
    }

    /// Latest recorded version of `path` within the session.
    pub async fn get_by_path_and_session(&self, path: &str, session_id: &str) -> Option<FileRecord> {
        let store = self.store.lock().await;
        store
            .versions
            .get(&(session_id.to_string(), path.to_string()))
            .and_then(|ids| ids.last())
            .and_then(|id| store.by_id.get(id))
            .cloned()
    }

    pub async fn list_by_session(&self, session_id: &str) -> Vec<FileRecord> {
        let mut records: Vec<FileRecord> = self
            .store
            .lock()
            .await
            .by_id
            .values()
            .filter(|record| record.session_id == session_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.version.cmp(&b.version)));
        records
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        let Some(record) = store.by_id.remove(id) else {
            return Err(crate::error::TetherErr::Other(anyhow::anyhow!(
                "file not found: {id}"
            )));
        };
        if let Some(ids) = store
            .versions
            .get_mut(&(record.session_id.clone(), record.path.clone()))
        {
            ids.retain(|existing| existing != id);
        }
        self.broker.publish(EventKind::Deleted, record).await;
        Ok(())
    }

    pub fn subscribe(&self, cancel: &CancellationToken) -> mpsc::Receiver<Event<FileRecord>> {
        self.broker.subscribe(cancel)
    }

    pub fn shutdown(&self) {
        self.broker.shutdown();
    }
}
