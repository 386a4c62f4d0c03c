//! Mediates every side-effecting tool call on explicit user consent.
//!
//! A tool calls [`PermissionService::request`] and blocks until the request
//! is resolved. Short-circuits, in order: the global allow-list (tool name
//! or `tool:action` key), the global skip flag, sessions opted into
//! auto-approval (non-interactive runs), and persistent session grants. Only
//! when none apply is a [`PermissionRequest`] published for the UI, with a
//! one-shot response channel parked under the request id.

use std::path::Path;
use std::path::PathBuf;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::csync;
use crate::pubsub::Broker;
use crate::pubsub::Event;
use crate::pubsub::EventKind;
use tether_protocol::CreatePermissionRequest;
use tether_protocol::PermissionNotification;
use tether_protocol::PermissionRequest;

/// Sentinel returned by a tool whose request was denied.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("permission denied")]
pub struct ErrorPermissionDenied;

pub struct PermissionService {
    working_dir: PathBuf,
    broker: Broker<PermissionRequest>,
    notifications: Broker<PermissionNotification>,
    pending: csync::Map<String, PendingRequest>,
    session_grants: csync::Map<String, ()>,
    auto_approve_sessions: csync::Map<String, ()>,
    allowed_tools: RwLock<Vec<String>>,
    skip: AtomicBool,
}

struct PendingRequest {
    request: PermissionRequest,
    respond: oneshot::Sender<bool>,
}

impl PermissionService {
    pub fn new(working_dir: &Path, skip_requests: bool, allowed_tools: Vec<String>) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
            broker: Broker::new("permissions"),
            notifications: Broker::new("permissions-notifications"),
            pending: csync::Map::new(),
            session_grants: csync::Map::new(),
            auto_approve_sessions: csync::Map::new(),
            allowed_tools: RwLock::new(allowed_tools),
            skip: AtomicBool::new(skip_requests),
        }
    }

    /// Ask for authorization; blocks until resolved. Returns `true` when the
    /// call may proceed. The mediator itself never fails a request.
    pub async fn request(&self, req: CreatePermissionRequest) -> bool {
        if self.tool_allowed(&req.tool_name, &req.action)
            || self.skip.load(Ordering::Acquire)
            || self.auto_approve_sessions.contains_key(&req.session_id)
            || self
                .session_grants
                .contains_key(&grant_key(&req.session_id, &req.tool_name, &req.action))
        {
            return true;
        }

        let request = PermissionRequest {
            id: Uuid::new_v4().to_string(),
            session_id: req.session_id,
            tool_call_id: req.tool_call_id,
            tool_name: req.tool_name,
            action: req.action,
            description: req.description,
            params: req.params,
            path: req.path,
        };

        // Park the responder before publishing so a fast resolver cannot
        // race the registration.
        let (tx, rx) = oneshot::channel();
        self.pending.set(
            request.id.clone(),
            PendingRequest {
                request: request.clone(),
                respond: tx,
            },
        );
        self.broker.publish(EventKind::Created, request).await;

        rx.await.unwrap_or(false)
    }

    pub async fn grant(&self, request: &PermissionRequest) {
        self.resolve(&request.id, true).await;
    }

    /// Grant and remember the (session, tool, action) triple for the rest of
    /// the session.
    pub async fn grant_persistent(&self, request: &PermissionRequest) {
        self.session_grants.set(
            grant_key(&request.session_id, &request.tool_name, &request.action),
            (),
        );
        self.resolve(&request.id, true).await;
    }

    pub async fn deny(&self, request: &PermissionRequest) {
        self.resolve(&request.id, false).await;
    }

    /// Idempotent with respect to unknown request ids.
    async fn resolve(&self, request_id: &str, granted: bool) {
        let Some(pending) = self.pending.take(&request_id.to_string()) else {
            return;
        };
        let _ = pending.respond.send(granted);
        self.notifications
            .publish(
                EventKind::Created,
                PermissionNotification {
                    tool_call_id: pending.request.tool_call_id,
                    granted,
                },
            )
            .await;
    }

    /// Toggle the global skip override. Turning it on auto-grants every
    /// currently pending request.
    pub async fn set_skip_requests(&self, skip: bool) {
        self.skip.store(skip, Ordering::Release);
        if !skip {
            return;
        }
        for (_, pending) in self.pending.drain() {
            let _ = pending.respond.send(true);
            self.notifications
                .publish(
                    EventKind::Created,
                    PermissionNotification {
                        tool_call_id: pending.request.tool_call_id,
                        granted: true,
                    },
                )
                .await;
        }
    }

    pub fn skip_requests(&self) -> bool {
        self.skip.load(Ordering::Acquire)
    }

    /// Atomic replacement of the tool-wide allow-list.
    pub fn set_allowed_tools(&self, tools: Vec<String>) {
        *self
            .allowed_tools
            .write()
            .unwrap_or_else(PoisonError::into_inner) = tools;
    }

    /// Opt the session into unconditional approval (non-interactive runs).
    pub fn auto_approve_session(&self, session_id: &str) {
        self.auto_approve_sessions.set(session_id.to_string(), ());
    }

    /// The requests topic.
    pub fn subscribe(&self, cancel: &CancellationToken) -> mpsc::Receiver<Event<PermissionRequest>> {
        self.broker.subscribe(cancel)
    }

    /// Human-readable permission activity, distinct from the request topic.
    pub fn subscribe_notifications(
        &self,
        cancel: &CancellationToken,
    ) -> mpsc::Receiver<Event<PermissionNotification>> {
        self.notifications.subscribe(cancel)
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn shutdown(&self) {
        self.broker.shutdown();
        self.notifications.shutdown();
    }

    fn tool_allowed(&self, tool_name: &str, action: &str) -> bool {
        let allowed = self
            .allowed_tools
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let composite = format!("{tool_name}:{action}");
        allowed.iter().any(|t| t == tool_name || *t == composite)
    }
}

fn grant_key(session_id: &str, tool_name: &str, action: &str) -> String {
    format!("{session_id}:{tool_name}:{action}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_request(session: &str, tool: &str) -> CreatePermissionRequest {
        CreatePermissionRequest {
            session_id: session.to_string(),
            tool_call_id: "call-1".to_string(),
            tool_name: tool.to_string(),
            action: "execute".to_string(),
            description: format!("execute {tool}"),
            params: "{}".to_string(),
            path: "/tmp".to_string(),
        }
    }

    fn service() -> PermissionService {
        PermissionService::new(Path::new("/tmp"), false, Vec::new())
    }

    #[tokio::test]
    async fn allowed_tool_returns_true_without_emitting() {
        let svc = PermissionService::new(Path::new("/tmp"), false, vec!["shell".to_string()]);
        let cancel = CancellationToken::new();
        let mut requests = svc.subscribe(&cancel);

        assert!(svc.request(create_request("s1", "shell")).await);
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn composite_action_key_matches() {
        let svc =
            PermissionService::new(Path::new("/tmp"), false, vec!["shell:execute".to_string()]);
        assert!(svc.request(create_request("s1", "shell")).await);
    }

    #[tokio::test]
    async fn grant_and_deny_resolve_pending_requests() {
        let svc = std::sync::Arc::new(service());
        let cancel = CancellationToken::new();
        let mut requests = svc.subscribe(&cancel);

        let svc2 = svc.clone();
        let pending = tokio::spawn(async move {
            svc2.request(create_request("s1", "shell")).await
        });
        let event = requests.recv().await.expect("request event");
        svc.deny(&event.payload).await;
        assert!(!pending.await.expect("join"));

        let svc2 = svc.clone();
        let pending = tokio::spawn(async move {
            svc2.request(create_request("s1", "shell")).await
        });
        let event = requests.recv().await.expect("request event");
        svc.grant(&event.payload).await;
        assert!(pending.await.expect("join"));
    }

    #[tokio::test]
    async fn persistent_grant_short_circuits_the_next_request() {
        let svc = std::sync::Arc::new(service());
        let cancel = CancellationToken::new();
        let mut requests = svc.subscribe(&cancel);

        let svc2 = svc.clone();
        let pending = tokio::spawn(async move {
            svc2.request(create_request("s1", "shell")).await
        });
        let event = requests.recv().await.expect("request event");
        svc.grant_persistent(&event.payload).await;
        assert!(pending.await.expect("join"));

        // Same (session, tool, action): no new event, immediate true.
        assert!(svc.request(create_request("s1", "shell")).await);
        assert!(requests.try_recv().is_err());

        // A different session still prompts.
        let svc2 = svc.clone();
        let pending = tokio::spawn(async move {
            svc2.request(create_request("s2", "shell")).await
        });
        let event = requests.recv().await.expect("request event");
        svc.deny(&event.payload).await;
        assert!(!pending.await.expect("join"));
    }

    #[tokio::test]
    async fn enabling_skip_auto_grants_all_pending_requests() {
        let svc = std::sync::Arc::new(service());
        let cancel = CancellationToken::new();
        let mut requests = svc.subscribe(&cancel);

        let svc2 = svc.clone();
        let p1 = tokio::spawn(async move { svc2.request(create_request("s1", "shell")).await });
        let svc2 = svc.clone();
        let p2 = tokio::spawn(async move { svc2.request(create_request("s2", "view")).await });
        let _ = requests.recv().await.expect("first event");
        let _ = requests.recv().await.expect("second event");

        svc.set_skip_requests(true).await;
        assert!(p1.await.expect("join"));
        assert!(p2.await.expect("join"));

        // And the short-circuit holds for later callers.
        assert!(svc.request(create_request("s3", "shell")).await);
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn auto_approved_session_skips_prompting() {
        let svc = service();
        svc.auto_approve_session("s1");
        assert!(svc.request(create_request("s1", "shell")).await);
    }

    #[tokio::test]
    async fn resolving_unknown_request_is_a_no_op() {
        let svc = service();
        let ghost = PermissionRequest {
            id: "nope".to_string(),
            session_id: "s1".to_string(),
            tool_call_id: "c1".to_string(),
            tool_name: "shell".to_string(),
            action: "execute".to_string(),
            description: String::new(),
            params: String::new(),
            path: String::new(),
        };
        svc.grant(&ghost).await;
        svc.deny(&ghost).await;
    }
}
