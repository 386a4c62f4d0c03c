//! LSP client pool: per-language server lifecycle, diagnostic snapshots,
//! and file-watcher fan-out.
//!
//! The pool is passive: it mirrors client state changes onto the `lsp`
//! topic and otherwise only answers snapshot queries. The wire protocol is
//! deliberately out of scope; diagnostics enter through
//! [`LspClient::set_diagnostics`] and are invalidated by the watcher when a
//! file changes underneath them.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::config::LspConfig;
use crate::csync;
use crate::pubsub::Broker;
use crate::pubsub::Event;
use crate::pubsub::EventKind;
use tether_protocol::LspEvent;
use tether_protocol::LspState;

/// Budget for shutting one client down.
pub const LSP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval of the workspace watcher.
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Directory names the watcher never descends into.
const WATCH_IGNORED_DIRS: &[&str] = &[".git", "node_modules", "target", ".tether"];

const WATCH_MAX_DEPTH: usize = 6;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Information,
    Hint,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub message: String,
    pub line: u32,
    pub character: u32,
}

/// One language server process and its diagnostic surface.
pub struct LspClient {
    name: String,
    child: Mutex<Option<tokio::process::Child>>,
    diagnostics: csync::Map<PathBuf, Vec<Diagnostic>>,
    state: std::sync::Mutex<LspState>,
}

impl LspClient {
    /// Spawn the configured server process.
    pub async fn start(name: &str, cfg: &LspConfig) -> std::io::Result<Self> {
        let child = tokio::process::Command::new(&cfg.command)
            .args(&cfg.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Self {
            name: name.to_string(),
            child: Mutex::new(Some(child)),
            diagnostics: csync::Map::new(),
            state: std::sync::Mutex::new(LspState::Ready),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LspState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LspState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Point-in-time diagnostics snapshot keyed by file path.
    pub fn diagnostics(&self) -> HashMap<PathBuf, Vec<Diagnostic>> {
        self.diagnostics.snapshot().into_iter().collect()
    }

    pub fn diagnostics_for(&self, path: &Path) -> Vec<Diagnostic> {
        self.diagnostics.get(&path.to_path_buf()).unwrap_or_default()
    }

    pub fn diagnostic_count(&self) -> usize {
        self.diagnostics
            .snapshot()
            .iter()
            .map(|(_, diags)| diags.len())
            .sum()
    }

    /// Replace the diagnostics for one file.
    pub fn set_diagnostics(&self, path: PathBuf, diagnostics: Vec<Diagnostic>) {
        self.diagnostics.set(path, diagnostics);
    }

    /// Drop stale diagnostics for a file that changed on disk.
    pub fn invalidate(&self, path: &Path) {
        self.diagnostics.delete(&path.to_path_buf());
    }

    /// Terminate the server process within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> std::io::Result<()> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };
        self.set_state(LspState::Stopped);
        child.start_kill()?;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                warn!(name = %self.name, "LSP client did not exit within budget");
                Ok(())
            }
        }
    }
}

pub struct LspPool {
    clients: csync::Map<String, Arc<LspClient>>,
    watcher_cancels: csync::Slice<CancellationToken>,
    watchers: Mutex<JoinSet<()>>,
    broker: Broker<LspEvent>,
}

impl Default for LspPool {
    fn default() -> Self {
        Self::new()
    }
}

impl LspPool {
    pub fn new() -> Self {
        Self {
            clients: csync::Map::new(),
            watcher_cancels: csync::Slice::new(),
            watchers: Mutex::new(JoinSet::new()),
            broker: Broker::new("lsp"),
        }
    }

    /// Start every non-disabled configured client and its workspace
    /// watcher. Startup failures drive the individual client to `Error`
    /// without affecting the others.
    pub async fn start_clients(
        self: &Arc<Self>,
        configs: &HashMap<String, LspConfig>,
        workspace_root: &Path,
    ) {
        for (name, cfg) in configs {
            if cfg.disabled {
                self.publish_state(name, LspState::Disabled, None, 0).await;
                continue;
            }
            self.publish_state(name, LspState::Starting, None, 0).await;

            match LspClient::start(name, cfg).await {
                Ok(client) => {
                    let client = Arc::new(client);
                    self.clients.set(name.clone(), Arc::clone(&client));
                    self.publish_state(name, LspState::Ready, None, 0).await;
                    self.spawn_watcher(client, workspace_root.to_path_buf())
                        .await;
                }
                Err(e) => {
                    warn!(name, "failed to start LSP client: {e}");
                    self.publish_state(name, LspState::Error, Some(e.to_string()), 0)
                        .await;
                }
            }
        }
    }

    pub fn client(&self, name: &str) -> Option<Arc<LspClient>> {
        self.clients.get(&name.to_string())
    }

    pub fn clients(&self) -> Vec<Arc<LspClient>> {
        self.clients
            .snapshot()
            .into_iter()
            .map(|(_, client)| client)
            .collect()
    }

    pub fn subscribe(&self, cancel: &CancellationToken) -> mpsc::Receiver<Event<LspEvent>> {
        self.broker.subscribe(cancel)
    }

    /// Workspace watcher: polls file modification times and invalidates the
    /// client's stale diagnostics for files that changed.
    async fn spawn_watcher(self: &Arc<Self>, client: Arc<LspClient>, root: PathBuf) {
        let cancel = CancellationToken::new();
        self.watcher_cancels.push(cancel.clone());
        self.watchers.lock().await.spawn(async move {
            let mut seen: HashMap<PathBuf, SystemTime> = HashMap::new();
            scan_workspace(&root, 0, &mut |path, mtime| {
                seen.insert(path, mtime);
            });
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(name = %client.name(), "LSP watcher cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(WATCH_INTERVAL) => {}
                }
                let mut changed = Vec::new();
                scan_workspace(&root, 0, &mut |path, mtime| {
                    if seen.insert(path.clone(), mtime) != Some(mtime) {
                        changed.push(path);
                    }
                });
                for path in changed {
                    client.invalidate(&path);
                }
            }
        });
    }

    /// Cancel every watcher, wait for all of them to exit, then shut each
    /// client down under the per-client budget.
    pub async fn shutdown(&self) {
        for cancel in self.watcher_cancels.snapshot() {
            cancel.cancel();
        }
        let mut watchers = self.watchers.lock().await;
        while watchers.join_next().await.is_some() {}
        drop(watchers);

        for (name, client) in self.clients.snapshot() {
            if let Err(e) = client.shutdown(LSP_SHUTDOWN_TIMEOUT).await {
                warn!(name, "failed to shutdown LSP client: {e}");
            }
            self.publish_state(&name, LspState::Stopped, None, 0).await;
        }
        self.broker.shutdown();
    }

    async fn publish_state(
        &self,
        name: &str,
        state: LspState,
        error: Option<String>,
        diagnostic_count: usize,
    ) {
        self.broker
            .publish(
                EventKind::Updated,
                LspEvent {
                    name: name.to_string(),
                    state,
                    error,
                    diagnostic_count,
                },
            )
            .await;
    }
}

fn scan_workspace(dir: &Path, depth: usize, visit: &mut impl FnMut(PathBuf, SystemTime)) {
    if depth > WATCH_MAX_DEPTH {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || WATCH_IGNORED_DIRS.contains(&name.as_ref()) {
                continue;
            }
            scan_workspace(&path, depth + 1, visit);
        } else if file_type.is_file()
            && let Ok(metadata) = entry.metadata()
            && let Ok(mtime) = metadata.modified()
        {
            visit(path, mtime);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sleep_config() -> LspConfig {
        LspConfig {
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            options: None,
            disabled: false,
        }
    }

    #[tokio::test]
    async fn diagnostics_snapshot_and_invalidation() {
        let client = LspClient::start("fake", &sleep_config()).await.expect("start");
        let path = PathBuf::from("src/main.rs");
        client.set_diagnostics(
            path.clone(),
            vec![Diagnostic {
                severity: DiagnosticSeverity::Error,
                message: "mismatched types".to_string(),
                line: 10,
                character: 4,
            }],
        );
        assert_eq!(client.diagnostic_count(), 1);
        assert_eq!(client.diagnostics_for(&path).len(), 1);

        client.invalidate(&path);
        assert!(client.diagnostics_for(&path).is_empty());

        client.shutdown(LSP_SHUTDOWN_TIMEOUT).await.expect("shutdown");
    }

    #[tokio::test]
    async fn pool_reports_state_transitions_and_shuts_down() {
        let pool = Arc::new(LspPool::new());
        let cancel = CancellationToken::new();
        let mut events = pool.subscribe(&cancel);

        let dir = tempfile::tempdir().expect("tempdir");
        let mut configs = HashMap::new();
        configs.insert("fake".to_string(), sleep_config());
        configs.insert(
            "disabled".to_string(),
            LspConfig {
                disabled: true,
                ..sleep_config()
            },
        );
        configs.insert(
            "broken".to_string(),
            LspConfig {
                command: "/nonexistent/lsp-server".to_string(),
                ..sleep_config()
            },
        );
        pool.start_clients(&configs, dir.path()).await;

        let mut states: HashMap<String, Vec<LspState>> = HashMap::new();
        for _ in 0..5 {
            let event = events.recv().await.expect("event");
            states
                .entry(event.payload.name.clone())
                .or_default()
                .push(event.payload.state);
        }
        assert_eq!(states["disabled"], vec![LspState::Disabled]);
        assert_eq!(states["fake"], vec![LspState::Starting, LspState::Ready]);
        assert_eq!(states["broken"], vec![LspState::Starting, LspState::Error]);

        assert!(pool.client("fake").is_some());
        assert!(pool.client("broken").is_none());

        pool.shutdown().await;
        assert_eq!(
            events.recv().await.expect("stopped event").payload.state,
            LspState::Stopped
        );
    }
}
