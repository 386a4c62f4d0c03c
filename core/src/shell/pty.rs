use std::collections::VecDeque;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use portable_pty::Child;
use portable_pty::ChildKiller;
use portable_pty::CommandBuilder;
use portable_pty::ExitStatus;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::SlavePty;
use portable_pty::native_pty_system;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

/// Read size for the PTY pump; consumers see chunks of at most this size.
const PTY_READ_SIZE: usize = 4096;

/// Upper bound on bytes buffered between the PTY reader and the consumer.
/// On overflow the oldest half is discarded; bytes are never reordered.
const OUTPUT_BUFFER_MAX_BYTES: usize = 1024 * 1024;

/// Grace period between SIGHUP and force-kill during close.
const CLOSE_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to spawn shell: {source}")]
    Spawn {
        #[source]
        source: anyhow::Error,
    },
    #[error("shell already closed")]
    AlreadyClosed,
    #[error("resize failed: {source}")]
    Resize {
        #[source]
        source: anyhow::Error,
    },
    #[error("signals are not supported on this platform")]
    UnsupportedSignal,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Default)]
struct OutputRing {
    chunks: VecDeque<Vec<u8>>,
    total_bytes: usize,
    closed: bool,
}

impl OutputRing {
    fn push_chunk(&mut self, chunk: Vec<u8>) {
        self.total_bytes = self.total_bytes.saturating_add(chunk.len());
        self.chunks.push_back(chunk);

        if self.total_bytes <= OUTPUT_BUFFER_MAX_BYTES {
            return;
        }
        // Drop whole chunks from the front until at most half the budget
        // remains; a suffix of the read sequence survives, in order.
        let keep = OUTPUT_BUFFER_MAX_BYTES / 2;
        while self.total_bytes > keep {
            match self.chunks.pop_front() {
                Some(front) => {
                    self.total_bytes = self.total_bytes.saturating_sub(front.len());
                }
                None => break,
            }
        }
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        self.total_bytes = 0;
        self.chunks.drain(..).collect()
    }
}

/// A user shell attached to a pseudo-terminal.
///
/// Exactly one blocking thread reads from the PTY and exactly one waits for
/// process exit. Consume output via [`PtyShell::output`], forward keystrokes
/// with [`PtyShell::write`], call [`PtyShell::resize`] on window changes,
/// and [`PtyShell::close`] to terminate gracefully.
pub struct PtyShell {
    master: StdMutex<Option<Box<dyn MasterPty + Send>>>,
    writer: StdMutex<Option<Box<dyn Write + Send>>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    child_pid: Option<u32>,
    exited: watch::Receiver<bool>,
    output_rx: StdMutex<Option<mpsc::Receiver<Vec<u8>>>>,
    done_rx: StdMutex<Option<mpsc::Receiver<std::io::Result<ExitStatus>>>>,
    signal_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PtyShell {
    /// Fork-and-exec `shell` on a fresh PTY. With `env == None` the child
    /// inherits the parent environment. Must be called within a tokio
    /// runtime; the output forwarder runs as a background task.
    pub fn spawn(
        shell: &str,
        args: &[String],
        env: Option<&[(String, String)]>,
        cwd: Option<&Path>,
    ) -> Result<Self, ShellError> {
        let (shell, args) = if shell.is_empty() {
            super::detect_user_shell()
        } else {
            (shell.to_string(), args.to_vec())
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ShellError::Spawn { source: e })?;

        let mut command = CommandBuilder::new(&shell);
        for arg in &args {
            command.arg(arg);
        }
        if let Some(env) = env {
            command.env_clear();
            for (key, value) in env {
                command.env(key, value);
            }
        }
        if let Some(cwd) = cwd {
            command.cwd(cwd);
        }

        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| ShellError::Spawn { source: e })?;
        let killer = child.clone_killer();
        let child_pid = child.process_id();

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ShellError::Spawn { source: e })?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ShellError::Spawn { source: e })?;

        let ring = Arc::new(Mutex::new(OutputRing::default()));
        let notify = Arc::new(Notify::new());

        // Sole PTY reader: pump bytes into the bounded ring and wake the
        // forwarder. On EOF mark the ring closed so the stream ends.
        {
            let ring = Arc::clone(&ring);
            let notify = Arc::clone(&notify);
            tokio::task::spawn_blocking(move || {
                let mut buf = [0u8; PTY_READ_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            ring.blocking_lock().push_chunk(buf[..n].to_vec());
                            notify.notify_one();
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            debug!("pty read ended: {e}");
                            break;
                        }
                    }
                }
                ring.blocking_lock().closed = true;
                notify.notify_one();
            });
        }

        // Forwarder: drain the ring into the consumer channel, strictly in
        // read order, and close the channel at EOF.
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(64);
        {
            let ring = Arc::clone(&ring);
            let notify = Arc::clone(&notify);
            tokio::spawn(async move {
                loop {
                    let (chunks, ring_closed) = {
                        let mut guard = ring.lock().await;
                        (guard.drain(), guard.closed)
                    };
                    for chunk in chunks {
                        if output_tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    if ring_closed {
                        return;
                    }
                    notify.notified().await;
                }
            });
        }

        // Sole exit waiter: deliver the exit result once, then close.
        let (exited_tx, exited) = watch::channel(false);
        let (done_tx, done_rx) = mpsc::channel::<std::io::Result<ExitStatus>>(1);
        tokio::task::spawn_blocking(move || {
            let result = child.wait();
            let _ = exited_tx.send(true);
            let _ = done_tx.blocking_send(result);
        });

        let shell = Self {
            master: StdMutex::new(Some(pair.master)),
            writer: StdMutex::new(Some(writer)),
            killer: StdMutex::new(killer),
            child_pid,
            exited,
            output_rx: StdMutex::new(Some(output_rx)),
            done_rx: StdMutex::new(Some(done_rx)),
            signal_task: StdMutex::new(None),
            closed: AtomicBool::new(false),
        };
        shell.forward_host_signals();
        Ok(shell)
    }

    /// The output stream: raw PTY bytes, ANSI sequences included, closed on
    /// process exit. Takeable once.
    pub fn output(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Single-shot stream yielding the exit result; closed after delivery.
    /// Takeable once.
    pub fn done(&self) -> Option<mpsc::Receiver<std::io::Result<ExitStatus>>> {
        self.done_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Write bytes to the PTY master (the shell's stdin).
    pub fn write(&self, bytes: &[u8]) -> Result<usize, ShellError> {
        if self.closed.load(Ordering::Acquire) || *self.exited.borrow() {
            return Err(ShellError::AlreadyClosed);
        }
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(writer) = guard.as_mut() else {
            return Err(ShellError::AlreadyClosed);
        };
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(bytes.len())
    }

    /// Propagate a window-size change to the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), ShellError> {
        let guard = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(master) = guard.as_ref() else {
            return Err(ShellError::AlreadyClosed);
        };
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ShellError::Resize { source: e })
    }

    /// Forward `signal` to the shell process.
    #[cfg(unix)]
    pub fn signal(&self, signal: i32) -> Result<(), ShellError> {
        let Some(pid) = self.child_pid else {
            return Ok(());
        };
        // SAFETY: plain kill(2) on the child's pid.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(ShellError::Io(std::io::Error::last_os_error()))
        }
    }

    #[cfg(not(unix))]
    pub fn signal(&self, _signal: i32) -> Result<(), ShellError> {
        Err(ShellError::UnsupportedSignal)
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Graceful shutdown: SIGHUP, a 300 ms grace window, then force-kill.
    /// The PTY file descriptor is closed exactly once.
    pub async fn close(&self) -> Result<(), ShellError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        #[cfg(unix)]
        let _ = self.signal(libc::SIGHUP);

        let mut exited = self.exited.clone();
        let graceful = tokio::time::timeout(CLOSE_GRACE, async {
            while !*exited.borrow_and_update() {
                if exited.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        if graceful.is_err() {
            if let Err(e) = self
                .killer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .kill()
            {
                warn!("failed to kill shell process: {e}");
            }
        }

        if let Some(task) = self
            .signal_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    /// Forward host-process SIGHUP/SIGTERM to the child so closing the
    /// surrounding terminal tears the shell down cleanly.
    #[cfg(unix)]
    fn forward_host_signals(&self) {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;

        let Some(pid) = self.child_pid else {
            return;
        };
        let task = tokio::spawn(async move {
            let (Ok(mut hangup), Ok(mut terminate)) = (
                signal(SignalKind::hangup()),
                signal(SignalKind::terminate()),
            ) else {
                warn!("failed to install signal forwarders for pty shell");
                return;
            };
            loop {
                let sig = tokio::select! {
                    _ = hangup.recv() => libc::SIGHUP,
                    _ = terminate.recv() => libc::SIGTERM,
                };
                // SAFETY: plain kill(2) on the child's pid.
                unsafe {
                    libc::kill(pid as libc::pid_t, sig);
                }
            }
        });
        *self
            .signal_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    #[cfg(not(unix))]
    fn forward_host_signals(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ring_discards_oldest_half_on_overflow() {
        let mut ring = OutputRing::default();
        let chunk = vec![b'a'; PTY_READ_SIZE];
        let chunks_to_fill = OUTPUT_BUFFER_MAX_BYTES / PTY_READ_SIZE;
        for _ in 0..chunks_to_fill {
            ring.push_chunk(chunk.clone());
        }
        assert_eq!(ring.total_bytes, OUTPUT_BUFFER_MAX_BYTES);

        ring.push_chunk(vec![b'z'; 8]);
        assert!(ring.total_bytes <= OUTPUT_BUFFER_MAX_BYTES / 2);
        // The newest chunk survived at the back.
        assert_eq!(ring.chunks.back().map(Vec::len), Some(8));
    }

    #[test]
    fn ring_drain_empties_and_preserves_order() {
        let mut ring = OutputRing::default();
        ring.push_chunk(vec![1]);
        ring.push_chunk(vec![2, 2]);
        let drained = ring.drain();
        assert_eq!(drained, vec![vec![1], vec![2, 2]]);
        assert_eq!(ring.total_bytes, 0);
        assert!(ring.drain().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echo_round_trips_through_the_pty() {
        let shell = PtyShell::spawn("/bin/sh", &["-i".to_string()], None, None).expect("spawn");
        let mut output = shell.output().expect("output stream");

        shell.write(b"echo tether_pty_roundtrip\n").expect("write");

        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let chunk = tokio::time::timeout_at(deadline, output.recv())
                .await
                .expect("pty output before deadline");
            let Some(chunk) = chunk else { break };
            seen.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&seen).contains("tether_pty_roundtrip") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&seen).contains("tether_pty_roundtrip"));

        shell.close().await.expect("close");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_after_close_reports_already_closed() {
        let shell = PtyShell::spawn("/bin/sh", &["-i".to_string()], None, None).expect("spawn");
        shell.close().await.expect("close");
        match shell.write(b"echo nope\n") {
            Err(ShellError::AlreadyClosed) => {}
            other => panic!("expected AlreadyClosed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn done_yields_exit_after_shell_exits() {
        let shell = PtyShell::spawn("/bin/sh", &["-i".to_string()], None, None).expect("spawn");
        let mut done = shell.done().expect("done stream");

        shell.write(b"exit\n").expect("write");
        let result = tokio::time::timeout(Duration::from_secs(10), done.recv())
            .await
            .expect("exit before deadline")
            .expect("one exit result");
        assert!(result.is_ok());
        // The stream is single-shot: closed after delivery.
        assert!(done.recv().await.is_none());
        shell.close().await.expect("close");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resize_propagates_without_error() {
        let shell = PtyShell::spawn("/bin/sh", &["-i".to_string()], None, None).expect("spawn");
        shell.resize(120, 40).expect("resize");
        shell.close().await.expect("close");
    }
}
