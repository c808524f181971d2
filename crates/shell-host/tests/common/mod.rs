//! Shared harness for the integration tests.
//!
//! Builds a runner wired to a channel notifier inside a temp base dir,
//! offers polling helpers for asynchronous cleanup, and can spawn the real
//! binary with piped stdin/stdout.

use std::future::Future;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use relay_shell_host::config::RunnerConfig;
use relay_shell_host::notifier::{ChannelNotifier, Delivery, Notifier};
use relay_shell_host::registry::SessionRegistry;
use relay_shell_host::runner::ProcessRunner;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const TIMEOUT: Duration = Duration::from_secs(5);

// ── Runner harness ──────────────────────────────────────────────────

pub struct Harness {
    pub runner: Arc<ProcessRunner>,
    pub registry: Arc<SessionRegistry>,
    pub notifier: Arc<dyn Notifier>,
    pub rx: mpsc::UnboundedReceiver<Delivery>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Build with a tweaked config. Defaults: `sh`, 100ms grace, 20ms poll.
    pub fn with_config(tweak: impl FnOnce(&mut RunnerConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = RunnerConfig {
            base_dir: dir.path().canonicalize().expect("canonical tempdir"),
            shell: "sh".into(),
            poll_interval: Duration::from_millis(20),
            stop_grace: Duration::from_millis(100),
            ..RunnerConfig::default()
        };
        tweak(&mut config);
        let (notifier, rx) = ChannelNotifier::new();
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);
        let registry = Arc::new(SessionRegistry::new());
        let runner = Arc::new(ProcessRunner::new(
            config,
            Arc::clone(&registry),
            Arc::clone(&notifier),
        ));
        Self {
            runner,
            registry,
            notifier,
            rx,
            dir,
        }
    }

    /// Accumulate delivered text for `conversation` until it contains
    /// `needle`. Returns everything collected, or `None` on timeout.
    pub async fn collect_until(&mut self, conversation: i64, needle: &str) -> Option<String> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        let mut text = String::new();
        loop {
            let delivery = tokio::time::timeout_at(deadline, self.rx.recv()).await.ok()??;
            if delivery.conversation == conversation {
                text.push_str(&delivery.text);
                if text.contains(needle) {
                    return Some(text);
                }
            }
        }
    }

    /// Every chunk delivered until the channel has been quiet for `quiet`.
    pub async fn drain_chunks(&mut self, quiet: Duration) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Ok(Some(d)) = tokio::time::timeout(quiet, self.rx.recv()).await {
            out.push(d);
        }
        out
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Whether a process with `pid` still exists. Reaped children read as gone.
pub fn pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

// ── Binary harness ──────────────────────────────────────────────────

/// A running `relay-shell-host`. Killed on drop.
pub struct HostProcess {
    pub child: Child,
    stdin: Option<ChildStdin>,
    lines: std_mpsc::Receiver<String>,
}

impl HostProcess {
    pub fn spawn(base_dir: &Path, primary: i64) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_relay-shell-host"))
            .args(["--primary-admin", &primary.to_string()])
            .arg("--base-dir")
            .arg(base_dir)
            .arg("--data-file")
            .arg(base_dir.join("admins.json"))
            .args(["--bind", "127.0.0.1", "--port", "0", "--shell", "sh"])
            .env("RUST_LOG", "warn")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn relay-shell-host");

        let stdout = child.stdout.take().expect("stdout");
        let (tx, lines) = std_mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        let stdin = child.stdin.take();
        Self { child, stdin, lines }
    }

    pub fn send(&mut self, owner: i64, conversation: i64, text: &str) {
        let line = serde_json::json!({
            "owner": owner,
            "conversation": conversation,
            "text": text,
        });
        let stdin = self.stdin.as_mut().expect("stdin already closed");
        writeln!(stdin, "{line}").expect("write to host stdin");
        stdin.flush().expect("flush host stdin");
    }

    /// Next delivery matching `pred`, skipping others.
    pub fn recv_matching(&self, pred: impl Fn(&Delivery) -> bool) -> Option<Delivery> {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let line = self.lines.recv_timeout(remaining).ok()?;
            let delivery: Delivery = serde_json::from_str(&line).expect("stdout line is a delivery");
            if pred(&delivery) {
                return Some(delivery);
            }
        }
    }

    /// Write raw bytes to stdin, bypassing JSON encoding.
    pub fn send_raw(&mut self, bytes: &[u8]) {
        let stdin = self.stdin.as_mut().expect("stdin already closed");
        stdin.write_all(bytes).expect("write to host stdin");
        stdin.flush().expect("flush host stdin");
    }

    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Wait for the process to exit on its own.
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<std::process::ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }
}

impl Drop for HostProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
