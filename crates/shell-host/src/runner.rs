//! PTY process runner: spawn, stream, accept input, stop, clean up.
//!
//! Each started command gets one tokio task that owns the PTY master for
//! its whole life. The task polls the master with a short timeout, forwards
//! output chunks to the [`Notifier`] in read order, flags likely prompts,
//! writes queued stdin, and probes the child after every wakeup. When the
//! child is gone (or the master errors) the task drains what is left,
//! removes its registry entry and closes the descriptor.
//!
//! Stop and StopAll remove registry entries themselves and only signal the
//! process; the streaming task notices the death on its next probe. Its
//! own removal is keyed by pid, so the double cleanup is harmless.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::notifier::Notifier;
use crate::output::{decode_chunk, looks_like_prompt, truncate_for_display};
use crate::pty::{self, ChildState};
use crate::registry::{ConversationId, OwnerId, ProcessEntry, ProcessSnapshot, SessionRegistry};

const INPUT_QUEUE: usize = 64;
const INPUT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound on reads when draining a dead child's leftover output.
const MAX_DRAIN_READS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NothingToStop,
}

pub struct ProcessRunner {
    config: RunnerConfig,
    registry: Arc<SessionRegistry>,
    notifier: Arc<dyn Notifier>,
}

impl ProcessRunner {
    pub fn new(
        config: RunnerConfig,
        registry: Arc<SessionRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            registry,
            notifier,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start `command` for the pair, replacing any process it already has.
    ///
    /// Returns once the child is spawned and registered; output streams
    /// from a background task. Spawn failures are returned here and leave
    /// nothing registered.
    pub async fn start(
        &self,
        command: &str,
        owner: OwnerId,
        conversation: ConversationId,
    ) -> Result<Pid, RunnerError> {
        if command.trim().is_empty() {
            return Err(RunnerError::EmptyCommand);
        }

        if let Some(old) = self.registry.remove_process(owner, conversation).await {
            info!(pid = %old.pid, owner, conversation, "replacing running process");
            self.terminate(old.pid).await;
        }

        let child = pty::spawn_shell(&self.config.shell, command, &self.config.base_dir)
            .map_err(|source| RunnerError::Spawn {
                command: command.to_string(),
                source,
            })?;
        let pid = child.pid;
        info!(pid = %pid, owner, conversation, command, "spawned");

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let (go_tx, go_rx) = oneshot::channel::<()>();
        let stream = Stream {
            registry: Arc::clone(&self.registry),
            notifier: Arc::clone(&self.notifier),
            owner,
            conversation,
            pid,
            display_limit: self.config.display_limit,
            read_chunk: self.config.read_chunk,
            poll_interval: self.config.poll_interval,
            reap_grace: self.config.stop_grace,
        };
        // The task waits for its entry to be registered, so its cleanup can
        // never run ahead of the insert.
        let task = tokio::spawn(async move {
            let _ = go_rx.await;
            stream.run(child.master, input_rx).await;
        });

        let entry = ProcessEntry::new(pid, command, input_tx).with_task(task.abort_handle());
        if let Some(displaced) = self.registry.upsert_process(owner, conversation, entry).await {
            // A concurrent start won the slot between our removal and insert.
            warn!(pid = %displaced.pid, owner, conversation, "killing displaced process");
            pty::signal_child(displaced.pid, Signal::SIGKILL);
        }
        let _ = go_tx.send(());
        Ok(pid)
    }

    /// Queue `text` plus a newline for the pair's process stdin.
    pub async fn send_input(
        &self,
        owner: OwnerId,
        conversation: ConversationId,
        text: &str,
    ) -> Result<(), RunnerError> {
        let (pid, tx) = self
            .registry
            .input_sender(owner, conversation)
            .await
            .ok_or(RunnerError::NotRunning)?;
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        tx.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RunnerError::InputQueueFull,
            mpsc::error::TrySendError::Closed(_) => RunnerError::NotRunning,
        })?;
        self.registry.clear_awaiting_input(owner, conversation).await;
        debug!(pid = %pid, owner, conversation, bytes = text.len() + 1, "queued input");
        Ok(())
    }

    /// SIGTERM, grace, SIGKILL. Registry entries are gone before this
    /// returns; a process that already exited is not an error.
    pub async fn stop(&self, owner: OwnerId, conversation: ConversationId) -> StopOutcome {
        let Some(entry) = self.registry.remove_process(owner, conversation).await else {
            return StopOutcome::NothingToStop;
        };
        info!(pid = %entry.pid, owner, conversation, "stopping");
        self.terminate(entry.pid).await;
        StopOutcome::Stopped
    }

    /// Force-kill every tracked process and empty the registry. Returns how
    /// many processes actually received the signal.
    pub async fn stop_all(&self) -> usize {
        let entries = self.registry.clear_all().await;
        let killed = entries
            .iter()
            .filter(|e| pty::signal_child(e.pid, Signal::SIGKILL))
            .count();
        info!(tracked = entries.len(), killed, "stopped all processes");
        killed
    }

    /// Process-exit teardown: kill everything and abort the streaming tasks.
    pub async fn shutdown(&self) {
        for entry in self.registry.clear_all().await {
            pty::signal_child(entry.pid, Signal::SIGKILL);
            if let Some(task) = entry.task {
                task.abort();
            }
        }
    }

    pub async fn snapshot(&self) -> Vec<ProcessSnapshot> {
        self.registry.snapshot().await
    }

    async fn terminate(&self, pid: Pid) {
        pty::signal_child(pid, Signal::SIGTERM);
        time::sleep(self.config.stop_grace).await;
        pty::signal_child(pid, Signal::SIGKILL);
    }
}

enum LoopExit {
    Child(ChildState),
    Eof,
    Io(io::Error),
}

/// Everything a streaming task needs apart from the descriptor and the
/// input queue, which it owns outright.
struct Stream {
    registry: Arc<SessionRegistry>,
    notifier: Arc<dyn Notifier>,
    owner: OwnerId,
    conversation: ConversationId,
    pid: Pid,
    display_limit: usize,
    read_chunk: usize,
    poll_interval: Duration,
    reap_grace: Duration,
}

impl Stream {
    async fn run(self, master: OwnedFd, input_rx: mpsc::Receiver<Vec<u8>>) {
        let exit = match AsyncFd::new(master) {
            Ok(master) => {
                let exit = self.pump(&master, input_rx).await;
                self.drain(&master).await;
                exit
            }
            Err(e) => LoopExit::Io(e),
        };

        let state = match exit {
            LoopExit::Child(state) => state,
            LoopExit::Eof => self.reap().await,
            LoopExit::Io(e) => {
                debug!(pid = %self.pid, error = %e, "pty closed");
                self.reap().await
            }
        };
        match state {
            ChildState::Exited(code) => info!(pid = %self.pid, code, "process exited"),
            _ => info!(pid = %self.pid, "process gone"),
        }

        self.registry
            .remove_process_if(self.owner, self.conversation, self.pid)
            .await;
    }

    async fn pump(
        &self,
        master: &AsyncFd<OwnedFd>,
        mut input_rx: mpsc::Receiver<Vec<u8>>,
    ) -> LoopExit {
        let mut buf = vec![0u8; self.read_chunk];
        loop {
            tokio::select! {
                ready = time::timeout(self.poll_interval, master.readable()) => match ready {
                    Err(_elapsed) => {}
                    Ok(Err(e)) => return LoopExit::Io(e),
                    Ok(Ok(mut guard)) => {
                        match guard.try_io(|fd| pty::read_fd(fd.as_raw_fd(), &mut buf)) {
                            Ok(Ok(0)) => return LoopExit::Eof,
                            Ok(Ok(n)) => self.forward(&buf[..n]).await,
                            Ok(Err(e)) => return LoopExit::Io(e),
                            Err(_would_block) => {}
                        }
                    }
                },
                Some(line) = input_rx.recv() => {
                    match time::timeout(INPUT_WRITE_TIMEOUT, write_all(master, &line)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!(pid = %self.pid, error = %e, "stdin write failed"),
                        Err(_) => warn!(pid = %self.pid, "stdin write timed out"),
                    }
                }
            }

            match pty::probe_child(self.pid) {
                ChildState::Running => {}
                state => return LoopExit::Child(state),
            }
        }
    }

    /// Forward whatever the master still buffers after the child died.
    async fn drain(&self, master: &AsyncFd<OwnedFd>) {
        let mut buf = vec![0u8; self.read_chunk];
        for _ in 0..MAX_DRAIN_READS {
            match pty::read_fd(master.as_raw_fd(), &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => self.forward(&buf[..n]).await,
            }
        }
    }

    async fn forward(&self, data: &[u8]) {
        let text = decode_chunk(data);
        if text.is_empty() {
            return;
        }
        // Flag before delivering so a fast reply to the prompt is routed as stdin.
        self.registry
            .mark_awaiting_input(self.owner, self.conversation, self.pid, looks_like_prompt(&text))
            .await;
        let shown = truncate_for_display(&text, self.display_limit);
        if let Err(e) = self.notifier.deliver(self.conversation, &shown).await {
            warn!(pid = %self.pid, conversation = self.conversation, error = %e, "delivery failed");
        }
    }

    /// Wait out a short grace for the child to finish after its PTY closed,
    /// then force it. Never leaves an untracked process behind.
    async fn reap(&self) -> ChildState {
        let deadline = time::Instant::now() + self.reap_grace;
        loop {
            match pty::probe_child(self.pid) {
                ChildState::Running if time::Instant::now() < deadline => {
                    time::sleep(self.poll_interval).await;
                }
                ChildState::Running => break,
                state => return state,
            }
        }
        warn!(pid = %self.pid, "pty closed but child still running; killing");
        pty::signal_child(self.pid, Signal::SIGKILL);
        time::sleep(self.poll_interval).await;
        pty::probe_child(self.pid)
    }
}

async fn write_all(master: &AsyncFd<OwnedFd>, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        let mut guard = master.writable().await?;
        match guard.try_io(|fd| pty::write_fd(fd.as_raw_fd(), data)) {
            Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(Ok(n)) => data = &data[n..],
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}
