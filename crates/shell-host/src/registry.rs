//! Per-operator, per-conversation bookkeeping for live PTY processes.
//!
//! One [`SessionRegistry`] is built at startup and shared (behind an `Arc`)
//! by the runner, its streaming tasks, the dispatcher and the idle-session
//! sweeper. A single lock guards both tables so a key's process entry,
//! its input-wait marker and its activity stamp always change together.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::AbortHandle;

pub type OwnerId = i64;
pub type ConversationId = i64;

/// Registry record of one live shell invocation.
///
/// The awaiting-input marker lives on the entry itself, so it can never
/// outlive or predate the process it describes.
#[derive(Debug)]
pub struct ProcessEntry {
    pub pid: Pid,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub awaiting_input: bool,
    pub(crate) input_tx: mpsc::Sender<Vec<u8>>,
    pub(crate) task: Option<AbortHandle>,
}

impl ProcessEntry {
    pub(crate) fn new(pid: Pid, command: &str, input_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            pid,
            command: command.to_string(),
            started_at: Utc::now(),
            awaiting_input: false,
            input_tx,
            task: None,
        }
    }

    pub(crate) fn with_task(mut self, task: AbortHandle) -> Self {
        self.task = Some(task);
        self
    }
}

/// Read-only row for status listings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSnapshot {
    pub owner: OwnerId,
    pub conversation: ConversationId,
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    pub command: String,
    pub awaiting_input: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivitySnapshot {
    pub owner: OwnerId,
    pub conversation: ConversationId,
    pub idle: Duration,
}

#[derive(Default)]
struct Tables {
    processes: HashMap<OwnerId, HashMap<ConversationId, ProcessEntry>>,
    activity: HashMap<OwnerId, HashMap<ConversationId, Instant>>,
}

impl Tables {
    fn take_process(&mut self, owner: OwnerId, conversation: ConversationId) -> Option<ProcessEntry> {
        let by_conv = self.processes.get_mut(&owner)?;
        let entry = by_conv.remove(&conversation);
        if by_conv.is_empty() {
            self.processes.remove(&owner);
        }
        entry
    }

    fn drop_activity(&mut self, owner: OwnerId, conversation: ConversationId) {
        if let Some(by_conv) = self.activity.get_mut(&owner) {
            by_conv.remove(&conversation);
            if by_conv.is_empty() {
                self.activity.remove(&owner);
            }
        }
    }

    fn entry_mut(&mut self, owner: OwnerId, conversation: ConversationId) -> Option<&mut ProcessEntry> {
        self.processes.get_mut(&owner)?.get_mut(&conversation)
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    tables: RwLock<Tables>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entry` for the pair and stamp activity. Returns whatever
    /// entry it displaced so the caller can terminate that process.
    pub async fn upsert_process(
        &self,
        owner: OwnerId,
        conversation: ConversationId,
        entry: ProcessEntry,
    ) -> Option<ProcessEntry> {
        let mut t = self.tables.write().await;
        t.activity
            .entry(owner)
            .or_default()
            .insert(conversation, Instant::now());
        t.processes
            .entry(owner)
            .or_default()
            .insert(conversation, entry)
    }

    /// Remove the pair's process, its input-wait marker and its activity stamp.
    pub async fn remove_process(
        &self,
        owner: OwnerId,
        conversation: ConversationId,
    ) -> Option<ProcessEntry> {
        let mut t = self.tables.write().await;
        let entry = t.take_process(owner, conversation);
        t.drop_activity(owner, conversation);
        entry
    }

    /// Like [`remove_process`](Self::remove_process), but only when the
    /// current entry still belongs to `pid`. A streaming task that lost a
    /// race with Stop or a restart must not evict its successor.
    pub async fn remove_process_if(
        &self,
        owner: OwnerId,
        conversation: ConversationId,
        pid: Pid,
    ) -> bool {
        let mut t = self.tables.write().await;
        let matches = t
            .entry_mut(owner, conversation)
            .is_some_and(|e| e.pid == pid);
        if !matches {
            return false;
        }
        t.take_process(owner, conversation);
        t.drop_activity(owner, conversation);
        true
    }

    /// Record whether `pid`'s latest output looked like a prompt. Returns
    /// false when the pair has no entry owned by `pid`.
    pub async fn mark_awaiting_input(
        &self,
        owner: OwnerId,
        conversation: ConversationId,
        pid: Pid,
        awaiting: bool,
    ) -> bool {
        let mut t = self.tables.write().await;
        match t.entry_mut(owner, conversation) {
            Some(e) if e.pid == pid => {
                e.awaiting_input = awaiting;
                true
            }
            _ => false,
        }
    }

    pub async fn clear_awaiting_input(&self, owner: OwnerId, conversation: ConversationId) {
        let mut t = self.tables.write().await;
        if let Some(e) = t.entry_mut(owner, conversation) {
            e.awaiting_input = false;
        }
    }

    pub async fn is_awaiting_input(&self, owner: OwnerId, conversation: ConversationId) -> bool {
        let t = self.tables.read().await;
        t.processes
            .get(&owner)
            .and_then(|m| m.get(&conversation))
            .is_some_and(|e| e.awaiting_input)
    }

    pub async fn touch_activity(&self, owner: OwnerId, conversation: ConversationId) {
        let mut t = self.tables.write().await;
        t.activity
            .entry(owner)
            .or_default()
            .insert(conversation, Instant::now());
    }

    pub(crate) async fn input_sender(
        &self,
        owner: OwnerId,
        conversation: ConversationId,
    ) -> Option<(Pid, mpsc::Sender<Vec<u8>>)> {
        let t = self.tables.read().await;
        t.processes
            .get(&owner)
            .and_then(|m| m.get(&conversation))
            .map(|e| (e.pid, e.input_tx.clone()))
    }

    pub async fn pid_of(&self, owner: OwnerId, conversation: ConversationId) -> Option<Pid> {
        let t = self.tables.read().await;
        t.processes
            .get(&owner)
            .and_then(|m| m.get(&conversation))
            .map(|e| e.pid)
    }

    /// Process rows sorted by (owner, conversation).
    pub async fn snapshot(&self) -> Vec<ProcessSnapshot> {
        let t = self.tables.read().await;
        let mut rows: Vec<ProcessSnapshot> = t
            .processes
            .iter()
            .flat_map(|(owner, by_conv)| {
                by_conv.iter().map(move |(conversation, e)| ProcessSnapshot {
                    owner: *owner,
                    conversation: *conversation,
                    pid: e.pid.as_raw(),
                    started_at: e.started_at,
                    command: e.command.clone(),
                    awaiting_input: e.awaiting_input,
                })
            })
            .collect();
        rows.sort_by_key(|r| (r.owner, r.conversation));
        rows
    }

    pub async fn activity_snapshot(&self) -> Vec<ActivitySnapshot> {
        let t = self.tables.read().await;
        let now = Instant::now();
        let mut rows: Vec<ActivitySnapshot> = t
            .activity
            .iter()
            .flat_map(|(owner, by_conv)| {
                by_conv.iter().map(move |(conversation, at)| ActivitySnapshot {
                    owner: *owner,
                    conversation: *conversation,
                    idle: now.saturating_duration_since(*at),
                })
            })
            .collect();
        rows.sort_by_key(|r| (r.owner, r.conversation));
        rows
    }

    pub async fn process_count(&self) -> usize {
        self.tables.read().await.processes.values().map(HashMap::len).sum()
    }

    pub async fn session_count(&self) -> usize {
        self.tables.read().await.activity.values().map(HashMap::len).sum()
    }

    /// Drop activity stamps idle for longer than `max_idle`. Pairs with a
    /// live process are kept so the activity index never loses a key the
    /// process table still holds.
    pub async fn prune_idle(&self, max_idle: Duration) -> usize {
        let mut t = self.tables.write().await;
        let now = Instant::now();
        let Tables {
            processes,
            activity,
        } = &mut *t;
        let mut pruned = 0;
        for (owner, by_conv) in activity.iter_mut() {
            let live = processes.get(owner);
            by_conv.retain(|conversation, at| {
                let keep = now.saturating_duration_since(*at) <= max_idle
                    || live.is_some_and(|m| m.contains_key(conversation));
                if !keep {
                    pruned += 1;
                }
                keep
            });
        }
        activity.retain(|_, by_conv| !by_conv.is_empty());
        pruned
    }

    /// Empty every table, handing back the process entries that were live.
    pub async fn clear_all(&self) -> Vec<ProcessEntry> {
        let mut t = self.tables.write().await;
        t.activity.clear();
        t.processes
            .drain()
            .flat_map(|(_, by_conv)| by_conv.into_values())
            .collect()
    }
}
