//! Inbound message routing.
//!
//! [`classify`] turns operator text into an [`Action`] without touching
//! any state; [`Dispatcher::handle`] authorizes the sender, records
//! activity and carries the action out against the runner, the admin
//! store and the editor. Every reply goes back through the notifier.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::admin::AdminStore;
use crate::editor::Editor;
use crate::error::{AdminError, EditorError, RunnerError};
use crate::notifier::Notifier;
use crate::registry::{ConversationId, OwnerId};
use crate::runner::{ProcessRunner, StopOutcome};

/// Characters shown by `/view`.
pub const VIEW_LIMIT: usize = 1000;
/// Entries listed by `/files`.
pub const FILES_LIMIT: usize = 20;

const DENIED: &str = "❌ You are not authorized to use this bot.";
const PRIMARY_ONLY: &str = "❌ Main admin only!";

/// Keyboard labels and the shell commands they stand for.
const QUICK_KEYS: &[(&str, &str)] = &[
    ("📁 ls", "ls -la"),
    ("📂 pwd", "pwd"),
    ("💿 df -h", "df -h"),
    ("📊 top", "top -b -n 1 | head -20"),
    ("📜 ps aux", "ps aux | head -15"),
    ("🔄 ping 8.8.8.8", "ping -c 4 8.8.8.8"),
    ("🌐 ifconfig", "ifconfig || ip addr"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    RunCommand(String),
    StopCurrent,
    ForwardInput(String),
    NoOp,
    Control(Control),
}

/// Operator commands that never reach a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Help,
    Status,
    Sessions,
    StopAll,
    Nano(Option<String>),
    View(Option<String>),
    Files,
    Admins,
    AddAdmin(Option<String>),
    RemoveAdmin(Option<String>),
    Clean,
    Clear,
}

/// Map operator text to an action. Slash commands win, then a pending
/// prompt takes the text as stdin, then keyboard labels, then anything
/// else runs as a shell command.
pub fn classify(text: &str, awaiting_input: bool) -> Action {
    let text = text.trim();
    if let Some(action) = parse_command(text) {
        return action;
    }
    if awaiting_input {
        return Action::ForwardInput(text.to_string());
    }
    match text {
        "" => Action::NoOp,
        "🛑 stop" => Action::StopCurrent,
        "🗑️ clear" => Action::Control(Control::Clear),
        "📝 nano" => Action::Control(Control::Nano(None)),
        _ => match QUICK_KEYS.iter().find(|(label, _)| *label == text) {
            Some((_, command)) => Action::RunCommand((*command).to_string()),
            None => Action::RunCommand(text.to_string()),
        },
    }
}

/// Recognized `/command [arg]` forms. Anything else starting with a slash
/// is a path and runs as a command.
fn parse_command(text: &str) -> Option<Action> {
    let rest = text.strip_prefix('/')?;
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, Some(arg.trim()).filter(|a| !a.is_empty())),
        None => (rest, None),
    };
    let arg = arg.map(str::to_string);
    let action = match name {
        "start" | "help" => Action::Control(Control::Help),
        "status" => Action::Control(Control::Status),
        "sessions" => Action::Control(Control::Sessions),
        "stop" => Action::StopCurrent,
        "stopall" => Action::Control(Control::StopAll),
        "nano" => Action::Control(Control::Nano(arg)),
        "view" => Action::Control(Control::View(arg)),
        "files" => Action::Control(Control::Files),
        "admins" => Action::Control(Control::Admins),
        "addadmin" => Action::Control(Control::AddAdmin(arg)),
        "rmadmin" => Action::Control(Control::RemoveAdmin(arg)),
        "clean" => Action::Control(Control::Clean),
        _ => return None,
    };
    Some(action)
}

pub struct DispatcherSettings {
    /// Base URL edit links are built on, without a trailing slash.
    pub public_url: String,
    /// Activity older than this is dropped by `/clean`.
    pub idle_session_age: Duration,
}

pub struct Dispatcher {
    runner: Arc<ProcessRunner>,
    admins: Arc<AdminStore>,
    editor: Arc<Editor>,
    notifier: Arc<dyn Notifier>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(
        runner: Arc<ProcessRunner>,
        admins: Arc<AdminStore>,
        editor: Arc<Editor>,
        notifier: Arc<dyn Notifier>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            runner,
            admins,
            editor,
            notifier,
            settings,
        }
    }

    /// Handle one inbound message from `owner` in `conversation`.
    pub async fn handle(&self, owner: OwnerId, conversation: ConversationId, text: &str) {
        if !self.admins.is_admin(owner).await {
            info!(owner, conversation, "rejected message from non-admin");
            self.reply(conversation, DENIED).await;
            return;
        }
        let registry = self.runner.registry();
        registry.touch_activity(owner, conversation).await;
        let awaiting = registry.is_awaiting_input(owner, conversation).await;

        match classify(text, awaiting) {
            Action::NoOp => {}
            Action::RunCommand(command) => self.run(owner, conversation, &command).await,
            Action::StopCurrent => self.stop(owner, conversation).await,
            Action::ForwardInput(line) => self.forward(owner, conversation, &line).await,
            Action::Control(control) => self.control(owner, conversation, control).await,
        }
    }

    async fn run(&self, owner: OwnerId, conversation: ConversationId, command: &str) {
        self.reply(conversation, &format!("$ {command}")).await;
        if let Err(e) = self.runner.start(command, owner, conversation).await {
            warn!(owner, conversation, error = %e, "start failed");
            self.reply(conversation, &format!("❌ {e}")).await;
        }
    }

    async fn stop(&self, owner: OwnerId, conversation: ConversationId) {
        let text = match self.runner.stop(owner, conversation).await {
            StopOutcome::Stopped => "✅ Process stopped successfully!",
            StopOutcome::NothingToStop => "⚠️ No running process to stop.",
        };
        self.reply(conversation, text).await;
    }

    async fn forward(&self, owner: OwnerId, conversation: ConversationId, line: &str) {
        match self.runner.send_input(owner, conversation, line).await {
            Ok(()) => {}
            Err(RunnerError::NotRunning) => {
                self.reply(conversation, "⚠️ The process already exited.").await;
            }
            Err(e) => self.reply(conversation, &format!("❌ {e}")).await,
        }
    }

    async fn control(&self, owner: OwnerId, conversation: ConversationId, control: Control) {
        let primary_only = matches!(
            control,
            Control::StopAll | Control::Admins | Control::AddAdmin(_) | Control::RemoveAdmin(_)
        );
        if primary_only && !self.admins.is_primary(owner) {
            self.reply(conversation, PRIMARY_ONLY).await;
            return;
        }

        let text = match control {
            Control::Help => help_text(),
            Control::Status => self.status_text().await,
            Control::Sessions => self.sessions_text().await,
            Control::StopAll => {
                let stopped = self.runner.stop_all().await;
                format!("✅ Stopped {stopped} processes")
            }
            Control::Nano(name) => self.open_editor(owner, name).await,
            Control::View(name) => self.view(name).await,
            Control::Files => self.files(),
            Control::Admins => {
                let list = self.admins.list().await;
                let mut text = String::from("👑 Admins:");
                for id in list {
                    let tag = if self.admins.is_primary(id) { " (main)" } else { "" };
                    let _ = write!(text, "\n• {id}{tag}");
                }
                text
            }
            Control::AddAdmin(None) => "Usage: /addadmin <user id>".to_string(),
            Control::AddAdmin(Some(raw)) => match self.admins.add(&raw).await {
                Ok(id) => {
                    info!(by = owner, added = id, "admin added");
                    format!("✅ Added admin: {id}")
                }
                Err(e) => admin_error_text(e),
            },
            Control::RemoveAdmin(None) => "Usage: /rmadmin <user id>".to_string(),
            Control::RemoveAdmin(Some(raw)) => match self.admins.remove(&raw).await {
                Ok(id) => {
                    info!(by = owner, removed = id, "admin removed");
                    format!("✅ Removed admin: {id}")
                }
                Err(e) => admin_error_text(e),
            },
            Control::Clean => {
                let cleaned = self
                    .runner
                    .registry()
                    .prune_idle(self.settings.idle_session_age)
                    .await;
                format!("✅ Cleaned {cleaned} old sessions")
            }
            Control::Clear => "🗑️ Chat cleared (bot-side)".to_string(),
        };
        self.reply(conversation, &text).await;
    }

    async fn status_text(&self) -> String {
        let registry = self.runner.registry();
        let rows = registry.snapshot().await;
        let mut text = format!(
            "📊 System status\n• Active processes: {}\n• Active sessions: {}\n• Admins: {}\n• Base directory: {}",
            rows.len(),
            registry.session_count().await,
            self.admins.list().await.len(),
            self.base_dir().display(),
        );
        let mut owners: Vec<(OwnerId, usize)> = Vec::new();
        for row in &rows {
            match owners.last_mut() {
                Some((owner, count)) if *owner == row.owner => *count += 1,
                _ => owners.push((row.owner, 1)),
            }
        }
        for (owner, count) in owners {
            let _ = write!(text, "\n👤 Admin {owner}: {count} process(es)");
        }
        text
    }

    async fn sessions_text(&self) -> String {
        let rows = self.runner.registry().activity_snapshot().await;
        if rows.is_empty() {
            return "🔄 No active sessions".to_string();
        }
        let mut text = String::from("🔄 Active sessions");
        let mut current = None;
        for row in rows {
            if current != Some(row.owner) {
                let _ = write!(text, "\n👤 Admin {}:", row.owner);
                current = Some(row.owner);
            }
            let _ = write!(text, "\n  • Chat {}: {}s ago", row.conversation, row.idle.as_secs());
        }
        text
    }

    async fn open_editor(&self, owner: OwnerId, name: Option<String>) -> String {
        let Some(name) = name else {
            return "Usage: /nano <filename>".to_string();
        };
        match self.editor.open_session(&name, owner).await {
            Ok(token) => format!(
                "📝 Edit {name}\n{}/edit/{token}?admin_id={owner}",
                self.settings.public_url
            ),
            Err(EditorError::Denied) => "❌ That path is outside the working directory.".to_string(),
            Err(EditorError::Io(e)) => {
                warn!(error = %e, "failed to prepare file for editing");
                format!("❌ Cannot open file: {e}")
            }
        }
    }

    async fn view(&self, name: Option<String>) -> String {
        let Some(name) = name else {
            return "Usage: /view <filename>".to_string();
        };
        match self.editor.preview(&name, VIEW_LIMIT).await {
            Ok(content) if content.is_empty() => format!("📄 {name} is empty"),
            Ok(content) => format!("📄 {name}:\n{content}"),
            Err(EditorError::Denied) => "❌ Cannot read file: not a regular file in the working directory".to_string(),
            Err(EditorError::Io(e)) => format!("❌ Cannot read file: {e}"),
        }
    }

    fn files(&self) -> String {
        match self.editor.list_entries(FILES_LIMIT) {
            Ok((names, _)) if names.is_empty() => "📂 Directory is empty".to_string(),
            Ok((names, total)) => {
                let mut text = format!("📂 {}:", self.base_dir().display());
                for name in &names {
                    let _ = write!(text, "\n• {name}");
                }
                if total > names.len() {
                    let _ = write!(text, "\n... and {} more", total - names.len());
                }
                text
            }
            Err(e) => format!("❌ Cannot list files: {e}"),
        }
    }

    fn base_dir(&self) -> PathBuf {
        self.runner.config().base_dir.clone()
    }

    async fn reply(&self, conversation: ConversationId, text: &str) {
        if let Err(e) = self.notifier.deliver(conversation, text).await {
            debug!(conversation, error = %e, "reply not delivered");
        }
    }
}

fn admin_error_text(err: AdminError) -> String {
    match err {
        AdminError::InvalidId(_) => "❌ Invalid user ID. Please send numeric ID only.".to_string(),
        AdminError::CannotRemovePrimary => "❌ Cannot remove the main admin.".to_string(),
        AdminError::NotFound(id) => format!("❌ Admin ID {id} not found in the list."),
        AdminError::Persist { .. } => {
            warn!(error = %err, "admin list not saved");
            "❌ Could not save the admin list.".to_string()
        }
    }
}

fn help_text() -> String {
    [
        "🖥️ Shell relay",
        "",
        "Send any text to run it as a shell command. When a program asks",
        "for input, your next message is typed into it.",
        "",
        "/stop - stop the current process",
        "/status - process and session counts",
        "/sessions - recent activity",
        "/nano <file> - edit a file in the browser",
        "/view <file> - show the start of a file",
        "/files - list the working directory",
        "/clean - forget idle sessions",
        "/admins, /addadmin <id>, /rmadmin <id>, /stopall - main admin only",
    ]
    .join("\n")
}
