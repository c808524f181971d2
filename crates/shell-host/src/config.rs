//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::registry::OwnerId;

pub const DEFAULT_DISPLAY_LIMIT: usize = 2000;
pub const DEFAULT_READ_CHUNK: usize = 1024;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_STOP_GRACE_MS: u64 = 500;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "relay-shell-host",
    version,
    about = "Run operator shell commands in PTYs and relay their output"
)]
pub struct Config {
    /// Operator who is always an admin and alone may manage admins.
    #[arg(long, env = "MAIN_ADMIN_ID")]
    pub primary_admin: OwnerId,

    /// Working directory for commands and root for the file editor.
    #[arg(long, env = "RELAY_BASE_DIR")]
    pub base_dir: Option<PathBuf>,

    /// JSON document holding the admin list.
    #[arg(long, env = "RELAY_DATA_FILE", default_value = "bot_data.json")]
    pub data_file: PathBuf,

    #[arg(long, env = "RELAY_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, env = "PORT", default_value_t = 9090)]
    pub port: u16,

    /// Base URL operators use to reach the editor; defaults to the bind address.
    #[arg(long, env = "RELAY_PUBLIC_URL")]
    pub public_url: Option<String>,

    #[arg(long, env = "RELAY_SHELL", default_value = "bash")]
    pub shell: String,

    /// Characters per delivered output chunk before truncation.
    #[arg(long, default_value_t = DEFAULT_DISPLAY_LIMIT)]
    pub display_limit: usize,

    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,

    #[arg(long, default_value_t = DEFAULT_READ_CHUNK)]
    pub read_chunk: usize,

    #[arg(long, default_value_t = DEFAULT_STOP_GRACE_MS)]
    pub stop_grace_ms: u64,

    #[arg(long, default_value_t = 3600)]
    pub edit_ttl_secs: u64,

    /// Activity entries idle longer than this are dropped by `/clean` and the sweeper.
    #[arg(long, default_value_t = 3600)]
    pub idle_session_secs: u64,

    #[arg(long, default_value_t = 300)]
    pub cleanup_interval_secs: u64,
}

impl Config {
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind, self.port).parse()
    }

    pub fn public_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.bind, self.port),
        }
    }

    pub fn runner_config(&self, base_dir: PathBuf) -> RunnerConfig {
        RunnerConfig {
            base_dir,
            shell: self.shell.clone(),
            display_limit: self.display_limit,
            read_chunk: self.read_chunk.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
        }
    }

    pub fn edit_ttl(&self) -> Duration {
        Duration::from_secs(self.edit_ttl_secs)
    }

    pub fn idle_session_age(&self) -> Duration {
        Duration::from_secs(self.idle_session_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Settings the PTY runner needs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub base_dir: PathBuf,
    pub shell: String,
    pub display_limit: usize,
    pub read_chunk: usize,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            shell: "bash".to_string(),
            display_limit: DEFAULT_DISPLAY_LIMIT,
            read_chunk: DEFAULT_READ_CHUNK,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
        }
    }
}
