//! relay-shell-host: reads operator messages as JSON lines on stdin,
//! runs their commands in PTYs, and writes deliveries as JSON lines on
//! stdout. The browser editor listens on `--bind`:`--port`.

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relay_shell_host::admin::AdminStore;
use relay_shell_host::config::Config;
use relay_shell_host::dispatcher::{Dispatcher, DispatcherSettings};
use relay_shell_host::editor::{self, Editor};
use relay_shell_host::notifier::{JsonLinesNotifier, Notifier};
use relay_shell_host::registry::SessionRegistry;
use relay_shell_host::runner::ProcessRunner;
use relay_shell_host::transport;

fn fatal(what: &str, err: impl std::fmt::Display) -> ! {
    error!(error = %err, "{what}");
    process::exit(1);
}

#[tokio::main]
async fn main() {
    let config = Config::parse();

    // stdout carries deliveries, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let base_dir = match config.base_dir.clone().map_or_else(env::current_dir, Ok) {
        Ok(dir) => dir,
        Err(e) => fatal("cannot determine working directory", e),
    };
    let base_dir: PathBuf = match base_dir.canonicalize() {
        Ok(dir) if dir.is_dir() => dir,
        Ok(dir) => fatal("base directory is not a directory", dir.display()),
        Err(e) => fatal("base directory is not accessible", e),
    };
    let listen_addr = match config.listen_addr() {
        Ok(addr) => addr,
        Err(e) => fatal("invalid listen address", e),
    };

    let admins = Arc::new(AdminStore::load(&config.data_file, config.primary_admin));
    let registry = Arc::new(SessionRegistry::new());
    let notifier: Arc<dyn Notifier> = Arc::new(JsonLinesNotifier::new(tokio::io::stdout()));
    let runner = Arc::new(ProcessRunner::new(
        config.runner_config(base_dir.clone()),
        Arc::clone(&registry),
        Arc::clone(&notifier),
    ));
    let editor = match Editor::new(&base_dir, config.edit_ttl()) {
        Ok(editor) => Arc::new(editor),
        Err(e) => fatal("cannot open base directory for editing", e),
    };
    let dispatcher = Dispatcher::new(
        Arc::clone(&runner),
        Arc::clone(&admins),
        Arc::clone(&editor),
        notifier,
        DispatcherSettings {
            public_url: config.public_url(),
            idle_session_age: config.idle_session_age(),
        },
    );

    let listener = match TcpListener::bind(listen_addr).await {
        Ok(l) => l,
        Err(e) => fatal("failed to bind editor listener", e),
    };
    info!(
        addr = %listen_addr,
        base_dir = %base_dir.display(),
        admins = admins.list().await.len(),
        "relay-shell-host started"
    );
    let app = editor::router(Arc::clone(&editor));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "editor server stopped");
        }
    });

    // ── Stale-session sweeper ───────────────────────────────────────
    let sweep_registry = Arc::clone(&registry);
    let sweep_editor = Arc::clone(&editor);
    let idle_age = config.idle_session_age();
    let mut sweep = time::interval(config.cleanup_interval());
    tokio::spawn(async move {
        sweep.tick().await;
        loop {
            sweep.tick().await;
            let sessions = sweep_registry.prune_idle(idle_age).await;
            let edits = sweep_editor.purge_expired().await;
            if sessions > 0 || edits > 0 {
                info!(sessions, edits, "pruned stale sessions");
            }
        }
    });

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => fatal("failed to install SIGTERM handler", e),
    };

    tokio::select! {
        result = transport::run(tokio::io::stdin(), &dispatcher) => {
            if let Err(e) = result {
                warn!(error = %e, "inbound stream failed");
            }
        }
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
    }

    let tracked = registry.process_count().await;
    runner.shutdown().await;
    info!(killed = tracked, "shut down");
    // A blocked stdin read would otherwise hold the runtime open.
    process::exit(0);
}
