//! Browser file editor gated by single-use edit tokens.
//!
//! An operator asks for a file, gets a tokenized link, and the page at
//! `/edit/{token}?admin_id={owner}` loads and saves that one file. Unknown
//! or expired tokens, owner mismatches and paths outside the base
//! directory all fail the same way.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Form, Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EditorError;
use crate::registry::OwnerId;

struct EditSession {
    path: PathBuf,
    owner: OwnerId,
    created_at: Instant,
}

pub struct Editor {
    base_dir: PathBuf,
    ttl: Duration,
    sessions: Mutex<HashMap<String, EditSession>>,
}

impl Editor {
    /// `base_dir` is canonicalized once here; every containment check
    /// compares against that form.
    pub fn new(base_dir: &Path, ttl: Duration) -> io::Result<Self> {
        Ok(Self {
            base_dir: base_dir.canonicalize()?,
            ttl,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve `name` under the base directory. The file itself may not
    /// exist yet, but its parent must.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, EditorError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EditorError::Denied);
        }
        let candidate = self.base_dir.join(name);
        let resolved = match candidate.canonicalize() {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let file_name = match candidate.components().next_back() {
                    Some(Component::Normal(n)) => n.to_owned(),
                    _ => return Err(EditorError::Denied),
                };
                let parent = candidate.parent().ok_or(EditorError::Denied)?;
                parent
                    .canonicalize()
                    .map_err(|_| EditorError::Denied)?
                    .join(file_name)
            }
            Err(_) => return Err(EditorError::Denied),
        };
        if resolved == self.base_dir || !resolved.starts_with(&self.base_dir) {
            return Err(EditorError::Denied);
        }
        Ok(resolved)
    }

    /// Create an edit token for `name` on behalf of `owner`, creating an
    /// empty file when none exists.
    pub async fn open_session(&self, name: &str, owner: OwnerId) -> Result<String, EditorError> {
        let path = self.resolve(name)?;
        ensure_regular(&path, true).await?;
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        let token = Uuid::new_v4().to_string();
        self.sessions.lock().await.insert(
            token.clone(),
            EditSession {
                path,
                owner,
                created_at: Instant::now(),
            },
        );
        info!(owner, "edit session opened");
        Ok(token)
    }

    /// Current contents of the token's file. Unreadable or non-UTF-8
    /// files are errors, never an empty form that a save would write back.
    pub async fn load(&self, token: &str, owner: Option<&str>) -> Result<(PathBuf, String), EditorError> {
        let mut sessions = self.sessions.lock().await;
        let path = self.authorize(&mut sessions, token, owner)?;
        ensure_regular(&path, false).await?;
        let bytes = tokio::fs::read(&path).await?;
        let content =
            String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok((path, content))
    }

    /// Replace the file's contents and consume the token. A failed write
    /// keeps the token so the operator can retry.
    pub async fn save(&self, token: &str, owner: Option<&str>, content: &str) -> Result<PathBuf, EditorError> {
        let mut sessions = self.sessions.lock().await;
        let path = self.authorize(&mut sessions, token, owner)?;
        ensure_regular(&path, true).await?;
        tokio::fs::write(&path, content).await?;
        sessions.remove(token);
        info!(bytes = content.len(), "file saved from editor");
        Ok(path)
    }

    /// Drop sessions older than the TTL.
    pub async fn purge_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.created_at.elapsed() <= self.ttl);
        before - sessions.len()
    }

    /// First `max_chars` characters of a regular file under the base
    /// directory. Reads at most four bytes per character.
    pub async fn preview(&self, name: &str, max_chars: usize) -> Result<String, EditorError> {
        let path = self.resolve(name)?;
        ensure_regular(&path, false).await?;
        let file = tokio::fs::File::open(&path).await?;
        let mut bytes = Vec::new();
        file.take(max_chars as u64 * 4).read_to_end(&mut bytes).await?;
        Ok(String::from_utf8_lossy(&bytes).chars().take(max_chars).collect())
    }

    /// Up to `limit` entry names in the base directory, sorted, plus the
    /// total entry count.
    pub fn list_entries(&self, limit: usize) -> io::Result<(Vec<String>, usize)> {
        let mut names: Vec<String> = fs::read_dir(&self.base_dir)?
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        let total = names.len();
        names.truncate(limit);
        Ok((names, total))
    }

    fn authorize(
        &self,
        sessions: &mut HashMap<String, EditSession>,
        token: &str,
        owner: Option<&str>,
    ) -> Result<PathBuf, EditorError> {
        let session = sessions.get(token).ok_or(EditorError::Denied)?;
        if session.created_at.elapsed() > self.ttl {
            sessions.remove(token);
            return Err(EditorError::Denied);
        }
        let claimed: Option<OwnerId> = owner.and_then(|o| o.trim().parse().ok());
        if claimed != Some(session.owner) {
            return Err(EditorError::Denied);
        }
        // The file may have been swapped for a symlink since the token was issued.
        let path = match session.path.canonicalize() {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => session.path.clone(),
            Err(_) => return Err(EditorError::Denied),
        };
        if !path.starts_with(&self.base_dir) {
            return Err(EditorError::Denied);
        }
        Ok(path)
    }

    fn display_name<'a>(&self, path: &'a Path) -> std::borrow::Cow<'a, str> {
        path.strip_prefix(&self.base_dir)
            .unwrap_or(path)
            .to_string_lossy()
    }
}

/// Stat without opening: a FIFO or device would block the reader.
async fn ensure_regular(path: &Path, allow_missing: bool) -> Result<(), EditorError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(EditorError::Denied),
        Err(e) if allow_missing && e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ── HTTP surface ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct OwnerQuery {
    admin_id: Option<String>,
}

#[derive(Deserialize)]
struct SaveForm {
    #[serde(default)]
    code: String,
}

pub fn router(editor: Arc<Editor>) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/edit/:token", get(edit_page).post(save_page))
        .with_state(editor)
}

async fn home() -> &'static str {
    "relay-shell-host is running\n"
}

async fn edit_page(
    State(editor): State<Arc<Editor>>,
    UrlPath(token): UrlPath<String>,
    Query(query): Query<OwnerQuery>,
) -> Response {
    match editor.load(&token, query.admin_id.as_deref()).await {
        Ok((path, content)) => Html(render_editor(&editor.display_name(&path), &content)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn save_page(
    State(editor): State<Arc<Editor>>,
    UrlPath(token): UrlPath<String>,
    Query(query): Query<OwnerQuery>,
    Form(form): Form<SaveForm>,
) -> Response {
    match editor.save(&token, query.admin_id.as_deref(), &form.code).await {
        Ok(_) => Html(page("Saved", "<h2>File saved.</h2><p>You can close this window.</p>")).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(err: EditorError) -> Response {
    match err {
        EditorError::Denied => (
            StatusCode::FORBIDDEN,
            Html(page("Denied", "<h2>Invalid or expired session</h2>")),
        )
            .into_response(),
        EditorError::Io(e) => {
            warn!(error = %e, "editor I/O failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(page("Error", "<h2>Could not access the file</h2>")),
            )
                .into_response()
        }
    }
}

fn render_editor(name: &str, content: &str) -> String {
    let body = format!(
        "<h3>{}</h3>\n<form method=\"post\">\n<textarea name=\"code\" rows=\"30\" cols=\"100\" spellcheck=\"false\">{}</textarea>\n<p><button type=\"submit\">Save</button></p>\n</form>",
        escape_html(name),
        escape_html(content)
    );
    page(name, &body)
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{}</title></head>\n<body>\n{}\n</body></html>\n",
        escape_html(title),
        body
    )
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
