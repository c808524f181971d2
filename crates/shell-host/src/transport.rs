//! Line-delimited JSON inbound channel.
//!
//! Each line is one operator message, `{"owner":1,"conversation":2,"text":"ls"}`.
//! Messages are handled in arrival order; replies and process output leave
//! through the notifier, not through this module.

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::registry::{ConversationId, OwnerId};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Inbound {
    pub owner: OwnerId,
    pub conversation: ConversationId,
    pub text: String,
}

/// Parse one line. Blank lines yield `None`.
pub fn parse_line(line: &[u8]) -> Result<Option<Inbound>, serde_json::Error> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(line).map(Some)
}

/// Feed every message from `reader` to the dispatcher until EOF. Lines
/// that are not valid JSON (or not valid UTF-8) are logged and skipped;
/// only a read failure ends the stream early.
pub async fn run<R>(reader: R, dispatcher: &Dispatcher) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut handled = 0;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        match parse_line(&line) {
            Ok(Some(msg)) => {
                debug!(owner = msg.owner, conversation = msg.conversation, "inbound message");
                dispatcher.handle(msg.owner, msg.conversation, &msg.text).await;
                handled += 1;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, bytes = line.len(), "skipping malformed inbound line"),
        }
    }
    info!(handled, "inbound stream closed");
    Ok(handled)
}
