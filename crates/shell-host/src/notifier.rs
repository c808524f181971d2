//! Outbound delivery of process output and replies to a conversation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use crate::error::NotifyError;
use crate::registry::ConversationId;

/// Sink for text destined to a conversation.
///
/// Delivery is best-effort. Callers log failures and carry on; nothing in
/// the runner retries or aborts because a delivery failed.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, conversation: ConversationId, text: &str) -> Result<(), NotifyError>;
}

/// One outbound message, as written on the wire by [`JsonLinesNotifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub conversation: ConversationId,
    pub text: String,
}

/// Forwards deliveries into an in-process channel.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn deliver(&self, conversation: ConversationId, text: &str) -> Result<(), NotifyError> {
        self.tx
            .send(Delivery {
                conversation,
                text: text.to_string(),
            })
            .map_err(|_| NotifyError::Closed)
    }
}

/// Writes each delivery as one JSON object per line.
pub struct JsonLinesNotifier<W> {
    out: Mutex<W>,
}

impl<W> JsonLinesNotifier<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W> Notifier for JsonLinesNotifier<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn deliver(&self, conversation: ConversationId, text: &str) -> Result<(), NotifyError> {
        let mut line = serde_json::to_vec(&Delivery {
            conversation,
            text: text.to_string(),
        })?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }
}
