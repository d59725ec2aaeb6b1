use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

use super::{ConversationId, MessageRef, SendError, Transport, DEFAULT_TEXT_CHUNK_LIMIT};

pub struct ConsoleTransport {
    out: Mutex<Stdout>,
    chunk_limit: usize,
}

impl ConsoleTransport {
    pub fn new(chunk_limit: Option<usize>) -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
            chunk_limit: chunk_limit.unwrap_or(DEFAULT_TEXT_CHUNK_LIMIT).max(1),
        }
    }

    async fn write_block(&self, block: String) -> Result<(), SendError> {
        let mut out = self.out.lock().await;
        out.write_all(block.as_bytes())
            .await
            .map_err(|err| SendError::Request(format!("stdout write failed: {err}")))?;
        out.flush()
            .await
            .map_err(|err| SendError::Request(format!("stdout flush failed: {err}")))
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    fn channel(&self) -> &'static str {
        "console"
    }

    fn chunk_limit(&self) -> usize {
        self.chunk_limit
    }

    async fn send_text(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> Result<(), SendError> {
        self.write_block(format!("[{conversation}] {text}\n\n")).await
    }

    async fn send_file(
        &self,
        conversation: &ConversationId,
        bytes: Vec<u8>,
        filename: &str,
        caption: Option<&str>,
    ) -> Result<(), SendError> {
        let caption = caption.map(|value| format!(" {value}")).unwrap_or_default();
        self.write_block(format!(
            "[{conversation}] <{filename}: {} bytes>{caption}\n\n",
            bytes.len()
        ))
        .await
    }

    async fn fetch_replied_message(
        &self,
        _conversation: &ConversationId,
        reference: &MessageRef,
    ) -> Option<String> {
        match reference {
            MessageRef::Inline(text) => Some(text.clone()),
            MessageRef::Remote(_) => None,
        }
    }
}
