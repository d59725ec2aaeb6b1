pub mod console;
pub mod discord;
pub mod telegram;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub const TELEGRAM_TEXT_CHUNK_LIMIT: usize = 4_096;
pub const DISCORD_TEXT_CHUNK_LIMIT: usize = 2_000;
pub const DEFAULT_TEXT_CHUNK_LIMIT: usize = TELEGRAM_TEXT_CHUNK_LIMIT;
pub const SUPPORTED_CHANNELS: &[&str] = &["telegram", "discord"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for ConversationId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageRef {
    Inline(String),
    Remote(String),
}

#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("platform returned status {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("platform rejected message: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn channel(&self) -> &'static str;

    fn chunk_limit(&self) -> usize;

    async fn send_text(&self, conversation: &ConversationId, text: &str)
        -> Result<(), SendError>;

    async fn send_file(
        &self,
        conversation: &ConversationId,
        bytes: Vec<u8>,
        filename: &str,
        caption: Option<&str>,
    ) -> Result<(), SendError>;

    async fn fetch_replied_message(
        &self,
        conversation: &ConversationId,
        reference: &MessageRef,
    ) -> Option<String>;
}

pub fn normalize_channel_id(raw: Option<&str>) -> Option<String> {
    let value = raw?.trim().to_ascii_lowercase();
    if value.is_empty() {
        return None;
    }
    let normalized = match value.as_str() {
        "tg" => "telegram",
        "dc" => "discord",
        _ => value.as_str(),
    };
    Some(normalized.to_owned())
}

pub fn default_text_chunk_limit(channel: Option<&str>) -> usize {
    match normalize_channel_id(channel).as_deref() {
        Some("discord") => DISCORD_TEXT_CHUNK_LIMIT,
        _ => DEFAULT_TEXT_CHUNK_LIMIT,
    }
}

/// Splits `text` on line boundaries into chunks of at most `max_chars` characters.
/// Lines are never broken, so a single line longer than `max_chars` becomes its own
/// oversized chunk.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut buffer = String::new();
    let mut buffer_chars = 0usize;

    for line in normalized.split('\n') {
        let line_chars = line.chars().count();
        if buffer_chars > 0 && buffer_chars + 1 + line_chars > max_chars {
            push_chunk(&mut chunks, &buffer);
            buffer.clear();
            buffer_chars = 0;
        }
        if buffer_chars == 0 {
            if line.trim().is_empty() {
                continue;
            }
            buffer.push_str(line);
            buffer_chars = line_chars;
        } else {
            buffer.push('\n');
            buffer.push_str(line);
            buffer_chars += 1 + line_chars;
        }
    }
    push_chunk(&mut chunks, &buffer);

    chunks
}

fn push_chunk(chunks: &mut Vec<String>, buffer: &str) {
    let chunk = buffer.trim_end();
    if !chunk.is_empty() {
        chunks.push(chunk.to_owned());
    }
}
