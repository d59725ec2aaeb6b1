//! In-memory collaborators shared by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::channels::{ConversationId, MessageRef, SendError, Transport};
use crate::flow::{FlowEngine, ImageFetcher, InvocationError};

pub struct ScriptedFlow {
    replies: Mutex<VecDeque<Result<Value, InvocationError>>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedFlow {
    pub fn new(replies: Vec<Result<Value, InvocationError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl FlowEngine for ScriptedFlow {
    async fn invoke(&self, prompt: &str) -> Result<Value, InvocationError> {
        self.prompts.lock().await.push(prompt.to_owned());
        self.replies
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(json!({"outputs": []})))
    }
}

pub struct StaticImages(pub Result<Vec<u8>, InvocationError>);

#[async_trait]
impl ImageFetcher for StaticImages {
    async fn fetch_image(&self, _url: &str) -> Result<Vec<u8>, InvocationError> {
        self.0.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFile {
    pub conversation: ConversationId,
    pub filename: String,
    pub size: usize,
    pub caption: Option<String>,
}

#[derive(Default)]
pub struct RecordingTransport {
    pub limit: usize,
    pub fail_texts: HashSet<String>,
    pub remote_messages: HashMap<String, String>,
    pub texts: Mutex<Vec<(ConversationId, String)>>,
    pub files: Mutex<Vec<SentFile>>,
}

impl RecordingTransport {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub async fn sent_texts(&self) -> Vec<String> {
        self.texts
            .lock()
            .await
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn channel(&self) -> &'static str {
        "test"
    }

    fn chunk_limit(&self) -> usize {
        self.limit
    }

    async fn send_text(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> Result<(), SendError> {
        if self.fail_texts.contains(text) {
            return Err(SendError::Rejected(format!("refused `{text}`")));
        }
        self.texts
            .lock()
            .await
            .push((conversation.clone(), text.to_owned()));
        Ok(())
    }

    async fn send_file(
        &self,
        conversation: &ConversationId,
        bytes: Vec<u8>,
        filename: &str,
        caption: Option<&str>,
    ) -> Result<(), SendError> {
        self.files.lock().await.push(SentFile {
            conversation: conversation.clone(),
            filename: filename.to_owned(),
            size: bytes.len(),
            caption: caption.map(ToOwned::to_owned),
        });
        Ok(())
    }

    async fn fetch_replied_message(
        &self,
        _conversation: &ConversationId,
        reference: &MessageRef,
    ) -> Option<String> {
        match reference {
            MessageRef::Inline(text) => Some(text.clone()),
            MessageRef::Remote(id) => self.remote_messages.get(id).cloned(),
        }
    }
}

pub fn text_payload(texts: &[&str]) -> Value {
    let blocks: Vec<Value> = texts
        .iter()
        .map(|text| json!({"outputs": [{"results": {"message": {"text": text}}}]}))
        .collect();
    json!({ "outputs": blocks })
}
