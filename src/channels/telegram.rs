use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use super::{ConversationId, MessageRef, SendError, Transport};
use crate::commands::{CommandRouter, InboundMessage};
use crate::config::{normalize_optional_text, TelegramConfig};
use crate::flow::truncate_chars;

const TELEGRAM_HTTP_TIMEOUT_MARGIN_SECS: u64 = 10;
const BRIDGE_RETRY_DELAY_SECS: u64 = 2;
const TELEGRAM_CAPTION_MAX_CHARS: usize = 1_024;
const TELEGRAM_COMMAND_PREFIX: &str = "/";

#[derive(Debug, Clone)]
pub struct TelegramApi {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl TelegramApi {
    pub fn new(cfg: &TelegramConfig, token: String) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(
                cfg.poll_timeout_secs + TELEGRAM_HTTP_TIMEOUT_MARGIN_SECS,
            ))
            .build()
            .map_err(|err| format!("failed building telegram http client: {err}"))?;
        Ok(Self {
            http,
            base: cfg.api_base.trim_end_matches('/').to_owned(),
            token,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base, self.token)
    }

    async fn telegram_api(
        &self,
        method: &str,
        query: &[(&str, String)],
    ) -> Result<Value, SendError> {
        let response = self
            .http
            .get(self.method_url(method))
            .query(query)
            .send()
            .await
            .map_err(|err| request_failed(method, err))?;
        read_telegram_response(method, response).await
    }

    async fn telegram_api_json(&self, method: &str, body: &Value) -> Result<Value, SendError> {
        let response = self
            .http
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .map_err(|err| request_failed(method, err))?;
        read_telegram_response(method, response).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn telegram_api_multipart(
        &self,
        method: &str,
        fields: &[(&str, String)],
        file_field: &str,
        file_name: &str,
        mime: &str,
        file_bytes: Vec<u8>,
    ) -> Result<Value, SendError> {
        let mut form = reqwest::multipart::Form::new();
        for (key, value) in fields {
            form = form.text((*key).to_owned(), value.clone());
        }
        let part = reqwest::multipart::Part::bytes(file_bytes)
            .file_name(file_name.to_owned())
            .mime_str(mime)
            .map_err(|err| request_failed(method, err))?;
        form = form.part(file_field.to_owned(), part);
        let response = self
            .http
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|err| request_failed(method, err))?;
        read_telegram_response(method, response).await
    }

    async fn poll_updates(&self, offset: u64, timeout_secs: u64) -> Result<Vec<Value>, String> {
        let mut query = vec![
            ("timeout", timeout_secs.to_string()),
            ("allowed_updates", "[\"message\"]".to_owned()),
        ];
        if offset > 0 {
            query.push(("offset", offset.to_string()));
        }
        let result = self
            .telegram_api("getUpdates", &query)
            .await
            .map_err(|err| err.to_string())?;
        result
            .as_array()
            .cloned()
            .ok_or_else(|| "telegram getUpdates result must be an array".to_owned())
    }
}

fn request_failed(method: &str, err: reqwest::Error) -> SendError {
    SendError::Request(format!("telegram {method} request failed: {err}"))
}

async fn read_telegram_response(
    method: &str,
    response: reqwest::Response,
) -> Result<Value, SendError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| SendError::Request(format!("telegram {method} body read failed: {err}")))?;
    parse_telegram_response(method, status, &body)
}

fn parse_telegram_response(
    method: &str,
    status: StatusCode,
    body: &str,
) -> Result<Value, SendError> {
    let payload: Option<Value> = serde_json::from_str(body).ok();
    let description = payload
        .as_ref()
        .and_then(|value| value.get("description"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);
    if !status.is_success() {
        return Err(SendError::Status {
            status: status.as_u16(),
            detail: description.unwrap_or_else(|| truncate_chars(body, 256)),
        });
    }
    let payload = payload
        .ok_or_else(|| SendError::Rejected(format!("telegram {method} returned invalid JSON")))?;
    if !payload.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        return Err(SendError::Rejected(format!(
            "telegram {method} failed: {}",
            description.as_deref().unwrap_or("telegram API returned ok=false")
        )));
    }
    Ok(payload.get("result").cloned().unwrap_or(Value::Null))
}

pub struct TelegramTransport {
    api: Arc<TelegramApi>,
    chunk_limit: usize,
}

impl TelegramTransport {
    pub fn new(api: Arc<TelegramApi>, chunk_limit: usize) -> Self {
        Self {
            api,
            chunk_limit: chunk_limit.max(1),
        }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn channel(&self) -> &'static str {
        "telegram"
    }

    fn chunk_limit(&self) -> usize {
        self.chunk_limit
    }

    async fn send_text(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> Result<(), SendError> {
        let body = json!({
            "chat_id": conversation.as_str(),
            "text": text,
            "disable_web_page_preview": true,
        });
        self.api.telegram_api_json("sendMessage", &body).await?;
        Ok(())
    }

    async fn send_file(
        &self,
        conversation: &ConversationId,
        bytes: Vec<u8>,
        filename: &str,
        caption: Option<&str>,
    ) -> Result<(), SendError> {
        let mut fields = vec![("chat_id", conversation.to_string())];
        if let Some(caption) = caption.and_then(normalize_optional_text) {
            fields.push(("caption", truncate_chars(&caption, TELEGRAM_CAPTION_MAX_CHARS)));
        }
        self.api
            .telegram_api_multipart("sendPhoto", &fields, "photo", filename, "image/png", bytes)
            .await?;
        Ok(())
    }

    async fn fetch_replied_message(
        &self,
        _conversation: &ConversationId,
        reference: &MessageRef,
    ) -> Option<String> {
        // Bot API has no message lookup; updates carry the replied message inline.
        match reference {
            MessageRef::Inline(text) => Some(text.clone()),
            MessageRef::Remote(_) => None,
        }
    }
}

pub struct TelegramBridge {
    api: Arc<TelegramApi>,
    transport: Arc<dyn Transport>,
    router: Arc<CommandRouter>,
    poll_timeout_secs: u64,
}

impl TelegramBridge {
    pub fn new(
        api: Arc<TelegramApi>,
        transport: Arc<dyn Transport>,
        router: Arc<CommandRouter>,
        poll_timeout_secs: u64,
    ) -> Self {
        Self {
            api,
            transport,
            router,
            poll_timeout_secs: poll_timeout_secs.max(1),
        }
    }

    pub fn token(&self) -> &str {
        self.api.token()
    }

    pub fn spawn_polling(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_forever().await;
        })
    }

    async fn run_forever(self: Arc<Self>) {
        match self.api.telegram_api("getMe", &[]).await {
            Ok(me) => {
                let bot_id = me.get("id").and_then(Value::as_i64).unwrap_or_default();
                let username = me
                    .get("username")
                    .and_then(Value::as_str)
                    .unwrap_or("<unknown>");
                info!("telegram bridge linked bot_id={bot_id} username={username}");
            }
            Err(err) => warn!("telegram bridge getMe failed: {err}"),
        }
        if let Err(err) = self
            .api
            .telegram_api_json("deleteWebhook", &json!({"drop_pending_updates": false}))
            .await
        {
            warn!("telegram bridge deleteWebhook failed: {err}");
        }

        let mut offset = 0u64;
        info!(
            "telegram bridge polling (timeout={}s)",
            self.poll_timeout_secs
        );
        loop {
            let updates = match self.api.poll_updates(offset, self.poll_timeout_secs).await {
                Ok(value) => value,
                Err(err) => {
                    warn!("telegram bridge getUpdates failed: {err}");
                    sleep(Duration::from_secs(BRIDGE_RETRY_DELAY_SECS)).await;
                    continue;
                }
            };
            for update in updates {
                let Some(update_id) = update.get("update_id").and_then(Value::as_u64) else {
                    continue;
                };
                if update_id >= offset {
                    offset = update_id.saturating_add(1);
                }
                self.dispatch(update);
            }
        }
    }

    pub fn dispatch(self: &Arc<Self>, update: Value) {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            bridge.handle_update(&update).await;
        });
    }

    pub async fn handle_update(&self, update: &Value) -> bool {
        let Some(message) = parse_update(update) else {
            let update_id = update
                .get("update_id")
                .and_then(Value::as_u64)
                .unwrap_or_default();
            debug!("telegram update {update_id} skipped");
            return false;
        };
        self.router
            .handle(self.transport.as_ref(), &message, TELEGRAM_COMMAND_PREFIX)
            .await
    }
}

fn extract_message_text(message: &Value) -> Option<String> {
    message
        .get("text")
        .and_then(Value::as_str)
        .and_then(normalize_optional_text)
        .or_else(|| {
            message
                .get("caption")
                .and_then(Value::as_str)
                .and_then(normalize_optional_text)
        })
}

pub fn parse_update(update: &Value) -> Option<InboundMessage> {
    let message = update.get("message").filter(|value| value.is_object())?;
    if message
        .pointer("/from/is_bot")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return None;
    }
    let chat_id = message.pointer("/chat/id").and_then(Value::as_i64)?;
    let text = extract_message_text(message)?;
    let reply_to = message
        .get("reply_to_message")
        .and_then(extract_message_text)
        .map(MessageRef::Inline);
    Some(InboundMessage {
        conversation: ConversationId::from(chat_id),
        text,
        reply_to,
    })
}
