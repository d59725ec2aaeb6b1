use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Duration, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{ConversationId, MessageRef, SendError, Transport};
use crate::commands::{CommandRouter, InboundMessage};
use crate::config::{normalize_optional_text, DiscordConfig};
use crate::flow::truncate_chars;

const DISCORD_HTTP_TIMEOUT_SECS: u64 = 30;
const GATEWAY_RECONNECT_DELAY_SECS: u64 = 5;
const GATEWAY_HELLO_TIMEOUT_SECS: u64 = 30;
const INTENT_GUILD_MESSAGES: u64 = 1 << 9;
const INTENT_DIRECT_MESSAGES: u64 = 1 << 12;
const INTENT_MESSAGE_CONTENT: u64 = 1 << 15;
pub const GATEWAY_INTENTS: u64 =
    INTENT_GUILD_MESSAGES | INTENT_DIRECT_MESSAGES | INTENT_MESSAGE_CONTENT;
const FATAL_CLOSE_CODES: &[u16] = &[4004, 4010, 4011, 4012, 4013, 4014];

const OP_DISPATCH: u64 = 0;
const OP_HEARTBEAT: u64 = 1;
const OP_IDENTIFY: u64 = 2;
const OP_RECONNECT: u64 = 7;
const OP_INVALID_SESSION: u64 = 9;
const OP_HELLO: u64 = 10;
const OP_HEARTBEAT_ACK: u64 = 11;

#[derive(Debug, Clone)]
pub struct DiscordApi {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl DiscordApi {
    pub fn new(cfg: &DiscordConfig, token: String) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DISCORD_HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|err| format!("failed building discord http client: {err}"))?;
        Ok(Self {
            http,
            base: cfg.api_base.trim_end_matches('/').to_owned(),
            token,
        })
    }

    fn authorization(&self) -> String {
        format!("Bot {}", self.token)
    }

    async fn discord_api_get(&self, path: &str) -> Result<Value, SendError> {
        let response = self
            .http
            .get(format!("{}{path}", self.base))
            .header("Authorization", self.authorization())
            .send()
            .await
            .map_err(|err| SendError::Request(format!("discord GET {path} failed: {err}")))?;
        read_discord_response(path, response).await
    }

    async fn discord_api_json(&self, path: &str, body: &Value) -> Result<Value, SendError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base))
            .header("Authorization", self.authorization())
            .json(body)
            .send()
            .await
            .map_err(|err| SendError::Request(format!("discord POST {path} failed: {err}")))?;
        read_discord_response(path, response).await
    }

    async fn discord_api_multipart(
        &self,
        path: &str,
        payload: &Value,
        file_name: &str,
        mime: &str,
        file_bytes: Vec<u8>,
    ) -> Result<Value, SendError> {
        let part = reqwest::multipart::Part::bytes(file_bytes)
            .file_name(file_name.to_owned())
            .mime_str(mime)
            .map_err(|err| SendError::Request(format!("discord invalid mime `{mime}`: {err}")))?;
        let form = reqwest::multipart::Form::new()
            .text("payload_json", payload.to_string())
            .part("files[0]", part);
        let response = self
            .http
            .post(format!("{}{path}", self.base))
            .header("Authorization", self.authorization())
            .multipart(form)
            .send()
            .await
            .map_err(|err| SendError::Request(format!("discord POST {path} failed: {err}")))?;
        read_discord_response(path, response).await
    }
}

async fn read_discord_response(
    path: &str,
    response: reqwest::Response,
) -> Result<Value, SendError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| SendError::Request(format!("discord {path} body read failed: {err}")))?;
    parse_discord_response(status, &body)
}

fn parse_discord_response(status: StatusCode, body: &str) -> Result<Value, SendError> {
    if !status.is_success() {
        let detail = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|value| {
                value
                    .get("message")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned)
            })
            .unwrap_or_else(|| truncate_chars(body, 256));
        return Err(SendError::Status {
            status: status.as_u16(),
            detail,
        });
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body)
        .map_err(|err| SendError::Rejected(format!("discord returned invalid JSON: {err}")))
}

pub struct DiscordTransport {
    api: Arc<DiscordApi>,
    chunk_limit: usize,
}

impl DiscordTransport {
    pub fn new(api: Arc<DiscordApi>, chunk_limit: usize) -> Self {
        Self {
            api,
            chunk_limit: chunk_limit.max(1),
        }
    }
}

#[async_trait]
impl Transport for DiscordTransport {
    fn channel(&self) -> &'static str {
        "discord"
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
            "content": text,
            "allowed_mentions": {"parse": []},
        });
        self.api
            .discord_api_json(&format!("/channels/{conversation}/messages"), &body)
            .await?;
        Ok(())
    }

    async fn send_file(
        &self,
        conversation: &ConversationId,
        bytes: Vec<u8>,
        filename: &str,
        caption: Option<&str>,
    ) -> Result<(), SendError> {
        let mut payload = json!({
            "attachments": [{"id": 0, "filename": filename}],
            "allowed_mentions": {"parse": []},
        });
        if let Some(caption) = caption.and_then(normalize_optional_text) {
            payload["content"] = Value::String(caption);
        }
        self.api
            .discord_api_multipart(
                &format!("/channels/{conversation}/messages"),
                &payload,
                filename,
                "image/png",
                bytes,
            )
            .await?;
        Ok(())
    }

    async fn fetch_replied_message(
        &self,
        conversation: &ConversationId,
        reference: &MessageRef,
    ) -> Option<String> {
        match reference {
            MessageRef::Inline(text) => Some(text.clone()),
            MessageRef::Remote(message_id) => {
                let path = format!("/channels/{conversation}/messages/{message_id}");
                match self.api.discord_api_get(&path).await {
                    Ok(message) => Some(
                        message
                            .get("content")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                    ),
                    Err(err) => {
                        warn!("discord message lookup {message_id} failed: {err}");
                        None
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Hello { heartbeat_interval_ms: u64 },
    Dispatch { name: String, data: Value },
    HeartbeatRequest,
    HeartbeatAck,
    Reconnect,
    InvalidSession,
    Other(u64),
}

pub fn parse_gateway_frame(text: &str) -> Result<(GatewayEvent, Option<u64>), String> {
    let frame: Value = serde_json::from_str(text)
        .map_err(|err| format!("gateway frame JSON parse failed: {err}"))?;
    let op = frame
        .get("op")
        .and_then(Value::as_u64)
        .ok_or_else(|| "gateway frame missing op".to_owned())?;
    let seq = frame.get("s").and_then(Value::as_u64);
    let event = match op {
        OP_DISPATCH => GatewayEvent::Dispatch {
            name: frame
                .get("t")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            data: frame.get("d").cloned().unwrap_or(Value::Null),
        },
        OP_HEARTBEAT => GatewayEvent::HeartbeatRequest,
        OP_RECONNECT => GatewayEvent::Reconnect,
        OP_INVALID_SESSION => GatewayEvent::InvalidSession,
        OP_HELLO => GatewayEvent::Hello {
            heartbeat_interval_ms: frame
                .pointer("/d/heartbeat_interval")
                .and_then(Value::as_u64)
                .ok_or_else(|| "gateway hello missing heartbeat_interval".to_owned())?,
        },
        OP_HEARTBEAT_ACK => GatewayEvent::HeartbeatAck,
        other => GatewayEvent::Other(other),
    };
    Ok((event, seq))
}

pub fn identify_payload(token: &str) -> Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token,
            "intents": GATEWAY_INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": env!("CARGO_PKG_NAME"),
                "device": env!("CARGO_PKG_NAME"),
            }
        }
    })
}

fn heartbeat_payload(seq: Option<u64>) -> Value {
    json!({ "op": OP_HEARTBEAT, "d": seq })
}

pub fn parse_message_create(data: &Value) -> Option<InboundMessage> {
    if data
        .pointer("/author/bot")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return None;
    }
    let channel_id = data
        .get("channel_id")
        .and_then(Value::as_str)
        .and_then(normalize_optional_text)?;
    let text = data
        .get("content")
        .and_then(Value::as_str)
        .and_then(normalize_optional_text)?;
    let reply_to = match data.get("referenced_message").filter(|value| value.is_object()) {
        Some(referenced) => Some(MessageRef::Inline(
            referenced
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_owned(),
        )),
        None => data
            .pointer("/message_reference/message_id")
            .and_then(Value::as_str)
            .map(|id| MessageRef::Remote(id.to_owned())),
    };
    Some(InboundMessage {
        conversation: ConversationId::new(channel_id),
        text,
        reply_to,
    })
}

enum SessionEnd {
    Reconnect(String),
    Fatal(String),
}

pub struct DiscordBridge {
    token: String,
    gateway_url: String,
    prefix: String,
    transport: Arc<dyn Transport>,
    router: Arc<CommandRouter>,
}

impl DiscordBridge {
    pub fn new(
        cfg: &DiscordConfig,
        token: String,
        transport: Arc<dyn Transport>,
        router: Arc<CommandRouter>,
    ) -> Self {
        Self {
            token,
            gateway_url: cfg.gateway_url.trim().to_owned(),
            prefix: cfg.command_prefix.trim().to_owned(),
            transport,
            router,
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_forever().await;
        })
    }

    async fn run_forever(self: Arc<Self>) {
        info!("discord bridge started (gateway={})", self.gateway_url);
        loop {
            match self.run_session().await {
                Ok(SessionEnd::Reconnect(reason)) => {
                    info!("discord gateway session ended: {reason}; reconnecting");
                }
                Ok(SessionEnd::Fatal(reason)) => {
                    warn!("discord bridge stopped: {reason}");
                    return;
                }
                Err(err) => warn!("discord gateway session failed: {err}"),
            }
            sleep(Duration::from_secs(GATEWAY_RECONNECT_DELAY_SECS)).await;
        }
    }

    async fn run_session(self: &Arc<Self>) -> Result<SessionEnd, String> {
        let (ws, _) = connect_async(self.gateway_url.as_str())
            .await
            .map_err(|err| format!("discord gateway connect failed: {err}"))?;
        let (mut sink, mut stream) = ws.split();

        let hello = tokio::time::timeout(Duration::from_secs(GATEWAY_HELLO_TIMEOUT_SECS), async {
            while let Some(message) = stream.next().await {
                let message =
                    message.map_err(|err| format!("discord gateway read failed: {err}"))?;
                if let Message::Text(text) = message {
                    if let (GatewayEvent::Hello {
                        heartbeat_interval_ms,
                    }, _) = parse_gateway_frame(&text)?
                    {
                        return Ok(heartbeat_interval_ms);
                    }
                }
            }
            Err::<u64, String>("discord gateway closed before hello".to_owned())
        })
        .await
        .map_err(|_| "discord gateway hello timed out".to_owned())??;

        sink.send(Message::Text(identify_payload(&self.token).to_string()))
            .await
            .map_err(|err| format!("discord identify send failed: {err}"))?;

        let period = Duration::from_millis(hello.max(1_000));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        let mut seq: Option<u64> = None;
        let mut awaiting_ack = false;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if awaiting_ack {
                        return Ok(SessionEnd::Reconnect("heartbeat not acknowledged".to_owned()));
                    }
                    sink.send(Message::Text(heartbeat_payload(seq).to_string()))
                        .await
                        .map_err(|err| format!("discord heartbeat send failed: {err}"))?;
                    awaiting_ack = true;
                }
                frame = stream.next() => {
                    let Some(message) = frame else {
                        return Ok(SessionEnd::Reconnect("socket closed".to_owned()));
                    };
                    let message =
                        message.map_err(|err| format!("discord gateway read failed: {err}"))?;
                    let text = match message {
                        Message::Text(text) => text,
                        Message::Ping(payload) => {
                            sink.send(Message::Pong(payload))
                                .await
                                .map_err(|err| format!("discord gateway pong failed: {err}"))?;
                            continue;
                        }
                        Message::Close(frame) => {
                            let (code, reason) = frame
                                .as_ref()
                                .map(|value| (u16::from(value.code), value.reason.to_string()))
                                .unwrap_or((1000, "close".to_owned()));
                            let reason = format!("closed with {code}: {reason}");
                            if FATAL_CLOSE_CODES.contains(&code) {
                                return Ok(SessionEnd::Fatal(reason));
                            }
                            return Ok(SessionEnd::Reconnect(reason));
                        }
                        Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    };
                    let (event, frame_seq) = match parse_gateway_frame(&text) {
                        Ok(value) => value,
                        Err(err) => {
                            debug!("discord gateway frame skipped: {err}");
                            continue;
                        }
                    };
                    if frame_seq.is_some() {
                        seq = frame_seq;
                    }
                    match event {
                        GatewayEvent::Dispatch { name, data } => self.handle_dispatch(&name, data),
                        GatewayEvent::HeartbeatRequest => {
                            sink.send(Message::Text(heartbeat_payload(seq).to_string()))
                                .await
                                .map_err(|err| format!("discord heartbeat send failed: {err}"))?;
                        }
                        GatewayEvent::HeartbeatAck => awaiting_ack = false,
                        GatewayEvent::Reconnect => {
                            return Ok(SessionEnd::Reconnect("server requested reconnect".to_owned()));
                        }
                        GatewayEvent::InvalidSession => {
                            return Ok(SessionEnd::Reconnect("invalid session".to_owned()));
                        }
                        GatewayEvent::Other(op) => debug!("discord gateway op {op} ignored"),
                        GatewayEvent::Hello { .. } => {}
                    }
                }
            }
        }
    }

    fn handle_dispatch(self: &Arc<Self>, name: &str, data: Value) {
        match name {
            "READY" => {
                let username = data
                    .pointer("/user/username")
                    .and_then(Value::as_str)
                    .unwrap_or("<unknown>");
                info!("discord bridge linked as {username}");
            }
            "MESSAGE_CREATE" => {
                let Some(message) = parse_message_create(&data) else {
                    return;
                };
                let bridge = Arc::clone(self);
                tokio::spawn(async move {
                    bridge.handle_message(&message).await;
                });
            }
            _ => {}
        }
    }

    pub async fn handle_message(&self, message: &InboundMessage) -> bool {
        self.router
            .handle(self.transport.as_ref(), message, &self.prefix)
            .await
    }
}
