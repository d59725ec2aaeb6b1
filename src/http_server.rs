use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channels::telegram::TelegramBridge;
use crate::commands::count_message;
use crate::delivery::DeliveryCoordinator;
use crate::scheduler::DailyJob;

const CONTROL_HTTP_MAX_REQUEST_BYTES: usize = 1024 * 1024;
const CONTROL_HTTP_READ_CHUNK_BYTES: usize = 4096;
const WEBHOOK_PATH_PREFIX: &str = "/webhook/";

pub struct ControlState {
    pub coordinator: Arc<DeliveryCoordinator>,
    pub daily_job: Option<DailyJob>,
    pub telegram: Option<Arc<TelegramBridge>>,
}

#[derive(Debug)]
struct ControlHttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
struct ControlHttpResponse {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl ControlHttpResponse {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into().into_bytes(),
        }
    }

    fn json(status: u16, payload: &Value) -> Self {
        Self {
            status,
            content_type: "application/json; charset=utf-8",
            body: payload.to_string().into_bytes(),
        }
    }
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("control-http bind failed on {addr}"))
}

pub fn spawn(listener: TcpListener, state: Arc<ControlState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bound = listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_owned());
        info!("control-http listening on http://{bound}");
        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_control_http_connection(stream, state).await {
                            warn!("control-http connection {remote_addr} failed: {err}");
                        }
                    });
                }
                Err(err) => {
                    warn!("control-http accept failed: {err}");
                }
            }
        }
    })
}

async fn handle_control_http_connection(
    mut stream: TcpStream,
    state: Arc<ControlState>,
) -> Result<()> {
    let Some(request) = read_control_http_request(&mut stream).await? else {
        return Ok(());
    };
    debug!("control-http {} {}", request.method, request.path);
    let response = route(&state, &request).await;
    write_http_response(
        &mut stream,
        response.status,
        response.content_type,
        &response.body,
    )
    .await
}

async fn route(state: &ControlState, request: &ControlHttpRequest) -> ControlHttpResponse {
    if let Some(token) = request.path.strip_prefix(WEBHOOK_PATH_PREFIX) {
        if request.method != "POST" {
            return method_not_allowed(&request.method);
        }
        return telegram_webhook(state, token, &request.body);
    }

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => ControlHttpResponse::text(200, "✅ Bot is running!"),
        ("GET", "/health") => ControlHttpResponse::json(
            200,
            &json!({
                "ok": true,
                "service": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "invocations": state.coordinator.state().invocations.read(),
                "pendingSuggestions": state.coordinator.state().suggestions.len().await,
            }),
        ),
        ("GET", "/count") => ControlHttpResponse::text(
            200,
            count_message(state.coordinator.state().invocations.read()),
        ),
        ("GET", "/schedule") => {
            let Some(job) = state.daily_job.as_ref() else {
                return ControlHttpResponse::json(
                    409,
                    &json!({"ok": false, "error": "schedule_destination_missing"}),
                );
            };
            let report = job.run_now().await;
            info!(
                "manual schedule run for {} delivered {} chunk(s)",
                job.destination(),
                report.chunks_sent
            );
            ControlHttpResponse::text(200, "✅ Đã kích hoạt gửi câu hỏi thủ công")
        }
        ("GET", _) | ("POST", _) => ControlHttpResponse::json(
            404,
            &json!({"ok": false, "error": "not_found", "path": request.path}),
        ),
        (method, _) => method_not_allowed(method),
    }
}

fn telegram_webhook(state: &ControlState, token: &str, body: &[u8]) -> ControlHttpResponse {
    let Some(bridge) = state
        .telegram
        .as_ref()
        .filter(|bridge| !token.is_empty() && bridge.token() == token)
    else {
        return ControlHttpResponse::json(404, &json!({"ok": false, "error": "not_found"}));
    };
    match serde_json::from_slice::<Value>(body) {
        Ok(update) => {
            bridge.dispatch(update);
            ControlHttpResponse::text(200, "ok")
        }
        Err(err) => ControlHttpResponse::json(
            400,
            &json!({"ok": false, "error": format!("invalid update JSON: {err}")}),
        ),
    }
}

fn method_not_allowed(method: &str) -> ControlHttpResponse {
    ControlHttpResponse::json(
        405,
        &json!({"ok": false, "error": "method_not_allowed", "method": method}),
    )
}

fn find_http_header_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(idx) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
        return Some((idx, 4));
    }
    buf.windows(2)
        .position(|window| window == b"\n\n")
        .map(|idx| (idx, 2))
}

fn parse_http_content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    })
}

async fn read_control_http_request(stream: &mut TcpStream) -> Result<Option<ControlHttpRequest>> {
    let mut buffer = Vec::with_capacity(8 * 1024);
    let mut chunk = vec![0_u8; CONTROL_HTTP_READ_CHUNK_BYTES];
    let mut header_info: Option<(usize, usize, usize)> = None;

    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .context("failed reading control-http request bytes")?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > CONTROL_HTTP_MAX_REQUEST_BYTES {
            anyhow::bail!("control-http request exceeds max size");
        }

        if header_info.is_none() {
            if let Some((header_end, separator_len)) = find_http_header_terminator(&buffer) {
                let headers = String::from_utf8_lossy(&buffer[..header_end]);
                let content_length = parse_http_content_length(&headers).unwrap_or(0);
                header_info = Some((header_end, separator_len, content_length));
            }
        }

        if let Some((header_end, separator_len, content_length)) = header_info {
            if buffer.len() >= header_end + separator_len + content_length {
                break;
            }
        }
    }

    if buffer.is_empty() {
        return Ok(None);
    }
    parse_control_http_request(&buffer).map(Some)
}

fn parse_control_http_request(buffer: &[u8]) -> Result<ControlHttpRequest> {
    let (header_end, separator_len) = find_http_header_terminator(buffer).ok_or_else(|| {
        anyhow::anyhow!("invalid control-http request: missing header terminator")
    })?;
    let headers = String::from_utf8_lossy(&buffer[..header_end]);
    let request_line = headers.lines().next().unwrap_or_default();
    let mut segments = request_line.split_whitespace();
    let method = segments
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_uppercase();
    if method.is_empty() {
        anyhow::bail!("invalid control-http request line");
    }
    let path_raw = segments.next().unwrap_or("/").trim();
    let path = path_raw
        .split('?')
        .next()
        .unwrap_or(path_raw)
        .trim()
        .to_owned();
    let content_length = parse_http_content_length(&headers).unwrap_or(0);
    let body_start = header_end + separator_len;
    if buffer.len() < body_start + content_length {
        anyhow::bail!("truncated control-http request body");
    }
    let body = buffer[body_start..body_start + content_length].to_vec();
    Ok(ControlHttpRequest { method, path, body })
}

async fn write_http_response(
    stream: &mut TcpStream,
    status_code: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_text = match status_code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {status_code} {status_text}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\nCache-Control: no-store\r\n\r\n",
        body.len()
    );
    stream
        .write_all(head.as_bytes())
        .await
        .context("failed writing control-http headers")?;
    stream
        .write_all(body)
        .await
        .context("failed writing control-http body")?;
    let _ = stream.shutdown().await;
    Ok(())
}
