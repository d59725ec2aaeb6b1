use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::channels::{
    normalize_channel_id, DISCORD_TEXT_CHUNK_LIMIT, SUPPORTED_CHANNELS, TELEGRAM_TEXT_CHUNK_LIMIT,
};
use crate::flow::payload::DEFAULT_NO_CONTENT_TEXT;
use crate::scheduler::DailyTrigger;
use crate::state::DEFAULT_SUGGESTION_MARKER;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub chart_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_flow_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_flow_input_type")]
    pub input_type: String,
    #[serde(default = "default_flow_output_type")]
    pub output_type: String,
    #[serde(default = "default_flow_input_component")]
    pub input_component: String,
    #[serde(default = "default_chart_input_component")]
    pub chart_input_component: String,
    #[serde(default)]
    pub tweaks: Map<String, Value>,
    #[serde(default)]
    pub chart_tweaks: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct FlowTarget {
    pub url: String,
    pub input_component: String,
    pub tweaks: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelegramMode {
    Polling,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default = "default_telegram_mode")]
    pub mode: TelegramMode,
    #[serde(default = "default_telegram_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_telegram_chunk_limit")]
    pub chunk_limit: usize,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default = "default_discord_command_prefix")]
    pub command_prefix: String,
    #[serde(default = "default_discord_chunk_limit")]
    pub chunk_limit: usize,
    #[serde(default = "default_discord_gateway_url")]
    pub gateway_url: String,
    #[serde(default = "default_discord_api_base")]
    pub api_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Daily firing time, `HH:MM` in UTC.
    #[serde(default = "default_schedule_at")]
    pub at: String,
    #[serde(default = "default_schedule_channel")]
    pub channel: String,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default = "default_schedule_notify")]
    pub notify: String,
    #[serde(default = "default_schedule_prompt")]
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_bind")]
    pub bind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_suggestion_marker")]
    pub suggestion_marker: String,
    #[serde(default = "default_no_content_text")]
    pub no_content_text: String,
    /// `{status}` is replaced with the HTTP status code.
    #[serde(default = "default_api_error_text")]
    pub api_error_text: String,
    #[serde(default = "default_chart_api_error_text")]
    pub chart_api_error_text: String,
    #[serde(default = "default_transport_error_text")]
    pub transport_error_text: String,
    #[serde(default = "default_chart_unavailable_text")]
    pub chart_unavailable_text: String,
    #[serde(default = "default_chart_caption")]
    pub chart_caption: String,
    #[serde(default = "default_chart_download_failed_text")]
    pub chart_download_failed_text: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flow: FlowConfig::default(),
            telegram: TelegramConfig::default(),
            discord: DiscordConfig::default(),
            schedule: ScheduleConfig::default(),
            http: HttpConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            chart_url: None,
            api_key: None,
            timeout_ms: default_flow_timeout_ms(),
            input_type: default_flow_input_type(),
            output_type: default_flow_output_type(),
            input_component: default_flow_input_component(),
            chart_input_component: default_chart_input_component(),
            tweaks: Map::new(),
            chart_tweaks: Map::new(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            mode: default_telegram_mode(),
            poll_timeout_secs: default_telegram_poll_timeout_secs(),
            chunk_limit: default_telegram_chunk_limit(),
            api_base: default_telegram_api_base(),
        }
    }
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            command_prefix: default_discord_command_prefix(),
            chunk_limit: default_discord_chunk_limit(),
            gateway_url: default_discord_gateway_url(),
            api_base: default_discord_api_base(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            at: default_schedule_at(),
            channel: default_schedule_channel(),
            destination: None,
            notify: default_schedule_notify(),
            prompt: default_schedule_prompt(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            suggestion_marker: default_suggestion_marker(),
            no_content_text: default_no_content_text(),
            api_error_text: default_api_error_text(),
            chart_api_error_text: default_chart_api_error_text(),
            transport_error_text: default_transport_error_text(),
            chart_unavailable_text: default_chart_unavailable_text(),
            chart_caption: default_chart_caption(),
            chart_download_failed_text: default_chart_download_failed_text(),
        }
    }
}

impl FlowConfig {
    pub fn chat_target(&self) -> FlowTarget {
        FlowTarget {
            url: self.url.trim().to_owned(),
            input_component: self.input_component.clone(),
            tweaks: self.tweaks.clone(),
        }
    }

    pub fn chart_target(&self) -> Option<FlowTarget> {
        let url = self.chart_url.as_deref().and_then(normalize_optional_text)?;
        Some(FlowTarget {
            url,
            input_component: self.chart_input_component.clone(),
            tweaks: self.chart_tweaks.clone(),
        })
    }
}

impl TelegramConfig {
    pub fn token(&self) -> Option<String> {
        self.bot_token.as_deref().and_then(normalize_optional_text)
    }
}

impl DiscordConfig {
    pub fn token(&self) -> Option<String> {
        self.bot_token.as_deref().and_then(normalize_optional_text)
    }
}

impl ScheduleConfig {
    pub fn destination(&self) -> Option<String> {
        self.destination.as_deref().and_then(normalize_optional_text)
    }
}

impl HttpConfig {
    pub fn bind(&self) -> Option<String> {
        self.bind.as_deref().and_then(normalize_optional_text)
    }
}

impl Config {
    pub fn load(path: &Path, flow_url_override: Option<&str>) -> Result<Self> {
        let mut cfg = Self::read(path)?;
        cfg.apply_env_overrides();
        cfg.apply_cli_overrides(flow_url_override);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        toml::from_str::<Config>(&text)
            .with_context(|| format!("failed parsing TOML config {}", path.display()))
    }

    pub fn apply_cli_overrides(&mut self, flow_url: Option<&str>) {
        if let Some(url) = flow_url.and_then(normalize_optional_text) {
            self.flow.url = url;
        }
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_first(&["LANGFLOW_RELAY_FLOW_URL", "LANGFLOW_URL"]) {
            self.flow.url = v;
        }
        if let Some(v) = env_first(&["LANGFLOW_RELAY_CHART_URL", "LANGFLOW_CHART_URL"]) {
            self.flow.chart_url = normalize_optional_text(&v);
        }
        if let Some(v) = env_first(&["LANGFLOW_RELAY_API_KEY", "LANGFLOW_API_KEY"]) {
            self.flow.api_key = normalize_optional_text(&v);
        }
        if let Some(v) = env_first(&["LANGFLOW_RELAY_FLOW_TIMEOUT_MS"]) {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.flow.timeout_ms = n.max(1_000);
            }
        }
        if let Some(v) = env_first(&["LANGFLOW_RELAY_TELEGRAM_TOKEN", "TELEGRAM_TOKEN"]) {
            self.telegram.bot_token = normalize_optional_text(&v);
        }
        if let Some(v) = env_first(&["LANGFLOW_RELAY_TELEGRAM_MODE"]) {
            if let Some(mode) = parse_telegram_mode(&v) {
                self.telegram.mode = mode;
            }
        }
        if let Some(v) = env_first(&["LANGFLOW_RELAY_DISCORD_TOKEN", "DISCORD_BOT_TOKEN"]) {
            self.discord.bot_token = normalize_optional_text(&v);
        }
        if let Some(v) = env_first(&["LANGFLOW_RELAY_DISCORD_PREFIX"]) {
            if let Some(prefix) = normalize_optional_text(&v) {
                self.discord.command_prefix = prefix;
            }
        }
        if let Some(v) = env_first(&["LANGFLOW_RELAY_SCHEDULE_ENABLED"]) {
            self.schedule.enabled = parse_bool(&v);
        }
        if let Some(v) = env_first(&["LANGFLOW_RELAY_SCHEDULE_AT"]) {
            self.schedule.at = v.trim().to_owned();
        }
        if let Some(v) = env_first(&["LANGFLOW_RELAY_SCHEDULE_CHANNEL"]) {
            if let Some(channel) = normalize_channel_id(Some(&v)) {
                self.schedule.channel = channel;
            }
        }
        if let Some(v) = env_first(&["LANGFLOW_RELAY_SCHEDULE_DESTINATION", "TELEGRAM_CHAT_ID"]) {
            self.schedule.destination = normalize_optional_text(&v);
        }
        if let Some(v) = env_first(&["LANGFLOW_RELAY_HTTP_BIND"]) {
            self.http.bind = normalize_optional_text(&v);
        } else if let Some(v) = env_first(&["PORT"]) {
            if let Ok(port) = v.trim().parse::<u16>() {
                self.http.bind = Some(format!("0.0.0.0:{port}"));
            }
        }
        if let Some(v) = env_first(&["LANGFLOW_RELAY_SUGGESTION_MARKER"]) {
            if let Some(marker) = normalize_optional_text(&v) {
                self.delivery.suggestion_marker = marker;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let flow_url = self.flow.url.trim();
        if flow_url.is_empty() {
            anyhow::bail!("flow.url must be set (config file, LANGFLOW_RELAY_FLOW_URL or LANGFLOW_URL)");
        }
        validate_http_url("flow.url", flow_url)?;
        if let Some(chart_url) = self.flow.chart_target().map(|target| target.url) {
            validate_http_url("flow.chart_url", &chart_url)?;
        }
        if self.flow.timeout_ms == 0 {
            anyhow::bail!("flow.timeout_ms must be > 0");
        }
        if self.flow.input_component.trim().is_empty() {
            anyhow::bail!("flow.input_component must not be empty");
        }
        if self.flow.chart_url.is_some() && self.flow.chart_input_component.trim().is_empty() {
            anyhow::bail!("flow.chart_input_component must not be empty when flow.chart_url is set");
        }
        if self.telegram.chunk_limit == 0 {
            anyhow::bail!("telegram.chunk_limit must be > 0");
        }
        if self.telegram.poll_timeout_secs == 0 {
            anyhow::bail!("telegram.poll_timeout_secs must be > 0");
        }
        if self.discord.chunk_limit == 0 {
            anyhow::bail!("discord.chunk_limit must be > 0");
        }
        if self.discord.command_prefix.trim().is_empty() {
            anyhow::bail!("discord.command_prefix must not be empty");
        }
        if self.telegram.mode == TelegramMode::Webhook
            && self.telegram.token().is_some()
            && self.http.bind().is_none()
        {
            anyhow::bail!("telegram.mode=webhook requires http.bind");
        }
        DailyTrigger::parse(&self.schedule.at)
            .map_err(|err| anyhow::anyhow!("schedule.at is invalid: {err}"))?;
        let channel = normalize_channel_id(Some(&self.schedule.channel)).unwrap_or_default();
        if !SUPPORTED_CHANNELS.contains(&channel.as_str()) {
            anyhow::bail!(
                "schedule.channel must be one of {}",
                SUPPORTED_CHANNELS.join(", ")
            );
        }
        let delivery = &self.delivery;
        for (field, text) in [
            ("suggestion_marker", &delivery.suggestion_marker),
            ("no_content_text", &delivery.no_content_text),
            ("api_error_text", &delivery.api_error_text),
            ("chart_api_error_text", &delivery.chart_api_error_text),
            ("transport_error_text", &delivery.transport_error_text),
            ("chart_unavailable_text", &delivery.chart_unavailable_text),
            ("chart_download_failed_text", &delivery.chart_download_failed_text),
        ] {
            if text.trim().is_empty() {
                anyhow::bail!("delivery.{field} must not be empty");
            }
        }
        Ok(())
    }
}

fn validate_http_url(field: &str, raw: &str) -> Result<()> {
    let url = Url::parse(raw).with_context(|| format!("{field} `{raw}` is not a valid URL"))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("{field} must use http or https");
    }
    Ok(())
}

fn env_first(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| env::var(name).ok())
}

pub(crate) fn normalize_optional_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_telegram_mode(s: &str) -> Option<TelegramMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "polling" | "poll" | "long_polling" | "long-polling" => Some(TelegramMode::Polling),
        "webhook" | "hook" => Some(TelegramMode::Webhook),
        _ => None,
    }
}

fn default_true() -> bool {
    true
}

fn default_flow_timeout_ms() -> u64 {
    120_000
}

fn default_flow_input_type() -> String {
    "text".to_owned()
}

fn default_flow_output_type() -> String {
    "chat".to_owned()
}

fn default_flow_input_component() -> String {
    "TextInput-xpmxA".to_owned()
}

fn default_chart_input_component() -> String {
    "TextInput-ZWXXv".to_owned()
}

fn default_telegram_mode() -> TelegramMode {
    TelegramMode::Polling
}

fn default_telegram_poll_timeout_secs() -> u64 {
    20
}

fn default_telegram_chunk_limit() -> usize {
    TELEGRAM_TEXT_CHUNK_LIMIT
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_owned()
}

fn default_discord_command_prefix() -> String {
    "/".to_owned()
}

fn default_discord_chunk_limit() -> usize {
    DISCORD_TEXT_CHUNK_LIMIT
}

fn default_discord_gateway_url() -> String {
    "wss://gateway.discord.gg/?v=10&encoding=json".to_owned()
}

fn default_discord_api_base() -> String {
    "https://discord.com/api/v10".to_owned()
}

fn default_schedule_at() -> String {
    "01:00".to_owned()
}

fn default_schedule_channel() -> String {
    "telegram".to_owned()
}

fn default_schedule_notify() -> String {
    "🤖 AI đang tự động khám phá 5 câu hỏi từ dữ liệu của bạn...".to_owned()
}

fn default_schedule_prompt() -> String {
    "Hãy đặt 5 câu hỏi hợp lệ".to_owned()
}

fn default_http_bind() -> Option<String> {
    Some("0.0.0.0:5000".to_owned())
}

fn default_suggestion_marker() -> String {
    DEFAULT_SUGGESTION_MARKER.to_owned()
}

fn default_no_content_text() -> String {
    DEFAULT_NO_CONTENT_TEXT.to_owned()
}

fn default_api_error_text() -> String {
    "❌ Lỗi API ({status})".to_owned()
}

fn default_chart_api_error_text() -> String {
    "❌ Lỗi API biểu đồ ({status})".to_owned()
}

fn default_transport_error_text() -> String {
    "❌ Lỗi khi gọi Langflow hoặc xử lý dữ liệu.".to_owned()
}

fn default_chart_unavailable_text() -> String {
    "⚠️ Chưa cấu hình flow vẽ biểu đồ.".to_owned()
}

fn default_chart_caption() -> String {
    "📈 Biểu đồ được tạo tự động".to_owned()
}

fn default_chart_download_failed_text() -> String {
    "❌ Không thể tải ảnh biểu đồ.".to_owned()
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::{parse_bool, parse_telegram_mode, Config, TelegramMode};

    fn valid_config() -> Config {
        let mut cfg = Config::default();
        cfg.flow.url = "https://flows.example.com/api/v1/run/abc".to_owned();
        cfg
    }

    #[test]
    fn default_config_requires_flow_url() {
        let err = Config::default().validate().expect_err("missing url");
        assert!(err.to_string().contains("flow.url"));
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn rejects_non_http_flow_urls_and_bad_schedule_time() {
        let mut cfg = valid_config();
        cfg.flow.url = "ftp://flows.example.com/run".to_owned();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.schedule.at = "25:00".to_owned();
        let err = cfg.validate().expect_err("bad time");
        assert!(err.to_string().contains("schedule.at"));

        let mut cfg = valid_config();
        cfg.schedule.channel = "slack".to_owned();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_blank_delivery_texts() {
        let mut cfg = valid_config();
        cfg.delivery.no_content_text = "   ".to_owned();
        let err = cfg.validate().expect_err("blank no-content text");
        assert!(err.to_string().contains("delivery.no_content_text"));

        let mut cfg = valid_config();
        cfg.delivery.chart_download_failed_text = String::new();
        let err = cfg.validate().expect_err("blank download text");
        assert!(err.to_string().contains("delivery.chart_download_failed_text"));
    }

    #[test]
    fn webhook_mode_needs_http_listener() {
        let mut cfg = valid_config();
        cfg.telegram.bot_token = Some("123:abc".to_owned());
        cfg.telegram.mode = TelegramMode::Webhook;
        cfg.http.bind = None;
        assert!(cfg.validate().is_err());
        cfg.http.bind = Some("127.0.0.1:5000".to_owned());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_toml_sections_and_tweak_tables() {
        let text = r#"
            [flow]
            url = "http://127.0.0.1:7860/api/v1/run/chat"
            chart_url = "http://127.0.0.1:7860/api/v1/run/chart"
            api_key = "sk-test"

            [flow.tweaks."Agent-Xxy8r"]
            agent_llm = "OpenAI"
            model_name = "gpt-4o-mini"
            temperature = 0.1

            [telegram]
            bot_token = "123:abc"
            mode = "webhook"

            [discord]
            command_prefix = "!"

            [schedule]
            at = "08:30"
            destination = "-100200300"
        "#;
        let cfg: Config = toml::from_str(text).expect("toml");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.telegram.mode, TelegramMode::Webhook);
        assert_eq!(cfg.telegram.chunk_limit, 4_096);
        assert_eq!(cfg.discord.command_prefix, "!");
        assert_eq!(cfg.discord.chunk_limit, 2_000);
        assert_eq!(cfg.schedule.destination().as_deref(), Some("-100200300"));
        assert_eq!(
            cfg.flow
                .tweaks
                .get("Agent-Xxy8r")
                .and_then(|value| value.get("model_name"))
                .and_then(Value::as_str),
            Some("gpt-4o-mini")
        );
        let chart = cfg.flow.chart_target().expect("chart target");
        assert_eq!(chart.input_component, "TextInput-ZWXXv");
    }

    #[test]
    fn blank_optional_values_are_treated_as_unset() {
        let mut cfg = valid_config();
        cfg.flow.chart_url = Some("   ".to_owned());
        cfg.telegram.bot_token = Some(" ".to_owned());
        assert!(cfg.flow.chart_target().is_none());
        assert!(cfg.telegram.token().is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn cli_override_replaces_flow_url() {
        let mut cfg = Config::default();
        cfg.apply_cli_overrides(Some(" http://localhost:7860/api/v1/run/x "));
        assert_eq!(cfg.flow.url, "http://localhost:7860/api/v1/run/x");
        cfg.apply_cli_overrides(None);
        assert_eq!(cfg.flow.url, "http://localhost:7860/api/v1/run/x");
    }

    #[test]
    fn parses_modes_and_booleans() {
        assert_eq!(parse_telegram_mode("Webhook"), Some(TelegramMode::Webhook));
        assert_eq!(parse_telegram_mode("long-polling"), Some(TelegramMode::Polling));
        assert_eq!(parse_telegram_mode("carrier-pigeon"), None);
        assert!(parse_bool("YES"));
        assert!(!parse_bool("0"));
    }
}
