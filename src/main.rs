mod channels;
mod commands;
mod config;
mod delivery;
mod flow;
mod http_server;
mod runtime;
mod scheduler;
mod state;
#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use channels::console::ConsoleTransport;
use channels::{chunk_text, default_text_chunk_limit, normalize_channel_id, ConversationId};
use clap::{Args, Parser, Subcommand};
use config::{Config, TelegramMode};
use delivery::DeliveryCoordinator;
use flow::payload::normalize_payload;
use scheduler::DailyTrigger;
use serde::Serialize;
use serde_json::{json, Value};
use state::{extract_suggestion, RelayState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Relay chat commands from Telegram and Discord to Langflow")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "LANGFLOW_RELAY_CONFIG",
        default_value = "langflow-relay.toml"
    )]
    config: PathBuf,

    /// Override the chat flow run URL.
    #[arg(long = "flow-url", global = true)]
    flow_url: Option<String>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "LANGFLOW_RELAY_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the bridges, the daily job and the control listener.
    Run,
    /// Print configuration diagnostics.
    Doctor(DoctorArgs),
    /// Normalize and chunk a saved flow response offline.
    Normalize(NormalizeArgs),
    /// Send one prompt through the chat flow and print the delivery.
    Ask(AskArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct NormalizeArgs {
    /// Saved flow response (JSON).
    #[arg(long)]
    file: PathBuf,
    /// Chunk size in characters; defaults to the channel's limit.
    #[arg(long = "max-chars")]
    max_chars: Option<usize>,
    /// Channel whose message limit applies (telegram, discord).
    #[arg(long)]
    channel: Option<String>,
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct AskArgs {
    /// Prompt to send.
    #[arg(long)]
    message: String,
    /// Conversation id used for suggestion tracking.
    #[arg(long, default_value = "console")]
    conversation: String,
    /// Chunk size in characters.
    #[arg(long = "max-chars")]
    max_chars: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl DoctorCheck {
    fn new(id: &str, status: &str, message: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            id: id.to_owned(),
            status: status.to_owned(),
            message: message.into(),
            detail,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Run);
    match command {
        CliCommand::Run => run_relay(&cli).await,
        CliCommand::Doctor(args) => run_doctor(&cli, args),
        CliCommand::Normalize(args) => run_normalize(&cli.config, args),
        CliCommand::Ask(args) => run_ask(&cli, args).await,
    }
}

async fn run_relay(cli: &Cli) -> Result<()> {
    let cfg = Config::load(&cli.config, cli.flow_url.as_deref())?;
    let runtime = runtime::RelayRuntime::new(cfg)?;
    runtime.run().await
}

fn run_doctor(cli: &Cli, args: DoctorArgs) -> Result<()> {
    let config_result =
        Config::load(&cli.config, cli.flow_url.as_deref()).map_err(|err| format!("{err:#}"));
    let report = build_doctor_report(config_result, &cli.config);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn run_normalize(config_path: &Path, args: NormalizeArgs) -> Result<()> {
    let cfg = Config::read(config_path)?;
    let raw = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed reading {}", args.file.display()))?;
    let payload: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not JSON", args.file.display()))?;
    let max_chars = args
        .max_chars
        .unwrap_or_else(|| default_text_chunk_limit(args.channel.as_deref()));
    if max_chars == 0 {
        bail!("--max-chars must be greater than 0");
    }
    let report = normalize_report(&payload, &cfg, max_chars);
    if args.json {
        print_json_value(&report);
        return Ok(());
    }

    let segments = report
        .get("segments")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    println!("segments: {}", segments.len());
    for (index, segment) in segments.iter().enumerate() {
        let chunks = segment
            .get("chunks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        println!("--- segment {} ({} chunk(s))", index + 1, chunks.len());
        for chunk in chunks {
            println!("{}", chunk.as_str().unwrap_or_default());
        }
        if let Some(suggestion) = segment.get("suggestion").and_then(Value::as_str) {
            println!("suggestion: {suggestion}");
        }
    }
    Ok(())
}

fn normalize_report(payload: &Value, cfg: &Config, max_chars: usize) -> Value {
    let segments: Vec<Value> = normalize_payload(payload, &cfg.delivery.no_content_text)
        .into_iter()
        .map(|segment| {
            let chunks = chunk_text(&segment, max_chars);
            let suggestion = extract_suggestion(&segment, &cfg.delivery.suggestion_marker);
            json!({
                "text": segment,
                "chunks": chunks,
                "suggestion": suggestion,
            })
        })
        .collect();
    json!({
        "maxChars": max_chars,
        "count": segments.len(),
        "segments": segments,
    })
}

async fn run_ask(cli: &Cli, args: AskArgs) -> Result<()> {
    let cfg = Config::load(&cli.config, cli.flow_url.as_deref())?;
    let state = Arc::new(RelayState::new(&cfg.delivery.suggestion_marker));
    let coordinator =
        DeliveryCoordinator::from_config(&cfg, state).map_err(|err| anyhow!(err))?;
    let transport = ConsoleTransport::new(args.max_chars);
    let conversation = ConversationId::new(args.conversation);

    let report = coordinator
        .handle_prompt(&transport, &conversation, &args.message)
        .await;
    info!(
        "ask delivered {} segment(s) in {} chunk(s), suggestion_recorded={}",
        report.segments, report.chunks_sent, report.suggestion_recorded
    );
    if !report.send_failures.is_empty() {
        bail!("delivery failed: {}", report.send_failures.join("; "));
    }
    Ok(())
}

fn print_json_value(value: &Value) {
    let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    println!("{rendered}");
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
) -> DoctorReport {
    let mut checks = Vec::new();

    let cfg = match config_result {
        Ok(cfg) => {
            checks.push(DoctorCheck::new(
                "config.load",
                "pass",
                format!("loaded {}", config_path.display()),
                None,
            ));
            Some(cfg)
        }
        Err(err) => {
            checks.push(DoctorCheck::new(
                "config.load",
                "fail",
                format!("failed to load {}", config_path.display()),
                Some(err),
            ));
            None
        }
    };

    if let Some(cfg) = cfg.as_ref() {
        checks.push(DoctorCheck::new(
            "flow.url",
            "pass",
            cfg.flow.url.trim(),
            Some(format!(
                "api key {}, timeout {}ms",
                if cfg.flow.api_key.as_deref().is_some_and(|key| !key.trim().is_empty()) {
                    "set"
                } else {
                    "unset"
                },
                cfg.flow.timeout_ms
            )),
        ));

        checks.push(match cfg.flow.chart_target() {
            Some(target) => DoctorCheck::new("flow.chart", "pass", target.url, None),
            None => DoctorCheck::new(
                "flow.chart",
                "warn",
                "chart flow not configured",
                Some("/chart answers with a notice".to_owned()),
            ),
        });

        let telegram_enabled = cfg.telegram.token().is_some();
        checks.push(if telegram_enabled {
            let mode = match cfg.telegram.mode {
                TelegramMode::Polling => "long polling",
                TelegramMode::Webhook => "webhook",
            };
            DoctorCheck::new(
                "telegram.bot",
                "pass",
                format!("enabled ({mode})"),
                Some(format!("chunk limit {}", cfg.telegram.chunk_limit)),
            )
        } else {
            DoctorCheck::new("telegram.bot", "warn", "bot token not set", None)
        });

        let discord_enabled = cfg.discord.token().is_some();
        checks.push(if discord_enabled {
            DoctorCheck::new(
                "discord.bot",
                "pass",
                format!("enabled (prefix `{}`)", cfg.discord.command_prefix),
                Some(format!("chunk limit {}", cfg.discord.chunk_limit)),
            )
        } else {
            DoctorCheck::new("discord.bot", "warn", "bot token not set", None)
        });

        checks.push(schedule_check(cfg, telegram_enabled, discord_enabled));

        checks.push(match cfg.http.bind() {
            Some(bind) => DoctorCheck::new("http.bind", "pass", bind, None),
            None => DoctorCheck::new(
                "http.bind",
                "warn",
                "control listener disabled",
                None,
            ),
        });
    }

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn schedule_check(cfg: &Config, telegram_enabled: bool, discord_enabled: bool) -> DoctorCheck {
    let schedule = &cfg.schedule;
    if !schedule.enabled {
        return DoctorCheck::new("schedule", "pass", "daily job disabled", None);
    }
    let trigger = match DailyTrigger::parse(&schedule.at) {
        Ok(trigger) => trigger,
        Err(err) => return DoctorCheck::new("schedule", "fail", "invalid schedule.at", Some(err)),
    };
    let channel = normalize_channel_id(Some(&schedule.channel)).unwrap_or_default();
    let Some(destination) = schedule.destination() else {
        return DoctorCheck::new(
            "schedule",
            "warn",
            "daily job not armed",
            Some("schedule.destination unset".to_owned()),
        );
    };
    let bridge_enabled = match channel.as_str() {
        "telegram" => telegram_enabled,
        "discord" => discord_enabled,
        _ => false,
    };
    if !bridge_enabled {
        return DoctorCheck::new(
            "schedule",
            "warn",
            "daily job not armed",
            Some(format!("channel `{channel}` has no bot token")),
        );
    }
    DoctorCheck::new(
        "schedule",
        "pass",
        format!("armed at {trigger}"),
        Some(format!("{channel}:{destination}")),
    )
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .init();
    Ok(())
}
