use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::channels::discord::{DiscordApi, DiscordBridge, DiscordTransport};
use crate::channels::telegram::{TelegramApi, TelegramBridge, TelegramTransport};
use crate::channels::{normalize_channel_id, ConversationId, Transport};
use crate::commands::CommandRouter;
use crate::config::{Config, TelegramMode};
use crate::delivery::DeliveryCoordinator;
use crate::http_server::{self, ControlState};
use crate::scheduler::{spawn_daily, DailyJob, DailyTrigger, ScheduledPrompt};
use crate::state::RelayState;

pub struct RelayRuntime {
    config: Config,
    coordinator: Arc<DeliveryCoordinator>,
    router: Arc<CommandRouter>,
}

impl RelayRuntime {
    pub fn new(config: Config) -> Result<Self> {
        let state = Arc::new(RelayState::new(&config.delivery.suggestion_marker));
        let coordinator = Arc::new(
            DeliveryCoordinator::from_config(&config, state).map_err(|err| anyhow!(err))?,
        );
        let router = Arc::new(
            CommandRouter::new(
                coordinator.clone(),
                ScheduledPrompt::from_config(&config.schedule),
            )
            .map_err(|err| anyhow!(err))?,
        );
        Ok(Self {
            config,
            coordinator,
            router,
        })
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "starting relay (flow={}, chart_flow={}, telegram={}, discord={}, http={})",
            self.config.flow.url,
            self.coordinator.has_chart_flow(),
            self.config.telegram.token().is_some(),
            self.config.discord.token().is_some(),
            self.config.http.bind().as_deref().unwrap_or("off"),
        );

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut transports: HashMap<&'static str, Arc<dyn Transport>> = HashMap::new();
        let mut telegram_webhook = None;

        if let Some(token) = self.config.telegram.token() {
            let api = Arc::new(
                TelegramApi::new(&self.config.telegram, token).map_err(|err| anyhow!(err))?,
            );
            let transport: Arc<dyn Transport> = Arc::new(TelegramTransport::new(
                api.clone(),
                self.config.telegram.chunk_limit,
            ));
            let bridge = Arc::new(TelegramBridge::new(
                api,
                transport.clone(),
                self.router.clone(),
                self.config.telegram.poll_timeout_secs,
            ));
            match self.config.telegram.mode {
                TelegramMode::Polling => tasks.push(bridge.spawn_polling()),
                TelegramMode::Webhook => {
                    info!("telegram bridge waiting for webhook updates");
                    telegram_webhook = Some(bridge);
                }
            }
            transports.insert("telegram", transport);
        } else {
            info!("telegram bridge disabled (no bot token)");
        }

        if let Some(token) = self.config.discord.token() {
            let api = Arc::new(
                DiscordApi::new(&self.config.discord, token.clone())
                    .map_err(|err| anyhow!(err))?,
            );
            let transport: Arc<dyn Transport> = Arc::new(DiscordTransport::new(
                api,
                self.config.discord.chunk_limit,
            ));
            let bridge = Arc::new(DiscordBridge::new(
                &self.config.discord,
                token,
                transport.clone(),
                self.router.clone(),
            ));
            tasks.push(bridge.spawn());
            transports.insert("discord", transport);
        } else {
            info!("discord bridge disabled (no bot token)");
        }

        if transports.is_empty() {
            warn!("no chat bridge configured; only the control listener can trigger deliveries");
        }

        let daily_job = self.daily_job(&transports);
        if self.config.schedule.enabled {
            if let Some(job) = daily_job.clone() {
                let trigger = DailyTrigger::parse(&self.config.schedule.at)
                    .map_err(|err| anyhow!("schedule.at: {err}"))?;
                tasks.push(spawn_daily(trigger, job));
            }
        } else {
            info!("daily job disabled");
        }

        if let Some(bind) = self.config.http.bind() {
            let listener = http_server::bind(&bind).await?;
            let state = Arc::new(ControlState {
                coordinator: self.coordinator.clone(),
                daily_job,
                telegram: telegram_webhook,
            });
            tasks.push(http_server::spawn(listener, state));
        } else if telegram_webhook.is_some() {
            bail!("telegram.mode = \"webhook\" needs http.bind to receive updates");
        }

        if tasks.is_empty() {
            bail!("nothing to run: configure a bot token or http.bind");
        }

        let result = signal::ctrl_c()
            .await
            .map_err(|err| anyhow!("failed to listen for ctrl-c: {err}"));
        info!("received ctrl-c, shutting down");
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        info!(
            "relay stopped after {} flow invocation(s)",
            self.coordinator.state().invocations.read()
        );
        result
    }

    fn daily_job(
        &self,
        transports: &HashMap<&'static str, Arc<dyn Transport>>,
    ) -> Option<DailyJob> {
        let schedule = &self.config.schedule;
        let Some(destination) = schedule.destination() else {
            info!("daily job not armed (schedule.destination unset)");
            return None;
        };
        let channel = normalize_channel_id(Some(&schedule.channel)).unwrap_or_default();
        let Some(transport) = transports.get(channel.as_str()) else {
            warn!("daily job not armed: channel `{channel}` has no running bridge");
            return None;
        };
        Some(DailyJob::new(
            ScheduledPrompt::from_config(schedule),
            self.coordinator.clone(),
            transport.clone(),
            ConversationId::new(destination),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::RelayRuntime;
    use crate::channels::Transport;
    use crate::config::Config;
    use crate::testing::RecordingTransport;

    fn config_with_schedule(destination: Option<&str>, channel: &str) -> Config {
        let mut cfg = Config::default();
        cfg.flow.url = "http://127.0.0.1:7860/api/v1/run/chat".to_owned();
        cfg.schedule.destination = destination.map(str::to_owned);
        cfg.schedule.channel = channel.to_owned();
        cfg
    }

    #[test]
    fn daily_job_binds_to_the_configured_channel() {
        let runtime = RelayRuntime::new(config_with_schedule(Some(" -100200 "), "Telegram"))
            .expect("runtime");
        let mut transports: HashMap<&'static str, Arc<dyn Transport>> = HashMap::new();
        transports.insert("telegram", Arc::new(RecordingTransport::with_limit(4_096)));

        let job = runtime.daily_job(&transports).expect("job armed");
        assert_eq!(job.destination().as_str(), "-100200");
    }

    #[test]
    fn daily_job_needs_destination_and_bridge() {
        let mut transports: HashMap<&'static str, Arc<dyn Transport>> = HashMap::new();
        transports.insert("telegram", Arc::new(RecordingTransport::with_limit(4_096)));

        let no_destination =
            RelayRuntime::new(config_with_schedule(None, "telegram")).expect("runtime");
        assert!(no_destination.daily_job(&transports).is_none());

        let no_bridge =
            RelayRuntime::new(config_with_schedule(Some("42"), "discord")).expect("runtime");
        assert!(no_bridge.daily_job(&transports).is_none());
    }

    #[test]
    fn chart_flow_is_wired_only_when_configured() {
        let plain = RelayRuntime::new(config_with_schedule(None, "telegram")).expect("runtime");
        assert!(!plain.coordinator.has_chart_flow());

        let mut cfg = config_with_schedule(None, "telegram");
        cfg.flow.chart_url = Some("http://127.0.0.1:7860/api/v1/run/chart".to_owned());
        let charted = RelayRuntime::new(cfg).expect("runtime");
        assert!(charted.coordinator.has_chart_flow());
    }
}
