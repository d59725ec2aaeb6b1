use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::channels::{ConversationId, Transport};
use crate::config::ScheduleConfig;
use crate::delivery::{DeliveryCoordinator, DeliveryReport};

const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyTrigger {
    hour: u8,
    minute: u8,
}

impl DailyTrigger {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let (hour, minute) = trimmed
            .split_once(':')
            .ok_or_else(|| format!("expected HH:MM, got `{trimmed}`"))?;
        let hour = hour
            .parse::<u8>()
            .map_err(|_| format!("invalid hour in `{trimmed}`"))?;
        let minute = minute
            .parse::<u8>()
            .map_err(|_| format!("invalid minute in `{trimmed}`"))?;
        if hour > 23 || minute > 59 {
            return Err(format!("`{trimmed}` is not a time of day"));
        }
        Ok(Self { hour, minute })
    }

    fn seconds_of_day(&self) -> u64 {
        u64::from(self.hour) * 3_600 + u64::from(self.minute) * 60
    }

    /// Seconds from `now_unix_secs` to the next firing, in `1..=86400`. Exactly at
    /// the firing time the answer is a full day.
    pub fn seconds_until_next(&self, now_unix_secs: u64) -> u64 {
        let now = now_unix_secs % SECONDS_PER_DAY;
        let target = self.seconds_of_day();
        if target > now {
            target - now
        } else {
            target + SECONDS_PER_DAY - now
        }
    }
}

impl fmt::Display for DailyTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02} UTC", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledPrompt {
    pub notify: String,
    pub prompt: String,
}

impl ScheduledPrompt {
    pub fn from_config(cfg: &ScheduleConfig) -> Self {
        Self {
            notify: cfg.notify.clone(),
            prompt: cfg.prompt.clone(),
        }
    }

    pub async fn run(
        &self,
        coordinator: &DeliveryCoordinator,
        transport: &dyn Transport,
        conversation: &ConversationId,
    ) -> DeliveryReport {
        if let Err(err) = transport.send_text(conversation, &self.notify).await {
            warn!(
                "scheduled notice to {}:{conversation} failed: {err}",
                transport.channel()
            );
        }
        coordinator
            .handle_prompt(transport, conversation, &self.prompt)
            .await
    }
}

#[derive(Clone)]
pub struct DailyJob {
    prompt: ScheduledPrompt,
    coordinator: Arc<DeliveryCoordinator>,
    transport: Arc<dyn Transport>,
    destination: ConversationId,
}

impl DailyJob {
    pub fn new(
        prompt: ScheduledPrompt,
        coordinator: Arc<DeliveryCoordinator>,
        transport: Arc<dyn Transport>,
        destination: ConversationId,
    ) -> Self {
        Self {
            prompt,
            coordinator,
            transport,
            destination,
        }
    }

    pub fn destination(&self) -> &ConversationId {
        &self.destination
    }

    pub async fn run_now(&self) -> DeliveryReport {
        self.prompt
            .run(&self.coordinator, self.transport.as_ref(), &self.destination)
            .await
    }
}

pub fn spawn_daily(trigger: DailyTrigger, job: DailyJob) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "daily job armed at {trigger} for {}:{}",
            job.transport.channel(),
            job.destination
        );
        loop {
            let wait = trigger.seconds_until_next(now_unix_secs());
            debug!("daily job sleeping {wait}s");
            sleep(Duration::from_secs(wait)).await;
            let report = job.run_now().await;
            info!(
                "daily job delivered {} chunk(s), {} send failure(s)",
                report.chunks_sent,
                report.send_failures.len()
            );
        }
    })
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{DailyJob, DailyTrigger, ScheduledPrompt};
    use crate::channels::ConversationId;
    use crate::config::{DeliveryConfig, ScheduleConfig};
    use crate::delivery::DeliveryCoordinator;
    use crate::state::RelayState;
    use crate::testing::{text_payload, RecordingTransport, ScriptedFlow};

    #[test]
    fn parses_clock_times() {
        let trigger = DailyTrigger::parse(" 01:00 ").expect("trigger");
        assert_eq!(trigger.to_string(), "01:00 UTC");
        assert_eq!(
            DailyTrigger::parse("8:05").expect("short hour").to_string(),
            "08:05 UTC"
        );
        assert!(DailyTrigger::parse("24:00").is_err());
        assert!(DailyTrigger::parse("12:60").is_err());
        assert!(DailyTrigger::parse("noon").is_err());
        assert!(DailyTrigger::parse("12:xx").is_err());
    }

    #[test]
    fn next_firing_is_within_one_day() {
        let trigger = DailyTrigger::parse("01:00").expect("trigger");
        let midnight = 19_000 * 86_400;
        assert_eq!(trigger.seconds_until_next(midnight), 3_600);
        assert_eq!(trigger.seconds_until_next(midnight + 3_599), 1);
        assert_eq!(trigger.seconds_until_next(midnight + 3_600), 86_400);
        assert_eq!(trigger.seconds_until_next(midnight + 3_601), 86_399);
        for now in (midnight..midnight + 2 * 86_400).step_by(997) {
            let wait = trigger.seconds_until_next(now);
            assert!((1..=86_400).contains(&wait));
            assert_eq!((now + wait) % 86_400, 3_600);
        }
    }

    #[tokio::test]
    async fn daily_job_sends_notice_then_prompt_answer_to_destination() {
        let flow = ScriptedFlow::new(vec![Ok(text_payload(&["1. Doanh thu?\n2. Chi phí?"]))]);
        let coordinator = Arc::new(DeliveryCoordinator::new(
            flow.clone(),
            Arc::new(RelayState::default()),
            DeliveryConfig::default(),
        ));
        let transport = Arc::new(RecordingTransport::with_limit(4_096));
        let job = DailyJob::new(
            ScheduledPrompt::from_config(&ScheduleConfig::default()),
            coordinator.clone(),
            transport.clone(),
            ConversationId::from("-100200"),
        );

        job.run_now().await;

        let texts = transport.texts.lock().await.clone();
        assert_eq!(
            texts,
            vec![
                (
                    ConversationId::from("-100200"),
                    "🤖 AI đang tự động khám phá 5 câu hỏi từ dữ liệu của bạn...".to_owned()
                ),
                (
                    ConversationId::from("-100200"),
                    "1. Doanh thu?\n2. Chi phí?".to_owned()
                ),
            ]
        );
        assert_eq!(*flow.prompts.lock().await, vec!["Hãy đặt 5 câu hỏi hợp lệ"]);
        assert_eq!(coordinator.state().invocations.read(), 1);
    }
}
