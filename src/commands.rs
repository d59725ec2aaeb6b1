use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::channels::{ConversationId, MessageRef, Transport};
use crate::delivery::DeliveryCoordinator;
use crate::scheduler::ScheduledPrompt;

const AI_NOTICE: &str = "⏳ Đang xử lý...";
const REP_NOTICE: &str = "⏳ Đang xử lý phản hồi...";
const CHART_NOTICE: &str = "📊 Đang phân tích và vẽ biểu đồ...";
const OK_NOTICE: &str = "⏳ Đang xử lý gợi ý trước đó...";
const SCHEDULE_NOTICE: &str = "⚙️ Đang kích hoạt gửi câu hỏi như lúc 8:00 sáng...";
const REP_NEEDS_REPLY: &str = "⚠️ Bạn cần reply một tin nhắn để dùng /rep.";
const CHART_NEEDS_REPLY: &str = "⚠️ Bạn cần reply một tin nhắn có dữ liệu.";
const NO_SUGGESTION: &str = "⚠️ Không có gợi ý nào để xử lý. Hãy gửi câu hỏi trước.";
const QUES_NOT_POSITIVE: &str = "❌ Số câu hỏi phải lớn hơn 0.";
const QUES_SYNTAX: &str = "❌ Sai cú pháp! Dùng đúng định dạng: /ques {số}";
const AI_USAGE: &str = "⚠️ Dùng đúng định dạng: /ai {câu hỏi}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCommand {
    Ai { prompt: String },
    Rep { text: String },
    Chart,
    Ok,
    Ques { count: Option<i64> },
    Schedule,
    Count,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub conversation: ConversationId,
    pub text: String,
    pub reply_to: Option<MessageRef>,
}

fn command_token_without_mention(token: &str) -> String {
    let lowered = token.trim().to_lowercase();
    if let Some((command, _)) = lowered.split_once('@') {
        command.to_owned()
    } else {
        lowered
    }
}

pub fn parse_relay_command(text: &str, prefix: &str) -> Option<RelayCommand> {
    let body = text.trim().strip_prefix(prefix)?;
    let (head, rest) = match body.find(char::is_whitespace) {
        Some(idx) => body.split_at(idx),
        None => (body, ""),
    };
    let args = rest.trim();
    match command_token_without_mention(head).as_str() {
        "ai" => Some(RelayCommand::Ai {
            prompt: args.to_owned(),
        }),
        "rep" => Some(RelayCommand::Rep {
            text: args.to_owned(),
        }),
        "chart" => Some(RelayCommand::Chart),
        "ok" => Some(RelayCommand::Ok),
        "ques" => {
            let mut parts = args.split_whitespace();
            let count = match (parts.next(), parts.next()) {
                (Some(raw), None) => raw.parse::<i64>().ok(),
                _ => None,
            };
            Some(RelayCommand::Ques { count })
        }
        "schedule" => Some(RelayCommand::Schedule),
        "count" => Some(RelayCommand::Count),
        "start" | "help" => Some(RelayCommand::Help),
        _ => None,
    }
}

pub fn build_ai_prompt(prompt: &str, replied: Option<&str>) -> String {
    match replied {
        Some(replied) => format!(
            "{prompt}\n(Phản hồi từ người dùng: {prompt})\n(Tin nhắn được reply: {})",
            replied.trim()
        ),
        None => prompt.to_owned(),
    }
}

pub fn question_prompt(count: i64) -> String {
    format!("Hãy đặt {count} câu hỏi hợp lệ đi")
}

pub fn count_message(invocations: u64) -> String {
    format!("Tổng số lần gửi input tới Langflow: {invocations}")
}

fn help_message(prefix: &str) -> String {
    [
        "🤖 Bot Langflow đang hoạt động.".to_owned(),
        format!("{prefix}ai <câu hỏi> - hỏi AI (có thể reply một tin nhắn)"),
        format!("{prefix}rep <nội dung> - phản hồi tin nhắn được reply"),
        format!("{prefix}chart - vẽ biểu đồ từ tin nhắn được reply"),
        format!("{prefix}ok - xử lý gợi ý gần nhất"),
        format!("{prefix}ques <số> - tạo câu hỏi từ dữ liệu"),
        format!("{prefix}schedule - chạy ngay tác vụ hằng ngày"),
        format!("{prefix}count - số lần gửi input tới Langflow"),
    ]
    .join("\n")
}

pub struct CommandRouter {
    coordinator: Arc<DeliveryCoordinator>,
    scheduled: ScheduledPrompt,
    leading_command: Regex,
}

impl CommandRouter {
    pub fn new(
        coordinator: Arc<DeliveryCoordinator>,
        scheduled: ScheduledPrompt,
    ) -> Result<Self, String> {
        let leading_command = Regex::new(r"^/\w+\s*")
            .map_err(|err| format!("invalid leading command pattern: {err}"))?;
        Ok(Self {
            coordinator,
            scheduled,
            leading_command,
        })
    }

    pub fn coordinator(&self) -> &Arc<DeliveryCoordinator> {
        &self.coordinator
    }

    pub fn build_rep_prompt(&self, text: &str, replied: &str) -> String {
        let replied = self.leading_command.replace(replied.trim(), "");
        format!("{text} [phản hồi từ] {replied}")
    }

    pub async fn handle(
        &self,
        transport: &dyn Transport,
        message: &InboundMessage,
        prefix: &str,
    ) -> bool {
        let Some(command) = parse_relay_command(&message.text, prefix) else {
            return false;
        };
        debug!(
            "{} command {:?} in {}",
            transport.channel(),
            command,
            message.conversation
        );
        let conversation = &message.conversation;
        let coordinator = self.coordinator.as_ref();
        match command {
            RelayCommand::Ai { prompt } => {
                let replied = self.replied_text(transport, message).await;
                if prompt.is_empty() && replied.is_none() {
                    self.notify(transport, conversation, AI_USAGE).await;
                    return true;
                }
                let prompt = build_ai_prompt(&prompt, replied.as_deref());
                self.notify(transport, conversation, AI_NOTICE).await;
                coordinator
                    .handle_prompt(transport, conversation, &prompt)
                    .await;
            }
            RelayCommand::Rep { text } => {
                let Some(replied) = self.replied_text(transport, message).await else {
                    self.notify(transport, conversation, REP_NEEDS_REPLY).await;
                    return true;
                };
                let prompt = self.build_rep_prompt(&text, &replied);
                self.notify(transport, conversation, REP_NOTICE).await;
                coordinator
                    .handle_prompt(transport, conversation, &prompt)
                    .await;
            }
            RelayCommand::Chart => {
                let Some(data) = self.replied_text(transport, message).await else {
                    self.notify(transport, conversation, CHART_NEEDS_REPLY).await;
                    return true;
                };
                self.notify(transport, conversation, CHART_NOTICE).await;
                coordinator
                    .handle_chart(transport, conversation, data.trim())
                    .await;
            }
            RelayCommand::Ok => {
                let Some(suggestion) = coordinator.state().suggestions.consume(conversation).await
                else {
                    self.notify(transport, conversation, NO_SUGGESTION).await;
                    return true;
                };
                self.notify(transport, conversation, OK_NOTICE).await;
                coordinator
                    .handle_prompt(transport, conversation, &suggestion)
                    .await;
            }
            RelayCommand::Ques { count: None } => {
                self.notify(transport, conversation, QUES_SYNTAX).await;
            }
            RelayCommand::Ques { count: Some(count) } if count <= 0 => {
                self.notify(transport, conversation, QUES_NOT_POSITIVE).await;
            }
            RelayCommand::Ques { count: Some(count) } => {
                let notice = format!("⏳ Đang tạo {count} câu hỏi...");
                self.notify(transport, conversation, &notice).await;
                coordinator
                    .handle_prompt(transport, conversation, &question_prompt(count))
                    .await;
            }
            RelayCommand::Schedule => {
                self.notify(transport, conversation, SCHEDULE_NOTICE).await;
                self.scheduled
                    .run(coordinator, transport, conversation)
                    .await;
            }
            RelayCommand::Count => {
                let text = count_message(coordinator.state().invocations.read());
                self.notify(transport, conversation, &text).await;
            }
            RelayCommand::Help => {
                self.notify(transport, conversation, &help_message(prefix))
                    .await;
            }
        }
        true
    }

    async fn replied_text(
        &self,
        transport: &dyn Transport,
        message: &InboundMessage,
    ) -> Option<String> {
        let reference = message.reply_to.as_ref()?;
        let replied = transport
            .fetch_replied_message(&message.conversation, reference)
            .await
            .filter(|text| !text.trim().is_empty());
        if replied.is_none() {
            debug!(
                "{} replied message {:?} unavailable",
                transport.channel(),
                reference
            );
        }
        replied
    }

    async fn notify(&self, transport: &dyn Transport, conversation: &ConversationId, text: &str) {
        if let Err(err) = transport.send_text(conversation, text).await {
            warn!(
                "notice to {}:{conversation} failed: {err}",
                transport.channel()
            );
        }
    }
}
