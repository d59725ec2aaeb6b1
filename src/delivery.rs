use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::channels::{chunk_text, ConversationId, Transport};
use crate::config::{Config, DeliveryConfig};
use crate::flow::payload::{normalize_payload, DEFAULT_NO_CONTENT_TEXT};
use crate::flow::{FlowEngine, ImageFetcher, InvocationError, LangflowClient};
use crate::state::RelayState;

pub const CHART_FILE_NAME: &str = "chart.png";
const CHART_HOST: &str = "quickchart.io";
const CHART_PATH_PREFIX: &str = "/chart";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub segments: usize,
    pub chunks_sent: usize,
    pub send_failures: Vec<String>,
    pub suggestion_recorded: bool,
}

impl DeliveryReport {
    fn merge(&mut self, other: DeliveryReport) {
        self.segments += other.segments;
        self.chunks_sent += other.chunks_sent;
        self.send_failures.extend(other.send_failures);
        self.suggestion_recorded |= other.suggestion_recorded;
    }
}

struct ChartFlow {
    flow: Arc<dyn FlowEngine>,
    images: Arc<dyn ImageFetcher>,
}

pub struct DeliveryCoordinator {
    chat_flow: Arc<dyn FlowEngine>,
    chart: Option<ChartFlow>,
    state: Arc<RelayState>,
    texts: DeliveryConfig,
}

impl DeliveryCoordinator {
    pub fn new(
        chat_flow: Arc<dyn FlowEngine>,
        state: Arc<RelayState>,
        texts: DeliveryConfig,
    ) -> Self {
        Self {
            chat_flow,
            chart: None,
            state,
            texts,
        }
    }

    pub fn with_chart_flow(
        mut self,
        flow: Arc<dyn FlowEngine>,
        images: Arc<dyn ImageFetcher>,
    ) -> Self {
        self.chart = Some(ChartFlow { flow, images });
        self
    }

    pub fn from_config(cfg: &Config, state: Arc<RelayState>) -> Result<Self, String> {
        let chat = LangflowClient::new(&cfg.flow, &cfg.flow.chat_target())?;
        let mut coordinator = Self::new(Arc::new(chat), state, cfg.delivery.clone());
        if let Some(target) = cfg.flow.chart_target() {
            let chart = Arc::new(LangflowClient::new(&cfg.flow, &target)?);
            coordinator = coordinator.with_chart_flow(chart.clone(), chart);
        }
        Ok(coordinator)
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    pub fn has_chart_flow(&self) -> bool {
        self.chart.is_some()
    }

    pub async fn handle_prompt(
        &self,
        transport: &dyn Transport,
        conversation: &ConversationId,
        prompt: &str,
    ) -> DeliveryReport {
        self.state.invocations.increment();
        let result = self.chat_flow.invoke(prompt).await;
        let segments = self.segments_for(result, &self.texts.api_error_text, "chat");
        let report = self.deliver_segments(transport, conversation, &segments).await;
        debug!(
            "prompt for {}:{conversation} delivered {} chunk(s) in {} segment(s)",
            transport.channel(),
            report.chunks_sent,
            report.segments
        );
        report
    }

    pub async fn handle_chart(
        &self,
        transport: &dyn Transport,
        conversation: &ConversationId,
        data: &str,
    ) -> DeliveryReport {
        let Some(chart) = self.chart.as_ref() else {
            return self
                .deliver_segments(
                    transport,
                    conversation,
                    &[self.texts.chart_unavailable_text.clone()],
                )
                .await;
        };
        self.state.invocations.increment();
        let result = chart.flow.invoke(data).await;
        let segments = self.segments_for(result, &self.texts.chart_api_error_text, "chart");

        let Some(image_url) = segments.first().filter(|first| is_chart_image_url(first)) else {
            return self.deliver_segments(transport, conversation, &segments).await;
        };

        let mut report = DeliveryReport {
            segments: 1,
            ..DeliveryReport::default()
        };
        match chart.images.fetch_image(image_url).await {
            Ok(bytes) => {
                match transport
                    .send_file(
                        conversation,
                        bytes,
                        CHART_FILE_NAME,
                        Some(&self.texts.chart_caption),
                    )
                    .await
                {
                    Ok(()) => report.chunks_sent += 1,
                    Err(err) => {
                        warn!(
                            "chart upload to {}:{conversation} failed: {err}",
                            transport.channel()
                        );
                        report.send_failures.push(err.to_string());
                    }
                }
            }
            Err(err) => {
                warn!("chart image download failed: {err}");
                let fallback = [self.texts.chart_download_failed_text.clone()];
                let mut failed = self.deliver_segments(transport, conversation, &fallback).await;
                failed.segments = 0;
                report.merge(failed);
            }
        }
        report
    }

    pub async fn deliver_segments(
        &self,
        transport: &dyn Transport,
        conversation: &ConversationId,
        segments: &[String],
    ) -> DeliveryReport {
        let limit = transport.chunk_limit();
        let mut report = DeliveryReport::default();
        for segment in segments {
            report.segments += 1;
            let mut delivered = false;
            let mut chunks = chunk_text(segment, limit);
            if chunks.is_empty() {
                debug!("blank segment for {conversation}; sending the no-content text");
                chunks = chunk_text(DEFAULT_NO_CONTENT_TEXT, limit);
            }
            for chunk in chunks {
                match transport.send_text(conversation, &chunk).await {
                    Ok(()) => {
                        report.chunks_sent += 1;
                        delivered = true;
                    }
                    Err(err) => {
                        warn!(
                            "send to {}:{conversation} failed: {err}",
                            transport.channel()
                        );
                        report.send_failures.push(err.to_string());
                    }
                }
            }
            if delivered && self.state.suggestions.record(conversation, segment).await {
                report.suggestion_recorded = true;
            }
        }
        report
    }

    fn segments_for(
        &self,
        result: Result<Value, InvocationError>,
        status_template: &str,
        flow_name: &str,
    ) -> Vec<String> {
        match result {
            Ok(payload) => normalize_payload(&payload, &self.texts.no_content_text),
            Err(InvocationError::Malformed(detail)) => {
                warn!("{flow_name} flow returned malformed payload: {detail}");
                normalize_payload(&Value::Null, &self.texts.no_content_text)
            }
            Err(InvocationError::Status { status, body }) => {
                warn!("{flow_name} flow returned status {status}: {body}");
                vec![status_template.replace("{status}", &status.to_string())]
            }
            Err(InvocationError::Transport(detail)) => {
                info!("{flow_name} flow unreachable: {detail}");
                vec![self.texts.transport_error_text.clone()]
            }
        }
    }
}

pub fn is_chart_image_url(candidate: &str) -> bool {
    let Ok(url) = Url::parse(candidate.trim()) else {
        return false;
    };
    url.scheme() == "https"
        && url.host_str() == Some(CHART_HOST)
        && url.path().starts_with(CHART_PATH_PREFIX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{is_chart_image_url, DeliveryCoordinator, CHART_FILE_NAME};
    use crate::channels::ConversationId;
    use crate::config::DeliveryConfig;
    use crate::flow::payload::DEFAULT_NO_CONTENT_TEXT;
    use crate::flow::InvocationError;
    use crate::state::RelayState;
    use crate::testing::{text_payload, RecordingTransport, ScriptedFlow, SentFile, StaticImages};

    fn coordinator(flow: Arc<ScriptedFlow>) -> DeliveryCoordinator {
        DeliveryCoordinator::new(
            flow,
            Arc::new(RelayState::default()),
            DeliveryConfig::default(),
        )
    }

    #[tokio::test]
    async fn delivers_segments_in_order_and_counts_invocations() {
        let flow = ScriptedFlow::new(vec![
            Ok(text_payload(&["first", "second"])),
            Err(InvocationError::Status {
                status: 500,
                body: "boom".to_owned(),
            }),
            Ok(json!({"outputs": []})),
        ]);
        let coordinator = coordinator(flow.clone());
        let transport = RecordingTransport::with_limit(4_096);
        let conversation = ConversationId::from(7_i64);

        for prompt in ["a", "b", "c"] {
            coordinator
                .handle_prompt(&transport, &conversation, prompt)
                .await;
        }

        assert_eq!(coordinator.state().invocations.read(), 3);
        assert_eq!(
            transport.sent_texts().await,
            vec![
                "first".to_owned(),
                "second".to_owned(),
                "❌ Lỗi API (500)".to_owned(),
                "✅ Langflow không trả về nội dung phù hợp.".to_owned(),
            ]
        );
        assert_eq!(*flow.prompts.lock().await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn transport_and_malformed_failures_become_single_segments() {
        let flow = ScriptedFlow::new(vec![
            Err(InvocationError::Transport("timed out".to_owned())),
            Err(InvocationError::Malformed("expected value".to_owned())),
        ]);
        let coordinator = coordinator(flow);
        let transport = RecordingTransport::with_limit(4_096);
        let conversation = ConversationId::from(1_i64);

        let first = coordinator
            .handle_prompt(&transport, &conversation, "x")
            .await;
        let second = coordinator
            .handle_prompt(&transport, &conversation, "y")
            .await;

        assert_eq!(first.segments, 1);
        assert_eq!(second.segments, 1);
        assert_eq!(
            transport.sent_texts().await,
            vec![
                "❌ Lỗi khi gọi Langflow hoặc xử lý dữ liệu.".to_owned(),
                "✅ Langflow không trả về nội dung phù hợp.".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn blank_configured_text_still_sends_one_message() {
        let flow = ScriptedFlow::new(vec![Ok(json!({"outputs": []}))]);
        let texts = DeliveryConfig {
            no_content_text: "   ".to_owned(),
            ..DeliveryConfig::default()
        };
        let coordinator = DeliveryCoordinator::new(flow, Arc::new(RelayState::default()), texts);
        let transport = RecordingTransport::with_limit(4_096);
        let conversation = ConversationId::from(9_i64);

        let report = coordinator
            .handle_prompt(&transport, &conversation, "anything")
            .await;

        assert_eq!(report.segments, 1);
        assert_eq!(report.chunks_sent, 1);
        assert_eq!(
            transport.sent_texts().await,
            vec![DEFAULT_NO_CONTENT_TEXT.to_owned()]
        );
    }

    #[tokio::test]
    async fn failed_chunk_does_not_stop_remaining_chunks() {
        let flow = ScriptedFlow::new(vec![Ok(text_payload(&["aaaa\nbbbb\ncccc", "tail"]))]);
        let coordinator = coordinator(flow);
        let mut transport = RecordingTransport::with_limit(4);
        transport.fail_texts.insert("bbbb".to_owned());
        let conversation = ConversationId::from(3_i64);

        let report = coordinator
            .handle_prompt(&transport, &conversation, "go")
            .await;

        assert_eq!(report.chunks_sent, 3);
        assert_eq!(report.send_failures.len(), 1);
        assert_eq!(transport.sent_texts().await, vec!["aaaa", "cccc", "tail"]);
    }

    #[tokio::test]
    async fn suggestion_is_recorded_from_full_segment_text() {
        let answer = "Doanh thu tăng 12%.\nBạn có muốn biết thêm: \"Chi phí theo tháng\"";
        let flow = ScriptedFlow::new(vec![Ok(text_payload(&[answer]))]);
        let coordinator = coordinator(flow);
        let transport = RecordingTransport::with_limit(20);
        let conversation = ConversationId::from(42_i64);

        let report = coordinator
            .handle_prompt(&transport, &conversation, "doanh thu?")
            .await;

        assert!(report.chunks_sent >= 2);
        assert!(report.suggestion_recorded);
        assert_eq!(
            coordinator
                .state()
                .suggestions
                .consume(&conversation)
                .await
                .as_deref(),
            Some("Chi phí theo tháng")
        );
    }

    #[tokio::test]
    async fn undelivered_segment_records_no_suggestion() {
        let answer = "Bạn có muốn biết thêm: X";
        let flow = ScriptedFlow::new(vec![Ok(text_payload(&[answer]))]);
        let coordinator = coordinator(flow);
        let mut transport = RecordingTransport::with_limit(4_096);
        transport.fail_texts.insert(answer.to_owned());
        let conversation = ConversationId::from(5_i64);

        let report = coordinator
            .handle_prompt(&transport, &conversation, "q")
            .await;

        assert!(!report.suggestion_recorded);
        assert_eq!(
            coordinator.state().suggestions.consume(&conversation).await,
            None
        );
    }

    #[tokio::test]
    async fn chart_url_is_downloaded_and_sent_as_file() {
        let chat = ScriptedFlow::new(Vec::new());
        let chart = ScriptedFlow::new(vec![Ok(text_payload(&[
            "https://quickchart.io/chart?c={type:'bar'}",
        ]))]);
        let coordinator = coordinator(chat)
            .with_chart_flow(chart, Arc::new(StaticImages(Ok(vec![1, 2, 3]))));
        let transport = RecordingTransport::with_limit(4_096);
        let conversation = ConversationId::from(9_i64);

        let report = coordinator
            .handle_chart(&transport, &conversation, "a,b\n1,2")
            .await;

        assert_eq!(report.chunks_sent, 1);
        assert_eq!(coordinator.state().invocations.read(), 1);
        assert!(transport.sent_texts().await.is_empty());
        assert_eq!(
            *transport.files.lock().await,
            vec![SentFile {
                conversation,
                filename: CHART_FILE_NAME.to_owned(),
                size: 3,
                caption: Some("📈 Biểu đồ được tạo tự động".to_owned()),
            }]
        );
    }

    #[tokio::test]
    async fn chart_download_failure_and_plain_text_answers_go_out_as_text() {
        let chat = ScriptedFlow::new(Vec::new());
        let chart = ScriptedFlow::new(vec![
            Ok(text_payload(&["https://quickchart.io/chart?c=1"])),
            Ok(text_payload(&["Không đủ dữ liệu để vẽ."])),
        ]);
        let coordinator = coordinator(chat).with_chart_flow(
            chart,
            Arc::new(StaticImages(Err(InvocationError::Status {
                status: 404,
                body: String::new(),
            }))),
        );
        let transport = RecordingTransport::with_limit(4_096);
        let conversation = ConversationId::from(9_i64);

        coordinator.handle_chart(&transport, &conversation, "d").await;
        coordinator.handle_chart(&transport, &conversation, "d").await;

        assert_eq!(
            transport.sent_texts().await,
            vec!["❌ Không thể tải ảnh biểu đồ.", "Không đủ dữ liệu để vẽ."]
        );
        assert!(transport.files.lock().await.is_empty());
    }

    #[tokio::test]
    async fn chart_without_flow_sends_notice_and_counts_nothing() {
        let coordinator = coordinator(ScriptedFlow::new(Vec::new()));
        let transport = RecordingTransport::with_limit(4_096);
        let conversation = ConversationId::from(2_i64);

        coordinator.handle_chart(&transport, &conversation, "d").await;

        assert_eq!(coordinator.state().invocations.read(), 0);
        assert_eq!(
            transport.sent_texts().await,
            vec!["⚠️ Chưa cấu hình flow vẽ biểu đồ."]
        );
    }

    #[test]
    fn chart_url_detection_requires_https_quickchart_chart_path() {
        assert!(is_chart_image_url("https://quickchart.io/chart?c={}"));
        assert!(is_chart_image_url(" https://quickchart.io/chart/render/abc "));
        assert!(!is_chart_image_url("http://quickchart.io/chart?c={}"));
        assert!(!is_chart_image_url("https://quickchart.io.evil.test/chart"));
        assert!(!is_chart_image_url("https://quickchart.io/qr?text=1"));
        assert!(!is_chart_image_url("Biểu đồ: https://quickchart.io/chart"));
    }
}
