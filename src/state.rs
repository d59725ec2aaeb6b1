use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

use crate::channels::ConversationId;

pub const DEFAULT_SUGGESTION_MARKER: &str = "Bạn có muốn biết thêm:";

const SUGGESTION_QUOTES: &[char] = &['"', '“', '”'];

pub struct RelayState {
    pub suggestions: SuggestionTracker,
    pub invocations: InvocationCounter,
}

impl RelayState {
    pub fn new(suggestion_marker: &str) -> Self {
        Self {
            suggestions: SuggestionTracker::new(suggestion_marker),
            invocations: InvocationCounter::default(),
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(DEFAULT_SUGGESTION_MARKER)
    }
}

/// Latest suggested follow-up per conversation.
///
/// Last write wins: two prompts in flight for the same conversation race, and the
/// one that finishes delivering last decides the stored suggestion.
pub struct SuggestionTracker {
    marker: String,
    entries: RwLock<HashMap<ConversationId, String>>,
}

impl SuggestionTracker {
    pub fn new(marker: &str) -> Self {
        Self {
            marker: marker.to_owned(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn record(&self, conversation: &ConversationId, delivered_text: &str) -> bool {
        let Some(suggestion) = extract_suggestion(delivered_text, &self.marker) else {
            return false;
        };
        debug!("suggestion stored for conversation {conversation}");
        self.entries
            .write()
            .await
            .insert(conversation.clone(), suggestion);
        true
    }

    /// Returns the pending suggestion without clearing it.
    pub async fn consume(&self, conversation: &ConversationId) -> Option<String> {
        self.entries.read().await.get(conversation).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

pub fn extract_suggestion(text: &str, marker: &str) -> Option<String> {
    if marker.trim().is_empty() {
        return None;
    }
    let marker: String = marker.nfc().collect();
    let normalized: String = text.nfc().collect();
    let mut parts = normalized.split(marker.as_str());
    parts.next()?;
    let tail = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let suggestion =
        tail.trim_matches(|ch: char| ch.is_whitespace() || SUGGESTION_QUOTES.contains(&ch));
    if suggestion.is_empty() {
        None
    } else {
        Some(suggestion.to_owned())
    }
}

#[derive(Debug, Default)]
pub struct InvocationCounter {
    count: AtomicU64,
}

impl InvocationCounter {
    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use unicode_normalization::UnicodeNormalization;

    use super::{extract_suggestion, InvocationCounter, RelayState, DEFAULT_SUGGESTION_MARKER};
    use crate::channels::ConversationId;

    #[tokio::test]
    async fn records_quoted_suggestion_for_conversation() {
        let state = RelayState::default();
        let conversation = ConversationId::from(42_i64);
        let stored = state
            .suggestions
            .record(&conversation, "Bạn có muốn biết thêm: \"what next\"")
            .await;
        assert!(stored);
        assert_eq!(
            state.suggestions.consume(&conversation).await.as_deref(),
            Some("what next")
        );
        assert_eq!(
            state.suggestions.consume(&conversation).await.as_deref(),
            Some("what next")
        );
    }

    #[tokio::test]
    async fn text_without_marker_leaves_existing_entry_untouched() {
        let state = RelayState::default();
        let conversation = ConversationId::from("chan-1");
        state
            .suggestions
            .record(&conversation, "Kết quả.\nBạn có muốn biết thêm: “Doanh thu theo quý”")
            .await;
        let stored = state
            .suggestions
            .record(&conversation, "Một câu trả lời bình thường")
            .await;
        assert!(!stored);
        assert_eq!(
            state.suggestions.consume(&conversation).await.as_deref(),
            Some("Doanh thu theo quý")
        );
    }

    #[tokio::test]
    async fn newer_suggestion_overwrites_and_conversations_are_isolated() {
        let state = RelayState::default();
        let first = ConversationId::from(1_i64);
        let second = ConversationId::from(2_i64);
        state
            .suggestions
            .record(&first, "Bạn có muốn biết thêm: A")
            .await;
        state
            .suggestions
            .record(&first, "Bạn có muốn biết thêm: B")
            .await;
        assert_eq!(state.suggestions.consume(&first).await.as_deref(), Some("B"));
        assert_eq!(state.suggestions.consume(&second).await, None);
        assert_eq!(state.suggestions.len().await, 1);
    }

    #[test]
    fn marker_without_content_or_repeated_marker_records_nothing() {
        let marker = DEFAULT_SUGGESTION_MARKER;
        assert_eq!(extract_suggestion("Bạn có muốn biết thêm:   \"\" ", marker), None);
        assert_eq!(
            extract_suggestion(
                "Bạn có muốn biết thêm: x Bạn có muốn biết thêm: y",
                marker
            ),
            None
        );
        assert_eq!(extract_suggestion("no marker here", marker), None);
        assert_eq!(extract_suggestion("anything", ""), None);
    }

    #[test]
    fn decomposed_vietnamese_text_still_matches_marker() {
        let decomposed: String = "Bạn có muốn biết thêm: \"So sánh tháng trước\""
            .nfd()
            .collect();
        assert_ne!(decomposed, "Bạn có muốn biết thêm: \"So sánh tháng trước\"");
        assert_eq!(
            extract_suggestion(&decomposed, DEFAULT_SUGGESTION_MARKER).as_deref(),
            Some("So sánh tháng trước")
        );
    }

    #[tokio::test]
    async fn counter_is_monotonic_under_concurrent_increments() {
        let counter = Arc::new(InvocationCounter::default());
        assert_eq!(counter.read(), 0);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..125 {
                    counter.increment();
                }
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(counter.read(), 1_000);
    }
}
