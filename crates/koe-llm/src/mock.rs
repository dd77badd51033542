use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use koe_core::dialogue::{DialogueEngine, HistoryEntry};
use koe_core::errors::DialogueError;
use koe_core::summary::SummaryRecord;

/// Pre-programmed engine output for deterministic tests.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Plain text. For summaries it goes through the strict parser, so
    /// malformed JSON can be scripted too.
    Text(String),
    Error(DialogueError),
    /// Wait, then yield the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    /// Well-formed summary JSON.
    pub fn summary(summary: &str, category: &str, emotion_score: u8) -> Self {
        Self::Text(
            serde_json::json!({
                "summary": summary,
                "category": category,
                "emotion_score": emotion_score,
            })
            .to_string(),
        )
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Engine that replays scripted replies in order. Turn replies and
/// summaries have separate queues; a drained queue yields a transient error.
pub struct MockDialogueEngine {
    turns: Mutex<VecDeque<MockReply>>,
    summaries: Mutex<VecDeque<MockReply>>,
    seen: Mutex<Vec<Vec<HistoryEntry>>>,
    turn_calls: AtomicUsize,
    summary_calls: AtomicUsize,
}

impl MockDialogueEngine {
    pub fn new(turns: Vec<MockReply>, summaries: Vec<MockReply>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            summaries: Mutex::new(summaries.into()),
            seen: Mutex::new(Vec::new()),
            turn_calls: AtomicUsize::new(0),
            summary_calls: AtomicUsize::new(0),
        }
    }

    pub fn push_turn(&self, reply: MockReply) {
        self.turns.lock().push_back(reply);
    }

    pub fn push_summary(&self, reply: MockReply) {
        self.summaries.lock().push_back(reply);
    }

    pub fn turn_calls(&self) -> usize {
        self.turn_calls.load(Ordering::Relaxed)
    }

    pub fn summary_calls(&self) -> usize {
        self.summary_calls.load(Ordering::Relaxed)
    }

    /// Histories passed to `dialog_turn`, in call order.
    pub fn seen_histories(&self) -> Vec<Vec<HistoryEntry>> {
        self.seen.lock().clone()
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve(reply: Option<MockReply>, what: &str) -> Result<String, DialogueError> {
    let mut current = reply
        .ok_or_else(|| DialogueError::Transient(format!("mock: no {what} reply configured")))?;
    loop {
        match current {
            MockReply::Text(text) => return Ok(text),
            MockReply::Error(e) => return Err(e),
            MockReply::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

#[async_trait]
impl DialogueEngine for MockDialogueEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn dialog_turn(
        &self,
        _new_message: &str,
        history: &[HistoryEntry],
    ) -> Result<String, DialogueError> {
        self.turn_calls.fetch_add(1, Ordering::Relaxed);
        self.seen.lock().push(history.to_vec());
        let next = self.turns.lock().pop_front();
        resolve(next, "turn").await
    }

    async fn extract_summary(
        &self,
        _history: &[HistoryEntry],
    ) -> Result<SummaryRecord, DialogueError> {
        self.summary_calls.fetch_add(1, Ordering::Relaxed);
        let next = self.summaries.lock().pop_front();
        let raw = resolve(next, "summary").await?;
        SummaryRecord::parse(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use koe_core::summary::Category;

    #[tokio::test]
    async fn replies_in_sequence() {
        let mock = MockDialogueEngine::new(
            vec![MockReply::text("first"), MockReply::text("second")],
            vec![],
        );
        let h = [HistoryEntry::user("hi")];
        assert_eq!(mock.dialog_turn("hi", &h).await.unwrap(), "first");
        assert_eq!(mock.dialog_turn("hi", &h).await.unwrap(), "second");
        assert_eq!(mock.turn_calls(), 2);
        assert_eq!(mock.seen_histories().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_queue_is_transient() {
        let mock = MockDialogueEngine::new(vec![], vec![]);
        let err = mock.dialog_turn("hi", &[]).await.unwrap_err();
        assert!(err.is_transient());
        let err = mock.extract_summary(&[]).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn summaries_are_parsed_strictly() {
        let mock = MockDialogueEngine::new(
            vec![],
            vec![MockReply::text("not json"), MockReply::summary("Buses", "交通", 6)],
        );
        let err = mock.extract_summary(&[]).await.unwrap_err();
        assert!(matches!(err, DialogueError::MalformedOutput(_)));

        let ok = mock.extract_summary(&[]).await.unwrap();
        assert_eq!(ok.category, Category::Transportation);
        assert_eq!(ok.emotion_score, 6);
        assert_eq!(mock.summary_calls(), 2);
    }

    #[tokio::test]
    async fn scripted_error_is_returned() {
        let mock = MockDialogueEngine::new(
            vec![MockReply::Error(DialogueError::Timeout(Duration::from_secs(30)))],
            vec![],
        );
        let err = mock.dialog_turn("hi", &[]).await.unwrap_err();
        assert!(matches!(err, DialogueError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_reply_waits() {
        let mock = MockDialogueEngine::new(
            vec![MockReply::delayed(Duration::from_secs(5), MockReply::text("late"))],
            vec![],
        );
        let start = tokio::time::Instant::now();
        assert_eq!(mock.dialog_turn("hi", &[]).await.unwrap(), "late");
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn pushed_replies_are_appended() {
        let mock = MockDialogueEngine::new(vec![], vec![]);
        mock.push_turn(MockReply::text("added"));
        mock.push_summary(MockReply::summary("Parks", "environment", 3));
        assert_eq!(mock.dialog_turn("x", &[]).await.unwrap(), "added");
        assert_eq!(mock.extract_summary(&[]).await.unwrap().category, Category::Environment);
    }
}
