//! Turns a finished session into an opinion plus a points award.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use koe_core::clock::Clock;
use koe_core::dialogue::DialogueEngine;
use koe_core::ids::{ChatSessionId, OpinionId};
use koe_core::summary::SummaryRecord;
use koe_store::messages::MessageRepo;
use koe_store::points::REASON_CHAT_OPINION;
use koe_store::sessions::SessionRepo;
use koe_store::{Database, StoreError};

use crate::cache::SessionCache;
use crate::error::ChatError;

#[derive(Clone, Debug)]
pub struct FinalizeOutcome {
    pub session_id: ChatSessionId,
    pub opinion_id: OpinionId,
    pub summary: SummaryRecord,
    pub points_awarded: i64,
    pub total_points: i64,
}

pub struct Finalizer {
    db: Database,
    engine: Arc<dyn DialogueEngine>,
    cache: Arc<dyn SessionCache>,
    clock: Arc<dyn Clock>,
    points_per_opinion: i64,
}

impl Finalizer {
    pub fn new(
        db: Database,
        engine: Arc<dyn DialogueEngine>,
        cache: Arc<dyn SessionCache>,
        clock: Arc<dyn Clock>,
        points_per_opinion: i64,
    ) -> Self {
        Self {
            db,
            engine,
            cache,
            clock,
            points_per_opinion,
        }
    }

    /// Summarize the session and commit the result.
    ///
    /// Nothing is written unless the summary is valid. The session update,
    /// the opinion and the points award commit together or not at all, and
    /// only while the session is still active, so a session is finalized at
    /// most once. `cache_key` is cleared after a successful commit.
    #[instrument(skip(self, cache_key), fields(session_id = %session_id))]
    pub async fn finalize(
        &self,
        session_id: &ChatSessionId,
        cache_key: &str,
    ) -> Result<FinalizeOutcome, ChatError> {
        let sessions = SessionRepo::new(self.db.clone());
        let session = sessions.get(session_id)?;
        if !session.is_active() {
            return Err(ChatError::StaleSession(session_id.clone()));
        }

        let history = MessageRepo::new(self.db.clone()).history(session_id)?;
        let summary = self.engine.extract_summary(&history).await.map_err(|e| {
            warn!(error = %e, kind = e.error_kind(), "summary extraction failed, session left open");
            ChatError::from(e)
        })?;

        let completion = sessions
            .complete_with_opinion(
                session_id,
                &summary,
                self.points_per_opinion,
                REASON_CHAT_OPINION,
                self.clock.now(),
            )
            .map_err(|e| match e {
                StoreError::Conflict(_) => ChatError::StaleSession(session_id.clone()),
                other => other.into(),
            })?;
        self.cache.remove(cache_key);

        info!(
            opinion_id = %completion.opinion_id,
            category = %summary.category,
            total_points = completion.total_points,
            "session finalized"
        );
        Ok(FinalizeOutcome {
            session_id: session_id.clone(),
            opinion_id: completion.opinion_id,
            summary,
            points_awarded: self.points_per_opinion,
            total_points: completion.total_points,
        })
    }
}
