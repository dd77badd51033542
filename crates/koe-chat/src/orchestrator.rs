//! Conversation orchestrator: resolves the canonical session for a user,
//! drives one turn, and finalizes when the turn cap is reached.
//!
//! All cross-process correctness lives in the store. The cache only saves
//! the resolution transaction on the common path, and every hit is checked
//! against the store before use.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use tracing::{debug, error, info, instrument, warn};

use koe_core::clock::Clock;
use koe_core::dialogue::{ChatRole, DialogueEngine, HistoryEntry};
use koe_core::settings::ChatSettings;
use koe_store::messages::MessageRepo;
use koe_store::sessions::{ChatSessionRow, SessionRepo};
use koe_store::users::{hash_identity, UserRepo};
use koe_store::{Database, StoreError};

use crate::cache::SessionCache;
use crate::commands::ChatCommand;
use crate::error::ChatError;
use crate::finalizer::Finalizer;
use crate::replies;

#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub max_turns: u32,
    pub session_timeout: Duration,
    pub points_per_opinion: i64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::from(&ChatSettings::default())
    }
}

impl From<&ChatSettings> for ChatConfig {
    fn from(settings: &ChatSettings) -> Self {
        Self {
            max_turns: settings.max_turns,
            session_timeout: settings.session_timeout(),
            points_per_opinion: settings.points_per_opinion,
        }
    }
}

pub struct ConversationOrchestrator {
    db: Database,
    engine: Arc<dyn DialogueEngine>,
    cache: Arc<dyn SessionCache>,
    clock: Arc<dyn Clock>,
    finalizer: Finalizer,
    salt: SecretString,
    config: ChatConfig,
}

impl ConversationOrchestrator {
    pub fn new(
        db: Database,
        engine: Arc<dyn DialogueEngine>,
        cache: Arc<dyn SessionCache>,
        clock: Arc<dyn Clock>,
        salt: SecretString,
        config: ChatConfig,
    ) -> Self {
        let finalizer = Finalizer::new(
            db.clone(),
            Arc::clone(&engine),
            Arc::clone(&cache),
            Arc::clone(&clock),
            config.points_per_opinion,
        );
        Self {
            db,
            engine,
            cache,
            clock,
            finalizer,
            salt,
            config,
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Short salted digest used to correlate log lines without recording
    /// the platform id.
    fn log_key(&self, platform_user_id: &str) -> String {
        let mut key = hash_identity(platform_user_id, &self.salt);
        key.truncate(12);
        key
    }

    /// Handle one inbound message and return the outgoing text segments in
    /// delivery order. Never fails: any error becomes a single apology with
    /// a reset hint, and the session is left as it was.
    #[instrument(skip_all, fields(user = %self.log_key(platform_user_id)))]
    pub async fn handle_message(&self, platform_user_id: &str, text: &str) -> Vec<String> {
        let text = text.trim();
        if let Some(command) = ChatCommand::parse(text) {
            return self.run_command(platform_user_id, &command);
        }
        if text.is_empty() {
            return vec![replies::empty_input()];
        }

        match self.run_turn(platform_user_id, text).await {
            Ok(segments) => segments,
            Err(e) => {
                match &e {
                    ChatError::Dialogue(d) if d.is_transient() => {
                        warn!(error = %e, kind = e.error_kind(), "turn failed")
                    }
                    _ => error!(error = %e, kind = e.error_kind(), "turn failed"),
                }
                vec![replies::apology()]
            }
        }
    }

    /// Commands never touch the dialogue engine or count as a turn.
    fn run_command(&self, platform_user_id: &str, command: &ChatCommand) -> Vec<String> {
        let reply = match command {
            ChatCommand::Help => Ok(replies::help()),
            ChatCommand::Reset => self.reset(platform_user_id).map(|_| replies::reset_done()),
            ChatCommand::Point => self.points(platform_user_id).map(replies::points_balance),
            ChatCommand::Unknown(text) => {
                debug!(command = %text, "unknown command");
                Ok(replies::unknown_command(text))
            }
        };
        match reply {
            Ok(text) => vec![text],
            Err(e) => {
                error!(command = command.as_str(), error = %e, kind = e.error_kind(), "command failed");
                vec![replies::apology()]
            }
        }
    }

    /// Current points balance. First contact creates the user with zero.
    #[instrument(skip_all, fields(user = %self.log_key(platform_user_id)))]
    pub fn points(&self, platform_user_id: &str) -> Result<i64, ChatError> {
        let user = UserRepo::new(self.db.clone()).get_or_create(
            platform_user_id,
            &self.salt,
            self.clock.now(),
        )?;
        Ok(user.total_points)
    }

    /// Abandon the user's active sessions and forget the cached pointer, so
    /// the next message starts a fresh session.
    #[instrument(skip_all, fields(user = %self.log_key(platform_user_id)))]
    pub fn reset(&self, platform_user_id: &str) -> Result<usize, ChatError> {
        self.cache.remove(platform_user_id);
        let user = UserRepo::new(self.db.clone()).get_or_create(
            platform_user_id,
            &self.salt,
            self.clock.now(),
        )?;
        let abandoned = SessionRepo::new(self.db.clone()).abandon_all_active(&user.id)?;
        info!(abandoned, "chat reset");
        Ok(abandoned)
    }

    async fn run_turn(&self, platform_user_id: &str, text: &str) -> Result<Vec<String>, ChatError> {
        let max_turns = self.config.max_turns;
        let sessions = SessionRepo::new(self.db.clone());
        let session = self.resolve_session(platform_user_id, self.clock.now())?;

        if session.turn_count >= max_turns {
            // Cap already reached but the session was never closed. Keep the
            // message and only finalize.
            info!(session_id = %session.id, turn_count = session.turn_count, "finalizing capped session");
            sessions.append_message(&session.id, ChatRole::User, text, self.clock.now())?;
            let outcome = self.finalizer.finalize(&session.id, platform_user_id).await?;
            return Ok(vec![replies::closing(&outcome)]);
        }

        let mut history = MessageRepo::new(self.db.clone()).history(&session.id)?;
        history.push(HistoryEntry::user(text));
        let reply = self.engine.dialog_turn(text, &history).await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(ChatError::empty_reply());
        }

        let turn = sessions
            .record_turn(
                &session.id,
                session.turn_count,
                max_turns,
                text,
                reply,
                self.clock.now(),
            )
            .map_err(|e| match e {
                StoreError::Conflict(_) => ChatError::StaleSession(session.id.clone()),
                other => other.into(),
            })?;
        self.cache.put(platform_user_id, &session.id, &session.user_id);
        debug!(session_id = %session.id, turn_count = turn, "turn recorded");

        let mut segments = vec![reply.to_string()];
        if turn >= max_turns {
            match self.finalizer.finalize(&session.id, platform_user_id).await {
                Ok(outcome) => segments.push(replies::closing(&outcome)),
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "finalize deferred to next message");
                    segments.push(replies::finalize_pending());
                }
            }
        } else {
            segments.push(replies::turns_remaining(max_turns - turn));
        }
        Ok(segments)
    }

    /// Resolve the single active session for a user.
    ///
    /// A cache hit is used only if the store still shows that session as the
    /// user's one active, unexpired session. Anything else falls through to
    /// the store transaction, which collapses duplicates, expires idle
    /// sessions and creates a new one if needed.
    fn resolve_session(&self, platform_user_id: &str, now: DateTime<Utc>) -> Result<ChatSessionRow, ChatError> {
        let sessions = SessionRepo::new(self.db.clone());
        let timeout = self.config.session_timeout;

        if let Some(entry) = self.cache.get(platform_user_id) {
            let active = sessions.list_active(&entry.user_id)?;
            match active.as_slice() {
                [only] if only.id == entry.session_id && !only.is_expired(now, timeout) => {
                    return Ok(only.clone());
                }
                _ => {
                    debug!(session_id = %entry.session_id, "cached session no longer canonical");
                    self.cache.remove(platform_user_id);
                }
            }
        }

        let user = UserRepo::new(self.db.clone()).get_or_create(platform_user_id, &self.salt, now)?;
        let resolved = sessions.resolve_active(&user.id, now, timeout)?;
        if resolved.created {
            info!(session_id = %resolved.session.id, "chat session started");
        }
        self.cache.put(platform_user_id, &resolved.session.id, &user.id);
        Ok(resolved.session)
    }
}
