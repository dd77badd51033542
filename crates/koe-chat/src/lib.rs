pub mod cache;
pub mod commands;
pub mod error;
pub mod finalizer;
pub mod orchestrator;
pub mod replies;

pub use cache::{NoopCache, SessionCache, TtlSessionCache};
pub use commands::ChatCommand;
pub use error::ChatError;
pub use finalizer::{FinalizeOutcome, Finalizer};
pub use orchestrator::{ChatConfig, ConversationOrchestrator};
