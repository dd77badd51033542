pub mod mock;
pub mod ollama;
pub mod prompts;

pub use mock::{MockDialogueEngine, MockReply};
pub use ollama::OllamaEngine;
