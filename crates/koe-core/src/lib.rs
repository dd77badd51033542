pub mod clock;
pub mod dialogue;
pub mod errors;
pub mod ids;
pub mod settings;
pub mod summary;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dialogue::{ChatRole, DialogueEngine, HistoryEntry};
pub use errors::DialogueError;
pub use summary::{Category, SummaryRecord};
