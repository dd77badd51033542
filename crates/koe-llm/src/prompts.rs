//! System prompts for the two engine modes.

use koe_core::dialogue::HistoryEntry;
use koe_core::summary::{Category, MAX_EMOTION_SCORE};

/// Conversational mode: draw out the citizen's concern with short, open
/// follow-up questions.
pub const CHAT_SYSTEM_PROMPT: &str = "\
You are a friendly listener collecting feedback from residents for their city office.
Reply in the resident's language, in at most 150 characters.
Acknowledge what they said, then ask one open question that makes their concern more concrete
(where, when, who is affected, what would help).
Do not promise actions on behalf of the city and do not give legal or medical advice.";

/// Summary mode prompt, with the closed category list and score range
/// spelled out.
pub fn summary_system_prompt() -> String {
    let labels: Vec<&str> = Category::ALL.iter().map(|c| c.native_label()).collect();
    format!(
        "You summarize a conversation between a resident and a city feedback assistant.\n\
         Answer with a single JSON object and nothing else:\n\
         {{\"summary\": \"<one or two sentences stating the resident's opinion>\", \
         \"category\": \"<one of: {}>\", \
         \"emotion_score\": <integer 0-{}, higher means a stronger complaint or request>}}",
        labels.join(", "),
        MAX_EMOTION_SCORE,
    )
}

/// Flatten a history into the transcript handed to summary mode.
pub fn transcript(history: &[HistoryEntry]) -> String {
    history
        .iter()
        .map(|entry| format!("{}: {}", entry.role, entry.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_prompt_lists_every_category() {
        let prompt = summary_system_prompt();
        for c in Category::ALL {
            assert!(prompt.contains(c.native_label()), "missing {c}");
        }
        assert!(prompt.contains("0-10"));
    }

    #[test]
    fn transcript_keeps_order_and_roles() {
        let history = vec![
            HistoryEntry::user("The playground swings are rusty"),
            HistoryEntry::assistant("Which park is that?"),
        ];
        assert_eq!(
            transcript(&history),
            "user: The playground swings are rusty\nassistant: Which park is that?"
        );
    }
}
