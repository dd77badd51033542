//! User-facing message texts.

use crate::finalizer::FinalizeOutcome;

pub const HELP_COMMAND: &str = "/help";
pub const RESET_COMMAND: &str = "/reset";
pub const POINT_COMMAND: &str = "/point";

pub fn apology() -> String {
    format!("Sorry, something went wrong. Please try again, or send {RESET_COMMAND} to start over.")
}

pub fn turns_remaining(remaining: u32) -> String {
    format!("({remaining} more question(s) before I summarize your opinion)")
}

pub fn closing(outcome: &FinalizeOutcome) -> String {
    format!(
        "Thank you for your feedback!\n\n\
         Your opinion:\n{}\n\n\
         Category: {}\n\n\
         {} points awarded. Total: {} pt\n\n\
         Feel free to share more anytime.",
        outcome.summary.summary,
        outcome.summary.category.native_label(),
        outcome.points_awarded,
        outcome.total_points,
    )
}

/// Sent when the last turn was recorded but the summary could not be made
/// yet. The session stays open and the next message retries.
pub fn finalize_pending() -> String {
    "Thank you! I couldn't put your opinion together just now. Send any message to try again.".to_string()
}

pub fn reset_done() -> String {
    "The conversation has been reset. Tell me what's on your mind.".to_string()
}

pub fn help() -> String {
    format!(
        "Commands:\n\n\
         {HELP_COMMAND} - show this help\n\
         {RESET_COMMAND} - start the conversation over\n\
         {POINT_COMMAND} - show your points\n\n\
         Send a message and I will ask a few questions to understand your opinion. \
         When the conversation is done, your opinion is saved and points are awarded."
    )
}

pub fn points_balance(total: i64) -> String {
    format!(
        "Your points\n\n\
         Total: {total} pt\n\n\
         Thank you for your help! Feel free to share more about the city anytime."
    )
}

pub fn unknown_command(command: &str) -> String {
    format!("Unknown command: {command}\nSend {HELP_COMMAND} to see the available commands.")
}

pub fn empty_input() -> String {
    "Please send your opinion as a text message.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use koe_core::ids::{ChatSessionId, OpinionId};
    use koe_core::summary::{Category, SummaryRecord};

    #[test]
    fn apology_mentions_reset() {
        assert!(apology().contains(RESET_COMMAND));
    }

    #[test]
    fn help_lists_every_command() {
        let text = help();
        for command in [HELP_COMMAND, RESET_COMMAND, POINT_COMMAND] {
            assert!(text.contains(command), "missing {command}");
        }
    }

    #[test]
    fn unknown_command_points_at_help() {
        let text = unknown_command("/points");
        assert!(text.contains("/points"));
        assert!(text.contains(HELP_COMMAND));
    }

    #[test]
    fn closing_includes_category_and_points() {
        let outcome = FinalizeOutcome {
            session_id: ChatSessionId::new(),
            opinion_id: OpinionId::new(),
            summary: SummaryRecord {
                summary: "Needs more benches".into(),
                category: Category::Welfare,
                emotion_score: 3,
            },
            points_awarded: 10,
            total_points: 30,
        };
        let text = closing(&outcome);
        assert!(text.contains("Needs more benches"));
        assert!(text.contains("福祉"));
        assert!(text.contains("10 points"));
        assert!(text.contains("30 pt"));
    }
}
