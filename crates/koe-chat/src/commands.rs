//! Slash commands. Any message starting with `/` is a command, is matched
//! case-insensitively, and never reaches the dialogue engine.

use crate::replies::{HELP_COMMAND, POINT_COMMAND, RESET_COMMAND};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatCommand {
    Help,
    Reset,
    Point,
    /// Holds the lowercased command text.
    Unknown(String),
}

impl ChatCommand {
    /// `None` for ordinary text.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }
        let command = text.to_lowercase();
        Some(match command.as_str() {
            HELP_COMMAND => Self::Help,
            RESET_COMMAND => Self::Reset,
            POINT_COMMAND => Self::Point,
            _ => Self::Unknown(command),
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Help => HELP_COMMAND,
            Self::Reset => RESET_COMMAND,
            Self::Point => POINT_COMMAND,
            Self::Unknown(command) => command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(ChatCommand::parse("the park needs lights"), None);
        assert_eq!(ChatCommand::parse("1/2 of the lights are out"), None);
    }

    #[test]
    fn known_commands_ignore_case_and_whitespace() {
        assert_eq!(ChatCommand::parse("/help"), Some(ChatCommand::Help));
        assert_eq!(ChatCommand::parse("  /RESET "), Some(ChatCommand::Reset));
        assert_eq!(ChatCommand::parse("/Point"), Some(ChatCommand::Point));
    }

    #[test]
    fn anything_else_with_a_slash_is_unknown() {
        assert_eq!(
            ChatCommand::parse("/Points"),
            Some(ChatCommand::Unknown("/points".into()))
        );
        assert_eq!(
            ChatCommand::parse("/reset now"),
            Some(ChatCommand::Unknown("/reset now".into()))
        );
        assert_eq!(ChatCommand::parse("/"), Some(ChatCommand::Unknown("/".into())));
    }
}
