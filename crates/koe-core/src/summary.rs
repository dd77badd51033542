//! Structured summary produced at finalize time, with strict validation of
//! whatever the engine returned.

use serde::{Deserialize, Serialize};

use crate::errors::DialogueError;

pub const MAX_EMOTION_SCORE: u8 = 10;

/// Closed set of opinion categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Transportation,
    Welfare,
    Education,
    Environment,
    Childcare,
    Healthcare,
    DisasterPrevention,
    Other,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Self::Transportation,
        Self::Welfare,
        Self::Education,
        Self::Environment,
        Self::Childcare,
        Self::Healthcare,
        Self::DisasterPrevention,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transportation => "transportation",
            Self::Welfare => "welfare",
            Self::Education => "education",
            Self::Environment => "environment",
            Self::Childcare => "childcare",
            Self::Healthcare => "healthcare",
            Self::DisasterPrevention => "disaster_prevention",
            Self::Other => "other",
        }
    }

    /// Label the engine is prompted with (and usually answers in).
    pub fn native_label(&self) -> &'static str {
        match self {
            Self::Transportation => "交通",
            Self::Welfare => "福祉",
            Self::Education => "教育",
            Self::Environment => "環境",
            Self::Childcare => "子育て",
            Self::Healthcare => "医療",
            Self::DisasterPrevention => "防災",
            Self::Other => "その他",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s) || c.native_label() == s)
            .ok_or_else(|| format!("unknown category: {s}"))
    }
}

/// Validated `{summary, category, emotion_score}` record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub summary: String,
    pub category: Category,
    pub emotion_score: u8,
}

#[derive(Deserialize)]
struct RawSummary {
    summary: serde_json::Value,
    category: serde_json::Value,
    emotion_score: serde_json::Value,
}

impl SummaryRecord {
    /// Parse raw engine text. Any deviation from the expected shape is a
    /// `MalformedOutput`, never a panic.
    pub fn parse(raw: &str) -> Result<Self, DialogueError> {
        let body = strip_code_fence(raw.trim());
        let raw: RawSummary = serde_json::from_str(body)
            .map_err(|e| DialogueError::MalformedOutput(format!("not a summary object: {e}")))?;
        Self::from_parts(&raw.summary, &raw.category, &raw.emotion_score)
    }

    fn from_parts(
        summary: &serde_json::Value,
        category: &serde_json::Value,
        emotion_score: &serde_json::Value,
    ) -> Result<Self, DialogueError> {
        let summary = summary
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DialogueError::MalformedOutput("summary must be non-empty text".into()))?;

        let category = category
            .as_str()
            .ok_or_else(|| DialogueError::MalformedOutput("category must be text".into()))?
            .parse::<Category>()
            .map_err(DialogueError::MalformedOutput)?;

        let emotion_score = emotion_score
            .as_u64()
            .filter(|n| *n <= u64::from(MAX_EMOTION_SCORE))
            .ok_or_else(|| {
                DialogueError::MalformedOutput(format!(
                    "emotion_score must be an integer 0-{MAX_EMOTION_SCORE}, got {emotion_score}"
                ))
            })? as u8;

        Ok(Self {
            summary: summary.to_string(),
            category,
            emotion_score,
        })
    }
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
