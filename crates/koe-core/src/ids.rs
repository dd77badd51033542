use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(UserId, "usr");
branded_id!(ChatSessionId, "chat");
branded_id!(MessageId, "msg");
branded_id!(OpinionId, "op");
branded_id!(LedgerEntryId, "pts");
branded_id!(AnalysisRunId, "run");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes() {
        assert!(UserId::new().as_str().starts_with("usr_"));
        assert!(ChatSessionId::new().as_str().starts_with("chat_"));
        assert!(MessageId::new().as_str().starts_with("msg_"));
        assert!(OpinionId::new().as_str().starts_with("op_"));
        assert!(LedgerEntryId::new().as_str().starts_with("pts_"));
        assert!(AnalysisRunId::new().as_str().starts_with("run_"));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(ChatSessionId::new(), ChatSessionId::new());
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = OpinionId::from_raw("op_legacy");
        assert_eq!(id.as_str(), "op_legacy");
        assert_eq!(id.to_string(), "op_legacy");
    }

    #[test]
    fn creation_order_sorts_lexically() {
        let ids: Vec<ChatSessionId> = (0..50).map(|_| ChatSessionId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
