use serde::{Deserialize, Serialize};

use crate::domain::ContextSummary;

/// Server frame of a streamed turn.
///
/// A turn emits its context summary, zero or more tokens in generation
/// order, and ends with exactly one `Done`. `Error` frames report turns that
/// could not run at all (empty message, busy session).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Token { content: String },
    Context { bundle: ContextSummary },
    Error { detail: String },
    Done,
}

impl TurnEvent {
    pub fn token(content: impl Into<String>) -> Self {
        TurnEvent::Token {
            content: content.into(),
        }
    }

    pub fn error(detail: impl ToString) -> Self {
        TurnEvent::Error {
            detail: detail.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_shapes() {
        assert_eq!(
            serde_json::to_value(TurnEvent::token("Hi")).unwrap(),
            json!({"type": "token", "content": "Hi"})
        );
        assert_eq!(serde_json::to_value(TurnEvent::Done).unwrap(), json!({"type": "done"}));
        assert_eq!(
            serde_json::to_value(TurnEvent::error("busy")).unwrap(),
            json!({"type": "error", "detail": "busy"})
        );
    }
}
