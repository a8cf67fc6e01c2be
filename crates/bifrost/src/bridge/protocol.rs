//! Wire protocol types for host-companion communication.
//!
//! Two directions:
//! - **Input** (host → companion stdin): framed JSON [`DispatchRequest`]
//! - **Output** (companion stdout → host): newline-delimited text. JSON lines
//!   whose `type` is [`COMPLETION_MARKER`] end the current run; everything else
//!   is log output.

use serde::{Deserialize, Serialize};

/// Reserved `type` value announcing that the companion finished a run.
pub const COMPLETION_MARKER: &str = "done";

/// Script dispatch sent to the companion inside one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub script: String,
}

impl DispatchRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

/// Structured message written by the companion on a single stdout line.
///
/// Only `type` is interpreted by the host; remaining fields are carried along
/// for logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanionMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl CompanionMessage {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn done() -> Self {
        Self::new(COMPLETION_MARKER)
    }

    pub fn with_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn is_completion(&self) -> bool {
        self.kind == COMPLETION_MARKER
    }
}

/// Classification of one line read from the companion's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    /// Blank or whitespace-only line.
    Empty,
    /// Completion marker for the active run.
    Completion,
    /// Structured message of any other type.
    Message(CompanionMessage),
    /// Anything that is not a typed JSON object.
    Text(String),
}

impl OutputLine {
    pub fn classify(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Self::Empty;
        }
        match serde_json::from_str::<CompanionMessage>(trimmed) {
            Ok(msg) if msg.is_completion() => Self::Completion,
            Ok(msg) => Self::Message(msg),
            Err(_) => Self::Text(trimmed.to_string()),
        }
    }

    pub fn is_completion(&self) -> bool {
        matches!(self, Self::Completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatch_request_serializes() {
        let req = DispatchRequest::new("console.log(1)");
        insta::assert_json_snapshot!(req);
    }

    #[test]
    fn done_message_serializes() {
        let msg = CompanionMessage::done();
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"type":"done"}"#);
    }

    #[test]
    fn message_with_fields_serializes() {
        let msg = CompanionMessage::new("log")
            .with_field("level", "warn")
            .with_field("message", "slow slice");
        insta::assert_json_snapshot!(msg);
    }

    #[test]
    fn classify_completion() {
        assert_eq!(OutputLine::classify(r#"{"type":"done"}"#), OutputLine::Completion);
        assert_eq!(
            OutputLine::classify("  {\"type\": \"done\", \"extra\": 1}\n"),
            OutputLine::Completion
        );
    }

    #[test]
    fn classify_other_typed_message() {
        let line = OutputLine::classify(r#"{"type":"progress","value":0.5}"#);
        match line {
            OutputLine::Message(msg) => {
                assert_eq!(msg.kind, "progress");
                assert_eq!(msg.fields.get("value"), Some(&json!(0.5)));
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn classify_untyped_json_is_text() {
        assert_eq!(
            OutputLine::classify(r#"{"status":"done"}"#),
            OutputLine::Text(r#"{"status":"done"}"#.to_string())
        );
        assert_eq!(OutputLine::classify("42"), OutputLine::Text("42".to_string()));
        assert_eq!(
            OutputLine::classify(r#"{"type":5}"#),
            OutputLine::Text(r#"{"type":5}"#.to_string())
        );
    }

    #[test]
    fn classify_plain_text_and_blank() {
        assert_eq!(
            OutputLine::classify("hello from node\n"),
            OutputLine::Text("hello from node".to_string())
        );
        assert_eq!(OutputLine::classify(""), OutputLine::Empty);
        assert_eq!(OutputLine::classify("   \r\n"), OutputLine::Empty);
        assert!(!OutputLine::classify("done").is_completion());
    }
}
