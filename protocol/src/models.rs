use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Role of a message within a session's linear history.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One ordered fragment of a message.
///
/// Tool-call request parts always appear strictly before their matching
/// result parts within a session's history; the orchestrator appends the
/// request when the provider yields it and the result only after the tool
/// has run.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        /// Raw JSON arguments as produced by the provider.
        input: String,
    },
    ToolResult {
        tool_call_id: String,
        name: String,
        content: String,
        is_error: bool,
    },
    Attachment {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub updated_at: i64,
}

impl Message {
    /// Concatenated text content, ignoring tool traffic and attachments.
    pub fn content(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// Append streamed text, coalescing into the trailing text part.
    pub fn append_text(&mut self, delta: &str) {
        if let Some(ContentPart::Text { text }) = self.parts.last_mut() {
            text.push_str(delta);
        } else {
            self.parts.push(ContentPart::Text {
                text: delta.to_string(),
            });
        }
    }

    /// Tool-call request parts in order of appearance.
    pub fn tool_calls(&self) -> Vec<(String, String, String)> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolCall { id, name, input } => {
                    Some((id.clone(), name.clone(), input.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

/// Aggregate token accounting for one provider turn.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub title: String,
    /// Cumulative counters; monotonically non-decreasing for the lifetime of
    /// the session.
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn append_text_coalesces_into_trailing_part() {
        let mut msg = Message {
            id: "m1".into(),
            session_id: "s1".into(),
            role: Role::Assistant,
            parts: Vec::new(),
            created_at: 0,
            updated_at: 0,
        };
        msg.append_text("Hello");
        msg.append_text(", world");
        assert_eq!(msg.parts.len(), 1);
        assert_eq!(msg.content(), "Hello, world");

        msg.parts.push(ContentPart::ToolCall {
            id: "c1".into(),
            name: "shell".into(),
            input: "{}".into(),
        });
        msg.append_text("!");
        assert_eq!(msg.parts.len(), 3);
        assert_eq!(msg.content(), "Hello, world!");
    }

    #[test]
    fn content_part_round_trips_through_json() {
        let part = ContentPart::ToolResult {
            tool_call_id: "c1".into(),
            name: "shell".into(),
            content: "ok".into(),
            is_error: false,
        };
        let json = serde_json::to_string(&part).expect("serialize");
        assert!(json.contains("\"type\":\"tool_result\""));
        let back: ContentPart = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(part, back);
    }
}
