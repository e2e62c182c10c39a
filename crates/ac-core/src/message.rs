// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The persisted conversation domain model.
//!
//! This is distinct from [`ac_model::Message`], which is the wire-level
//! request/response shape exchanged with a streaming provider. This type is
//! what the session log stores and the context pipeline operates on; the
//! agent loop converts between the two only at the provider boundary.
use serde::{Deserialize, Serialize};

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One block of message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Only ever appears in `assistant` messages.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Only ever appears in `user` messages.
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        content: String,
    },
}

impl ContentBlock {
    pub fn text(s: impl Into<String>) -> Self {
        ContentBlock::Text { text: s.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        name: Option<String>,
        content: impl Into<String>,
    ) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            name,
            content: content.into(),
        }
    }

    /// Approximate serialized character length, for token estimation.
    pub fn char_len(&self) -> usize {
        match self {
            ContentBlock::Text { text } => text.len(),
            ContentBlock::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
            ContentBlock::ToolResult { content, .. } => content.len(),
        }
    }
}

/// A single message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            role: Role::User,
            timestamp,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant_text(text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            role: Role::Assistant,
            timestamp,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn user_tool_results(blocks: Vec<ContentBlock>, timestamp: i64) -> Self {
        debug_assert!(
            blocks.iter().all(|b| matches!(b, ContentBlock::ToolResult { .. })),
            "user_tool_results must only contain tool_result blocks"
        );
        Self {
            role: Role::User,
            timestamp,
            content: blocks,
        }
    }

    /// `true` iff this message is a `user` message wholly composed of
    /// `tool_result` blocks — the shape the result guard treats specially.
    pub fn is_tool_result_message(&self) -> bool {
        self.role == Role::User
            && !self.content.is_empty()
            && self
                .content
                .iter()
                .all(|b| matches!(b, ContentBlock::ToolResult { .. }))
    }

    /// All `tool_use` ids carried by this message, in order.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// All `tool_result` ids carried by this message, in order.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Plain-text rendering (first text block, if any).
    pub fn as_text(&self) -> Option<&str> {
        self.content.iter().find_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }

    /// Characters/4 token estimate, summed across blocks.
    pub fn approx_tokens(&self) -> usize {
        let chars: usize = self.content.iter().map(ContentBlock::char_len).sum();
        (chars.max(1)).div_ceil(4)
    }

    /// Total serialized character length across blocks, used by the pruning
    /// layer's char-budget accounting.
    pub fn char_len(&self) -> usize {
        self.content.iter().map(ContentBlock::char_len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_text_builds_single_text_block() {
        let m = Message::user_text("hi", 0);
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hi"));
    }

    #[test]
    fn tool_use_ids_extracted_in_order() {
        let m = Message {
            role: Role::Assistant,
            timestamp: 0,
            content: vec![
                ContentBlock::tool_use("a", "read", serde_json::json!({})),
                ContentBlock::tool_use("b", "write", serde_json::json!({})),
            ],
        };
        assert_eq!(m.tool_use_ids(), vec!["a", "b"]);
    }

    #[test]
    fn is_tool_result_message_true_only_for_all_tool_result_blocks() {
        let m = Message::user_tool_results(
            vec![ContentBlock::tool_result("a", None, "ok")],
            0,
        );
        assert!(m.is_tool_result_message());

        let mixed = Message {
            role: Role::User,
            timestamp: 0,
            content: vec![ContentBlock::text("hi")],
        };
        assert!(!mixed.is_tool_result_message());
    }

    #[test]
    fn approx_tokens_divides_chars_by_four_rounding_up() {
        let m = Message::user_text("12345678", 0);
        assert_eq!(m.approx_tokens(), 2);
        let m2 = Message::user_text("123456789", 0);
        assert_eq!(m2.approx_tokens(), 3);
    }

    #[test]
    fn approx_tokens_empty_message_is_at_least_one() {
        let m = Message {
            role: Role::User,
            timestamp: 0,
            content: vec![],
        };
        assert_eq!(m.approx_tokens(), 1);
    }

    #[test]
    fn serde_round_trip_preserves_tool_use_block() {
        let m = Message {
            role: Role::Assistant,
            timestamp: 42,
            content: vec![ContentBlock::tool_use("x1", "shell", serde_json::json!({"cmd": "ls"}))],
        };
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_use_ids(), vec!["x1"]);
    }
}
