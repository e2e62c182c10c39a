// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use ac_config::CancelToken;

use crate::policy::ApprovalPolicy;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// Execution context threaded into every tool invocation (spec.md §6.2).
///
/// Tools are external collaborators; the core only guarantees this context
/// shape, not how a given tool uses it.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace_dir: std::path::PathBuf,
    pub session_key: String,
    pub agent_id: String,
    pub cancel_token: CancelToken,
    pub metadata: std::collections::HashMap<String, Value>,
}

/// A single content item in a rich tool output.
///
/// Most tools produce only `Text`.  Vision-capable tools may produce a mix
/// of `Text` and `Image` items.
#[derive(Debug, Clone)]
pub enum ToolOutputPart {
    /// Plain UTF-8 text.
    Text(String),
    /// Base64 data URL: `data:<mime>;base64,<b64>`.
    Image(String),
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    /// Plain-text content — concatenation of all Text parts.
    pub content: String,
    /// Structured parts (text and/or images).
    pub parts: Vec<ToolOutputPart>,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let text = content.into();
        let call_id = call_id.into();
        Self {
            call_id,
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            is_error: false,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        let text = msg.into();
        let call_id = call_id.into();
        Self {
            call_id,
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            is_error: true,
        }
    }

    /// Result with arbitrary parts (text and/or images).
    pub fn with_parts(call_id: impl Into<String>, parts: Vec<ToolOutputPart>) -> Self {
        let text = parts
            .iter()
            .filter_map(|p| match p {
                ToolOutputPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            call_id: call_id.into(),
            content: text,
            parts,
            is_error: false,
        }
    }

    /// Return `true` if this output contains at least one image part.
    pub fn has_images(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ToolOutputPart::Image(_)))
    }
}

/// Describes the shape of a tool's text output for context-aware pruning
/// (spec.md §4.D.2 soft-trim: head/tail windows are only meaningful for
/// some output shapes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep a head and tail window so both the
    /// command preamble and the final result remain visible.
    HeadTail,
    /// Ordered match list: keep the leading matches (highest relevance).
    MatchList,
    /// File content: keep head and tail with a separator.
    FileContent,
    /// Generic text: hard-truncate at a character boundary.
    #[default]
    Generic,
}

/// Trait every tool (an external collaborator, spec.md §6.2) implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters.
    fn parameters_schema(&self) -> Value;
    /// Default approval level for this tool.
    fn default_policy(&self) -> ApprovalPolicy;
    /// Describes the shape of this tool's output, consulted by the context
    /// pipeline's soft-trim layer. Default is [`OutputCategory::Generic`].
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    /// Execute the tool. May return an error; the loop converts a thrown
    /// error into a `tool_result` string per spec.md §6.2/§7.
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> anyhow::Result<ToolOutput>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::policy::ApprovalPolicy;

    fn test_ctx() -> ToolContext {
        ToolContext {
            workspace_dir: std::path::PathBuf::from("/tmp"),
            session_key: "agent:test:session:1".into(),
            agent_id: "test".into(),
            cancel_token: CancelToken::new(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn output_category_default_is_generic() {
        assert_eq!(OutputCategory::default(), OutputCategory::Generic);
    }

    #[test]
    fn output_category_variants_are_distinct() {
        assert_ne!(OutputCategory::HeadTail, OutputCategory::MatchList);
        assert_ne!(OutputCategory::FileContent, OutputCategory::Generic);
    }

    struct MinimalTool;

    #[async_trait]
    impl Tool for MinimalTool {
        fn name(&self) -> &str {
            "minimal"
        }
        fn description(&self) -> &str {
            "a minimal tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn default_policy(&self) -> ApprovalPolicy {
            ApprovalPolicy::Auto
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput::ok(&call.id, "ok"))
        }
    }

    #[test]
    fn tool_default_output_category_is_generic() {
        assert_eq!(MinimalTool.output_category(), OutputCategory::Generic);
    }

    #[tokio::test]
    async fn minimal_tool_executes() {
        let call = ToolCall {
            id: "1".into(),
            name: "minimal".into(),
            args: json!({}),
        };
        let out = MinimalTool.execute(&call, &test_ctx()).await.unwrap();
        assert!(!out.is_error);
        assert_eq!(out.content, "ok");
    }

    #[test]
    fn tool_output_with_parts_joins_text() {
        let out = ToolOutput::with_parts(
            "1",
            vec![
                ToolOutputPart::Text("a".into()),
                ToolOutputPart::Image("data:image/png;base64,xx".into()),
                ToolOutputPart::Text("b".into()),
            ],
        );
        assert_eq!(out.content, "a\nb");
        assert!(out.has_images());
    }
}
