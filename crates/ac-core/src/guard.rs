// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The tool-result guard: an explicit decorator over [`SessionLog`] that
//! keeps every `tool_use` matched by a `tool_result` before any other
//! message is allowed onto the log.
//!
//! Earlier designs of this kind of guard monkey-patch the append path of a
//! shared session manager singleton; that makes "install twice" a real
//! hazard (double-wrapped appends, divergent pending state). This one is a
//! plain wrapper type that owns no private mutable pending state at all —
//! it recomputes the pending set by reading the tail of the log itself, so
//! two independent `ToolResultGuard`s over the same underlying log (or the
//! same guard used from two call sites) observe and converge on exactly the
//! same state. Installing it "twice" is therefore a non-event rather than
//! something that needs special-casing.
use std::sync::Arc;

use crate::message::{ContentBlock, Message, Role};
use crate::session_log::SessionLog;

/// A `tool_use` id awaiting its matching `tool_result`, together with the
/// tool name (kept for the synthetic placeholder result).
type PendingToolCall = (String, Option<String>);

pub struct ToolResultGuard {
    log: Arc<SessionLog>,
}

impl ToolResultGuard {
    pub fn new(log: Arc<SessionLog>) -> Self {
        Self { log }
    }

    /// The ids (in call order) of `tool_use` blocks that have not yet been
    /// matched by a later `tool_result`-bearing `user` message.
    fn pending(&self, session_key: &str) -> anyhow::Result<Vec<PendingToolCall>> {
        let messages = self.log.load(session_key)?;
        let mut pending: Vec<PendingToolCall> = Vec::new();
        for message in &messages {
            if message.is_tool_result_message() {
                let matched: std::collections::HashSet<&str> =
                    message.tool_result_ids().into_iter().collect();
                pending.retain(|(id, _)| !matched.contains(id.as_str()));
                continue;
            }
            if message.role == Role::Assistant {
                for block in &message.content {
                    if let ContentBlock::ToolUse { id, name, .. } = block {
                        pending.push((id.clone(), Some(name.clone())));
                    }
                }
            }
        }
        Ok(pending)
    }

    fn synthetic_result_message(pending: &[PendingToolCall]) -> Message {
        let blocks = pending
            .iter()
            .map(|(id, name)| {
                ContentBlock::tool_result(
                    id.clone(),
                    name.clone(),
                    "missing tool result in session history; synthetic error result inserted",
                )
            })
            .collect();
        Message::user_tool_results(blocks, now_ms())
    }

    /// Append a message through the guard.
    ///
    /// - A `tool_result`-bearing `user` message is persisted as-is (its ids
    ///   clear the pending set on the next read).
    /// - Any other message, if the pending set is non-empty, is preceded by
    ///   a synthesized `user` message carrying one placeholder
    ///   `tool_result` per still-outstanding id.
    /// - An `assistant` message's `tool_use` ids become pending as soon as
    ///   it is persisted (picked up by the next `pending` scan).
    pub fn append(&self, session_key: &str, message: Message) -> anyhow::Result<String> {
        if message.is_tool_result_message() {
            return self.log.append(session_key, message);
        }
        let pending = self.pending(session_key)?;
        if !pending.is_empty() {
            self.log
                .append(session_key, Self::synthetic_result_message(&pending))?;
        }
        self.log.append(session_key, message)
    }

    pub fn append_compaction(
        &self,
        session_key: &str,
        summary: Message,
        first_kept_entry_id: &str,
        tokens_before: usize,
    ) -> anyhow::Result<String> {
        self.log
            .append_compaction(session_key, summary, first_kept_entry_id, tokens_before)
    }

    /// Flush any outstanding `tool_use` ids as synthetic `tool_result`s.
    /// Called unconditionally from the outermost `finally` of every run, so
    /// the log never ends in a state a provider would reject — including
    /// after a crash that left an `assistant` message unresolved, or after
    /// a cancelled run.
    pub fn flush_pending_tool_results(&self, session_key: &str) -> anyhow::Result<()> {
        let pending = self.pending(session_key)?;
        if pending.is_empty() {
            return Ok(());
        }
        self.log
            .append(session_key, Self::synthetic_result_message(&pending))?;
        Ok(())
    }

    pub fn load(&self, session_key: &str) -> anyhow::Result<Vec<Message>> {
        self.log.load(session_key)
    }

    pub fn load_with_ids(&self, session_key: &str) -> anyhow::Result<Vec<(String, Message)>> {
        self.log.load_with_ids(session_key)
    }

    pub fn clear(&self, session_key: &str) -> anyhow::Result<()> {
        self.log.clear(session_key)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
