// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Typed error kinds for the execution core.
//!
//! `ToolExecutionError` is the only kind the loop itself never surfaces as a
//! `RunError`: thrown tool errors are caught and turned into `tool_result`
//! strings prefixed `执行错误: ` before they ever reach this type — the variant
//! exists so a tool or channel adapter can still construct one explicitly
//! (e.g. `ChannelNotFound`/`ChannelNotConnected` surface as
//! `ToolExecutionError` text from the tool layer).
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    /// Checked synchronously before any I/O: the configured context window
    /// cannot even hold the reserved headroom plus one message.
    #[error("context window too small: {0}")]
    ContextWindowTooSmall(String),

    /// Surfaces only after all retries are exhausted.
    #[error("rate limited after retries: {0}")]
    RateLimitTransient(String),

    /// Surfaces only if auto-compaction could not produce a summary.
    #[error("context overflow: {0}")]
    ContextOverflow(String),

    /// An `error` event inside the provider stream; never retried.
    #[error("provider stream error: {0}")]
    ProviderStreamError(String),

    /// A tool's `execute` threw. Does not normally propagate as a `RunError`
    /// — the loop converts it to a `tool_result` string instead — but is
    /// available for callers (e.g. channel adapters) constructing the same
    /// taxonomy outside the loop.
    #[error("tool execution error: {0}")]
    ToolExecutionError(String),

    /// Cooperative cancellation fired.
    #[error("operation aborted")]
    Cancelled,

    /// The session log's cross-process file lock could not be acquired
    /// within the 10s bound.
    #[error("session lock timeout: {0}")]
    SessionLockTimeout(String),

    /// Attempted to spawn a subagent from within a subagent session.
    #[error("subagent spawn rejected: {0}")]
    SubagentSpawnRejected(String),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("channel not connected: {0}")]
    ChannelNotConnected(String),

    /// `reset` was called for a session with an admitted, still-running run.
    #[error("session busy: {0}")]
    SessionBusy(String),
}

impl RunError {
    /// Classify a rate-limit error by substring match on its message.
    pub fn is_rate_limit_message(msg: &str) -> bool {
        let lower = msg.to_lowercase();
        lower.contains("429")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("quota")
    }

    /// Classify a context-overflow error by substring match on its message.
    pub fn is_context_overflow_message(msg: &str) -> bool {
        let lower = msg.to_lowercase();
        lower.contains("context length") || lower.contains("too long") || lower.contains("maximum context")
    }
}
