// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Hard minimum context window, in tokens, below which `run` fails
/// synchronously with `ContextWindowTooSmall` (§4.D.4).
pub const CONTEXT_WINDOW_HARD_MIN: u32 = 8_000;
/// Threshold below which the context window triggers a one-time warning log
/// (§4.D.4).
pub const CONTEXT_WINDOW_WARN: u32 = 16_000;

/// Top-level configuration envelope (spec.md §6.5).
///
/// Loaded by layering YAML files from system, XDG, and workspace-local
/// locations (see [`crate::load`]); later layers override earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Provider identifier, e.g. "anthropic" | "mock".
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model id forwarded to the provider as-is.
    #[serde(default = "default_model")]
    pub model: String,
    /// Base URL override; `None` uses the provider's default endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Extra headers forwarded on every request.
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer `api_key_env` to avoid secrets in version
    /// control.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Normalized agent identifier; forms part of `sessionKey`
    /// (`agent:<agent_id>:session:<id>`).
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// System prompt override; `None` uses the built-in prompt assembly
    /// (runtime context + default instructions).
    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub tool_policy: ToolPolicyConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub reasoning: ReasoningEffort,

    /// Outer+inner loop hard cap on turns (§4.E).
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    #[serde(default)]
    pub context: ContextConfig,

    /// Global lane concurrency cap (§4.A), default 4.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    #[serde(default = "default_true")]
    pub enable_memory: bool,
    #[serde(default = "default_true")]
    pub enable_context: bool,
    #[serde(default = "default_true")]
    pub enable_skills: bool,
    #[serde(default)]
    pub enable_heartbeat: bool,
}

fn default_provider() -> String {
    "anthropic".into()
}
fn default_model() -> String {
    "claude-sonnet-4-5".into()
}
fn default_agent_id() -> String {
    "default".into()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_turns() -> u32 {
    20
}
fn default_max_concurrent_runs() -> usize {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            headers: Default::default(),
            api_key_env: None,
            api_key: None,
            agent_id: default_agent_id(),
            system_prompt: None,
            tool_policy: ToolPolicyConfig::default(),
            sandbox: SandboxConfig::default(),
            temperature: default_temperature(),
            reasoning: ReasoningEffort::default(),
            max_turns: default_max_turns(),
            context: ContextConfig::default(),
            max_concurrent_runs: default_max_concurrent_runs(),
            enable_memory: true,
            enable_context: true,
            enable_skills: true,
            enable_heartbeat: false,
        }
    }
}

/// Glob allow/deny lists reused by both the (external) tool-approval layer
/// and the context pipeline's prunable-tool matching (§4.D.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPolicyConfig {
    #[serde(default = "default_allow_all")]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

fn default_allow_all() -> Vec<String> {
    vec!["*".into()]
}

impl Default for ToolPolicyConfig {
    fn default() -> Self {
        Self {
            allow: default_allow_all(),
            deny: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub allow_exec: bool,
    #[serde(default)]
    pub allow_write: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_exec: false,
            allow_write: false,
        }
    }
}

/// Reasoning effort forwarded to the streaming provider call (§6.3 `opts`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    #[default]
    Medium,
    High,
    Xhigh,
}

impl std::fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Xhigh => "xhigh",
        };
        write!(f, "{s}")
    }
}

/// Context-pipeline knobs: token budget, compaction trigger ratios, and
/// pruning thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Total context window in tokens. Default 200,000; hard min 8k; warn
    /// below 16k (enforced via [`CONTEXT_WINDOW_HARD_MIN`] /
    /// [`CONTEXT_WINDOW_WARN`], not separately configurable here).
    #[serde(default = "default_context_tokens")]
    pub context_tokens: u32,
    /// Tokens reserved for compaction headroom, default 20,000.
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: u32,
    #[serde(default = "default_max_history_share")]
    pub max_history_share: f32,
    #[serde(default = "default_keep_last_assistants")]
    pub keep_last_assistants: usize,
    #[serde(default = "default_soft_trim_ratio")]
    pub soft_trim_ratio: f32,
    #[serde(default = "default_hard_clear_ratio")]
    pub hard_clear_ratio: f32,
    #[serde(default = "default_min_prunable_tool_chars")]
    pub min_prunable_tool_chars: usize,
}

fn default_context_tokens() -> u32 {
    200_000
}
fn default_reserve_tokens() -> u32 {
    20_000
}
fn default_max_history_share() -> f32 {
    0.5
}
fn default_keep_last_assistants() -> usize {
    3
}
fn default_soft_trim_ratio() -> f32 {
    0.3
}
fn default_hard_clear_ratio() -> f32 {
    0.5
}
fn default_min_prunable_tool_chars() -> usize {
    50_000
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_tokens: default_context_tokens(),
            reserve_tokens: default_reserve_tokens(),
            max_history_share: default_max_history_share(),
            keep_last_assistants: default_keep_last_assistants(),
            soft_trim_ratio: default_soft_trim_ratio(),
            hard_clear_ratio: default_hard_clear_ratio(),
            min_prunable_tool_chars: default_min_prunable_tool_chars(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
