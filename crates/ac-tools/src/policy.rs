// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;

use ac_config::ToolPolicyConfig;

/// Per-tool approval policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    /// Always run without asking
    Auto,
    /// Ask user before each invocation
    Ask,
    /// Never run; return an error
    Deny,
}

/// Policy engine that maps a tool call (identified by its command string,
/// or by tool name for the context pipeline's prunable-tool matching) to an
/// approval decision.
#[derive(Debug, Clone)]
pub struct ToolPolicy {
    allow_patterns: Vec<Regex>,
    deny_patterns: Vec<Regex>,
}

impl ToolPolicy {
    pub fn from_config(cfg: &ToolPolicyConfig) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        Self {
            allow_patterns: compile(&cfg.allow),
            deny_patterns: compile(&cfg.deny),
        }
    }

    /// Decide whether a tool call (identified by its command string) should
    /// run automatically, prompt the user, or be denied.
    pub fn decide(&self, command: &str) -> ApprovalPolicy {
        if self.deny_patterns.iter().any(|re| re.is_match(command)) {
            return ApprovalPolicy::Deny;
        }
        if self.allow_patterns.iter().any(|re| re.is_match(command)) {
            return ApprovalPolicy::Auto;
        }
        ApprovalPolicy::Ask
    }

    /// `true` iff `name` matches an allow pattern and no deny pattern — used
    /// by the context pipeline to decide whether a tool's results are
    /// prunable (spec.md §4.D.2).
    pub fn is_prunable(&self, name: &str) -> bool {
        if self.deny_patterns.iter().any(|re| re.is_match(name)) {
            return false;
        }
        self.allow_patterns.iter().any(|re| re.is_match(name))
    }
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
pub fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
