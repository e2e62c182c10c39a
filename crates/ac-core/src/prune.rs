// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Three-layer context pruning (spec.md §4.D.2).
//!
//! Runs ahead of every LLM call to keep the live message set inside a char
//! budget derived from the context window. Layer 1 trims oversized prunable
//! tool results to a head/tail window; layer 2 clears them entirely if that
//! wasn't enough; layer 3 drops whole messages, protecting the tail of the
//! conversation.
use ac_config::ContextConfig;
use ac_tools::ToolPolicy;

use crate::message::{ContentBlock, Message, Role};

/// Soft-trim window sizes, in characters.
#[derive(Debug, Clone, Copy)]
pub struct SoftTrimSettings {
    pub max: usize,
    pub head: usize,
    pub tail: usize,
}

impl Default for SoftTrimSettings {
    fn default() -> Self {
        Self {
            max: 4000,
            head: 1500,
            tail: 1500,
        }
    }
}

/// Knobs controlling all three pruning layers.
#[derive(Debug, Clone)]
pub struct PruneSettings {
    pub max_history_share: f32,
    pub keep_last_assistants: usize,
    pub soft_trim_ratio: f32,
    pub hard_clear_ratio: f32,
    pub min_prunable_tool_chars: usize,
    pub soft_trim: SoftTrimSettings,
    pub hard_clear_placeholder: String,
}

impl Default for PruneSettings {
    fn default() -> Self {
        Self {
            max_history_share: 0.5,
            keep_last_assistants: 3,
            soft_trim_ratio: 0.3,
            hard_clear_ratio: 0.5,
            min_prunable_tool_chars: 50_000,
            soft_trim: SoftTrimSettings::default(),
            hard_clear_placeholder: "[Old tool result content cleared]".to_string(),
        }
    }
}

impl PruneSettings {
    pub fn from_context_config(cfg: &ContextConfig) -> Self {
        Self {
            max_history_share: cfg.max_history_share,
            keep_last_assistants: cfg.keep_last_assistants,
            soft_trim_ratio: cfg.soft_trim_ratio,
            hard_clear_ratio: cfg.hard_clear_ratio,
            min_prunable_tool_chars: cfg.min_prunable_tool_chars,
            ..Default::default()
        }
    }
}

/// Result of one pruning pass.
#[derive(Debug, Clone)]
pub struct PruneResult {
    pub messages: Vec<Message>,
    pub dropped_messages: Vec<Message>,
    pub trimmed_tool_results: usize,
    pub hard_cleared_tool_results: usize,
    pub total_chars: usize,
    pub kept_chars: usize,
    pub dropped_chars: usize,
    pub budget_chars: usize,
}

fn total_chars(messages: &[Message]) -> usize {
    messages.iter().map(Message::char_len).sum()
}

/// `true` iff `name` is prunable under `policy` — an allow-listed tool that
/// isn't deny-listed. A `None` policy treats everything as prunable (the
/// historical behavior when no tool policy is configured).
fn is_prunable(policy: Option<&ToolPolicy>, name: &str) -> bool {
    policy.map(|p| p.is_prunable(name)).unwrap_or(true)
}

fn soft_trim_block(block: &mut ContentBlock, settings: &SoftTrimSettings, policy: Option<&ToolPolicy>) -> bool {
    if let ContentBlock::ToolResult { name, content, .. } = block {
        let prunable = name.as_deref().map(|n| is_prunable(policy, n)).unwrap_or(false);
        if prunable && content.len() > settings.max {
            let head: String = content.chars().take(settings.head).collect();
            let tail_start = content.len().saturating_sub(settings.tail);
            let tail: String = content.chars().skip(tail_start).collect();
            *content = format!("{head}\n...\n{tail}[trimmed ...]");
            return true;
        }
    }
    false
}

fn hard_clear_block(block: &mut ContentBlock, placeholder: &str, policy: Option<&ToolPolicy>) -> Option<usize> {
    if let ContentBlock::ToolResult { name, content, .. } = block {
        let prunable = name.as_deref().map(|n| is_prunable(policy, n)).unwrap_or(false);
        if prunable && content.as_str() != placeholder {
            let before = content.len();
            *content = placeholder.to_string();
            return Some(before - content.len());
        }
    }
    None
}

/// Run the three pruning layers over `messages`, bounding the result to a
/// char budget derived from `context_window_tokens`.
pub fn prune_context_messages(
    messages: &[Message],
    context_window_tokens: u32,
    settings: &PruneSettings,
    tool_policy: Option<&ToolPolicy>,
) -> PruneResult {
    let char_window = context_window_tokens as usize * 4;
    let budget_chars = ((char_window as f32) * settings.max_history_share).floor() as usize;

    let mut working: Vec<Message> = messages.to_vec();
    let total = total_chars(&working);
    let mut trimmed = 0usize;
    let mut hard_cleared = 0usize;

    // Layer 1 — soft trim.
    let ratio = total as f32 / char_window.max(1) as f32;
    if ratio > settings.soft_trim_ratio {
        for message in working.iter_mut() {
            if message.role != Role::User {
                continue;
            }
            for block in message.content.iter_mut() {
                if soft_trim_block(block, &settings.soft_trim, tool_policy) {
                    trimmed += 1;
                }
            }
        }
    }

    // Layer 2 — hard clear.
    let mut running = total_chars(&working);
    let hard_ratio = running as f32 / char_window.max(1) as f32;
    let prunable_tool_chars: usize = working
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|b| match b {
            ContentBlock::ToolResult { name, content, .. }
                if name.as_deref().map(|n| is_prunable(tool_policy, n)).unwrap_or(false) =>
            {
                Some(content.len())
            }
            _ => None,
        })
        .sum();
    if hard_ratio > settings.hard_clear_ratio && prunable_tool_chars > settings.min_prunable_tool_chars {
        'outer: for message in working.iter_mut() {
            if message.role != Role::User {
                continue;
            }
            for block in message.content.iter_mut() {
                if let Some(freed) = hard_clear_block(block, &settings.hard_clear_placeholder, tool_policy) {
                    running = running.saturating_sub(freed);
                    hard_cleared += 1;
                }
                if (running as f32 / char_window.max(1) as f32) < settings.hard_clear_ratio {
                    break 'outer;
                }
            }
        }
    }

    // Layer 3 — message drop.
    let kept_chars_before_drop = total_chars(&working);
    let mut dropped_messages: Vec<Message> = Vec::new();
    let mut final_messages = working;

    if kept_chars_before_drop > budget_chars {
        let assistant_positions: Vec<usize> = final_messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::Assistant)
            .map(|(i, _)| i)
            .collect();
        let cutoff_index = if assistant_positions.len() >= settings.keep_last_assistants && settings.keep_last_assistants > 0 {
            assistant_positions[assistant_positions.len() - settings.keep_last_assistants]
        } else {
            0
        };

        let protected = &final_messages[cutoff_index..];
        let protected_chars = total_chars(protected);

        if protected_chars > budget_chars {
            // Final fallback: pack back-to-front ignoring protection.
            let mut packed: Vec<Message> = Vec::new();
            let mut used = 0usize;
            for message in final_messages.iter().rev() {
                let len = message.char_len();
                if used + len > budget_chars && !packed.is_empty() {
                    continue;
                }
                used += len;
                packed.push(message.clone());
            }
            packed.reverse();
            let kept_ids: std::collections::HashSet<i64> = packed.iter().map(|m| m.timestamp).collect();
            dropped_messages = final_messages
                .iter()
                .filter(|m| !kept_ids.contains(&m.timestamp))
                .cloned()
                .collect();
            final_messages = packed;
        } else {
            let mut packed: Vec<Message> = protected.to_vec();
            let mut used = protected_chars;
            let mut older: Vec<Message> = final_messages[..cutoff_index].to_vec();
            while let Some(candidate) = older.pop() {
                let len = candidate.char_len();
                if used + len > budget_chars {
                    dropped_messages.push(candidate);
                    continue;
                }
                used += len;
                packed.insert(0, candidate);
            }
            dropped_messages.extend(older);
            dropped_messages.reverse();
            final_messages = packed;
        }
    }

    let kept_chars = total_chars(&final_messages);
    let dropped_chars = total_chars(&dropped_messages);

    PruneResult {
        messages: final_messages,
        dropped_messages,
        trimmed_tool_results: trimmed,
        hard_cleared_tool_results: hard_cleared,
        total_chars: total,
        kept_chars,
        dropped_chars,
        budget_chars,
    }
}
