// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Summarization-based compaction (spec.md §4.D.3).
//!
//! Compaction never touches the kept suffix of a conversation — it only
//! summarizes the messages the pruning layer already decided to drop, then
//! hands back a single synthetic message plus the id of the first message
//! still live. [`crate::session_log::SessionLog::append_compaction`] persists
//! both together as one checkpoint.
use async_trait::async_trait;

use crate::message::{ContentBlock, Message, Role};

/// Two supported summary shapes. `Structured` produces a fixed-section
/// Markdown checkpoint (denser, easier for the model to resume from);
/// `Narrative` produces free-form prose. Structured is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompactionStrategy {
    #[default]
    Structured,
    Narrative,
}

const NARRATIVE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

const STRUCTURED_PROMPT: &str = "\
You are a context compaction assistant for a software engineering agent. \
Produce a structured state checkpoint from the conversation history below. \
Use EXACTLY the following Markdown sections — do not add or remove sections. \
Be information-dense: preserve file paths, function names, error messages, \
code snippets, test names, and technical decisions verbatim where they matter.

## Active Task
Describe in 1-3 sentences what the agent is currently working on.

## Key Decisions & Rationale
List every significant technical decision made and why (bullet points). \
Include file or component names.

## Files & Artifacts
List every file that was read, modified, or created, with a brief note on what was done.

## Constraints & Requirements
List every requirement, constraint, or user preference that must be preserved.

## Pending Items
List every unfinished subtask or open question.

## Session Narrative
Write a dense technical summary (2-5 paragraphs) of what happened, \
capturing the essential flow of events, tool outputs, and reasoning. \
Focus on facts the agent will need to continue correctly.";

const MERGE_PROMPT: &str =
    "You are a context compaction assistant. Below are several independent summaries of \
     consecutive slices of one conversation, in chronological order. Merge them into a single \
     coherent summary in the same format as the inputs, removing redundancy across slices but \
     never dropping a distinct fact, file, or decision that appears in only one slice.";

fn prompt_for(strategy: CompactionStrategy) -> &'static str {
    match strategy {
        CompactionStrategy::Structured => STRUCTURED_PROMPT,
        CompactionStrategy::Narrative => NARRATIVE_PROMPT,
    }
}

/// An external collaborator that turns a rendered transcript into a summary
/// string by calling the LLM. The agent loop supplies the real
/// implementation (backed by a [`ac_model::ModelProvider`]); tests supply a
/// scripted one.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, system_prompt: &str, transcript: &str) -> anyhow::Result<String>;
}

/// `true` iff accumulated tokens already exceed the reserved headroom —
/// compaction should run before the next model call (§4.D.3).
pub fn should_trigger_compaction(total_tokens: usize, context_window_tokens: u32, reserve_tokens: u32) -> bool {
    total_tokens as i64 > context_window_tokens as i64 - reserve_tokens as i64
}

/// Settings controlling the two-stage chunked summarization algorithm.
#[derive(Debug, Clone)]
pub struct CompactionSettings {
    pub parts: usize,
    pub min_messages_for_split: usize,
    pub reserve_tokens: u32,
    pub strategy: CompactionStrategy,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            parts: 2,
            min_messages_for_split: 4,
            reserve_tokens: 20_000,
            strategy: CompactionStrategy::Structured,
        }
    }
}

const CHUNK_RATIO_BASE: f32 = 0.4;
const CHUNK_RATIO_MIN: f32 = 0.15;
/// Average per-message token size above which the chunk ratio has fully
/// decayed from `BASE` to `MIN`.
const LARGE_MESSAGE_TOKENS: f32 = 4_000.0;

fn adaptive_chunk_ratio(avg_message_tokens: f32) -> f32 {
    let t = (avg_message_tokens / LARGE_MESSAGE_TOKENS).clamp(0.0, 1.0);
    CHUNK_RATIO_BASE - t * (CHUNK_RATIO_BASE - CHUNK_RATIO_MIN)
}

fn render_message(message: &Message) -> String {
    let role = match message.role {
        Role::User => "User",
        Role::Assistant => "Assistant",
    };
    let mut lines = Vec::new();
    for block in &message.content {
        match block {
            ContentBlock::Text { text } => lines.push(text.clone()),
            ContentBlock::ToolUse { name, input, .. } => {
                lines.push(format!("[tool call: {name}({input})]"));
            }
            ContentBlock::ToolResult { name, content, .. } => {
                let label = name.as_deref().unwrap_or("tool");
                lines.push(format!("[tool result from {label}]: {content}"));
            }
        }
    }
    format!("{role}: {}", lines.join("\n"))
}

fn render_transcript(messages: &[Message]) -> String {
    messages.iter().map(render_message).collect::<Vec<_>>().join("\n\n")
}

/// Split `messages` by token share into ordered chunks. Never produces more
/// chunks than `parts` once there are enough messages to fill them.
fn split_by_token_share(messages: &[Message], parts: usize) -> Vec<Vec<Message>> {
    if parts <= 1 || messages.len() <= parts {
        return messages.iter().map(|m| vec![m.clone()]).collect();
    }
    let total_tokens: usize = messages.iter().map(Message::approx_tokens).sum();
    let target_per_chunk = (total_tokens / parts).max(1);

    let mut chunks: Vec<Vec<Message>> = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_tokens = 0usize;
    for message in messages {
        current_tokens += message.approx_tokens();
        current.push(message.clone());
        let remaining_chunks = parts - chunks.len();
        if current_tokens >= target_per_chunk && remaining_chunks > 1 {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Replace oversized messages (by token count) with a short omission note,
/// used as the retry fallback when a chunk fails to summarize.
fn omit_oversized(messages: &[Message], budget_tokens: usize) -> Vec<Message> {
    messages
        .iter()
        .map(|m| {
            if m.approx_tokens() > budget_tokens {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                let approx_k = m.approx_tokens() / 1000;
                Message {
                    role: m.role,
                    timestamp: m.timestamp,
                    content: vec![ContentBlock::text(format!(
                        "[Large {role} (~{approx_k}k tokens) omitted]"
                    ))],
                }
            } else {
                m.clone()
            }
        })
        .collect()
}

async fn summarize_chunk(
    summarizer: &dyn Summarizer,
    chunk: &[Message],
    settings: &CompactionSettings,
    chunk_budget_tokens: usize,
) -> anyhow::Result<String> {
    let prompt = prompt_for(settings.strategy);
    let transcript = render_transcript(chunk);
    match summarizer.summarize(prompt, &transcript).await {
        Ok(summary) => Ok(summary),
        Err(_) => {
            let reduced = omit_oversized(chunk, chunk_budget_tokens / 2);
            let transcript = render_transcript(&reduced);
            summarizer.summarize(prompt, &transcript).await
        }
    }
}

/// Summarize `dropped` (the messages the pruning layer already decided to
/// remove from the live context) into a single summary string, using the
/// two-stage split/merge algorithm when there are enough messages to justify
/// it.
pub async fn build_compaction_summary(
    dropped: &[Message],
    settings: &CompactionSettings,
    summarizer: &dyn Summarizer,
) -> anyhow::Result<String> {
    if dropped.is_empty() {
        return Ok(String::new());
    }

    let max_tokens_per_call = ((settings.reserve_tokens as f32) * 0.8) as usize;
    let total_tokens: usize = dropped.iter().map(Message::approx_tokens).sum();
    let avg_tokens = total_tokens as f32 / dropped.len() as f32;
    let ratio = adaptive_chunk_ratio(avg_tokens);
    let chunk_budget_tokens = ((max_tokens_per_call as f32) * ratio).max(500.0) as usize;

    if dropped.len() < settings.min_messages_for_split {
        return summarize_chunk(summarizer, dropped, settings, chunk_budget_tokens).await;
    }

    let part_count = settings.parts.max(2);
    let chunks = split_by_token_share(dropped, part_count);

    let mut chunk_summaries = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        if chunk.is_empty() {
            continue;
        }
        chunk_summaries.push(summarize_chunk(summarizer, chunk, settings, chunk_budget_tokens).await?);
    }

    if chunk_summaries.len() <= 1 {
        return Ok(chunk_summaries.into_iter().next().unwrap_or_default());
    }

    let merge_input = chunk_summaries
        .iter()
        .enumerate()
        .map(|(i, s)| format!("--- Slice {} ---\n{s}", i + 1))
        .collect::<Vec<_>>()
        .join("\n\n");
    summarizer.summarize(MERGE_PROMPT, &merge_input).await
}

/// Mine `read`/`write`/`edit` tool calls (by `path` argument) out of the
/// dropped messages, returning `(read_only_files, modified_files)` — both
/// de-duplicated, order-preserving.
fn mine_file_trailer(dropped: &[Message]) -> (Vec<String>, Vec<String>) {
    let mut read: Vec<String> = Vec::new();
    let mut modified: Vec<String> = Vec::new();
    for message in dropped {
        for block in &message.content {
            if let ContentBlock::ToolUse { name, input, .. } = block {
                let path = input.get("path").and_then(|v| v.as_str());
                let Some(path) = path else { continue };
                match name.as_str() {
                    "read" if !read.iter().any(|p| p == path) => read.push(path.to_string()),
                    "write" | "edit" if !modified.iter().any(|p| p == path) => modified.push(path.to_string()),
                    _ => {}
                }
            }
        }
    }
    // A file later modified is no longer purely read-only.
    read.retain(|p| !modified.contains(p));
    (read, modified)
}

/// Build the synthetic `user` message persisted by `appendCompaction`,
/// combining the summary text with a read/modified-files trailer mined from
/// the dropped messages.
pub fn build_compaction_message(dropped: &[Message], summary: &str, timestamp: i64) -> Message {
    let (read_files, modified_files) = mine_file_trailer(dropped);
    let read_block = if read_files.is_empty() {
        String::new()
    } else {
        format!("\n<read-files>\n{}\n</read-files>", read_files.join("\n"))
    };
    let modified_block = if modified_files.is_empty() {
        String::new()
    } else {
        format!("\n<modified-files>\n{}\n</modified-files>", modified_files.join("\n"))
    };
    let text = format!(
        "The conversation history before this point was compacted into the following summary:\n\n\
         <summary>\n{summary}\n</summary>\n{read_block}{modified_block}"
    );
    Message::user_text(text, timestamp)
}
