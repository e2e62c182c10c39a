// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! System prompt construction (spec.md §4.E.2, ambient stack).
use chrono::Local;
use std::path::Path;

/// Optional contextual blocks injected into the system prompt.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    /// Absolute path to the project root (from `.git` detection).
    pub project_root: Option<&'a Path>,
    /// Pre-formatted git context (branch, commit, dirty status).
    ///
    /// **Caching note**: this field is *volatile* — it changes on every commit
    /// and with every file edit (dirty count). When prompt caching is enabled
    /// this content belongs in the uncached `system_dynamic_suffix` rather
    /// than the stable system message, so the cacheable prefix is unaffected.
    pub git_context: Option<&'a str>,
    /// Contents of a project instructions file (e.g. AGENTS.md).
    pub project_context_file: Option<&'a str>,
    /// Pre-formatted CI environment block. Volatile, like `git_context`.
    pub ci_context: Option<&'a str>,
    /// Text appended verbatim after the Guidelines section.
    pub append: Option<&'a str>,
}

impl<'a> PromptContext<'a> {
    /// A version of this context with the volatile fields cleared, for
    /// building the stable (cacheable) portion of the system prompt.
    pub fn stable_only(&self) -> Self {
        Self {
            project_root: self.project_root,
            git_context: None,
            project_context_file: self.project_context_file,
            ci_context: None,
            append: self.append,
        }
    }

    /// Format the volatile fields (git + CI context) as a block suitable for
    /// `CompletionRequest::system_dynamic_suffix`.
    ///
    /// Returns `None` when neither git nor CI context is present.
    pub fn dynamic_block(&self) -> Option<String> {
        let git = self
            .git_context
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.to_string());
        let ci = self
            .ci_context
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.to_string());
        match (git, ci) {
            (None, None) => None,
            (Some(g), None) => Some(g),
            (None, Some(c)) => Some(c),
            (Some(g), Some(c)) => Some(format!("{g}\n\n{c}")),
        }
    }
}

// ─── Guidelines Module ───────────────────────────────────────────────────────
// Modular guidelines for easier maintenance and testing.

mod guidelines {
    pub fn general() -> &'static str {
        "- Be concise and precise. Use tools instead of guessing.\n\
         - Verify assumptions by reading the relevant files before acting on them."
    }

    pub fn tool_usage() -> &'static str {
        "- Prefer the editing tool over a full rewrite when modifying an existing file \
           (preserves surrounding context).\n\
         - Discovery workflow: search by filename first, then by content, then read the \
           specific ranges that matter.\n\
         - Batch independent reads in parallel — don't serialize tool calls that don't \
           depend on each other."
    }

    pub fn code_quality() -> &'static str {
        "- Match the existing code's structure and style; don't introduce unrelated changes.\n\
         - Write tests for new functionality.\n\
         - Do not create new files unless the task requires it."
    }

    pub fn workflow_efficiency() -> &'static str {
        "- Track multi-step work so nothing is dropped; report progress as steps complete.\n\
         - Batch independent tool calls in parallel to reduce turns.\n\
         - Finish the requested task before ending the turn."
    }

    pub fn error_handling() -> &'static str {
        "- When a tool fails, diagnose before retrying with a different approach.\n\
         - Never skip verification steps (tests, linters, hooks) without explicit permission."
    }
}

fn build_guidelines_section() -> String {
    format!(
        "## Guidelines\n\n\
         ### General Principles\n\
         {}\n\n\
         ### Tool Usage Patterns\n\
         {}\n\n\
         ### Code Quality\n\
         {}\n\n\
         ### Workflow Efficiency\n\
         {}\n\n\
         ### Error Handling\n\
         {}",
        guidelines::general(),
        guidelines::tool_usage(),
        guidelines::code_quality(),
        guidelines::workflow_efficiency(),
        guidelines::error_handling(),
    )
}

/// Build the system prompt. `ctx` carries optional project / CI / git
/// context injected when running in headless mode; `custom` overrides the
/// built-in identity and guidelines entirely (still honoring `ctx.append`).
pub fn system_prompt(custom: Option<&str>, ctx: PromptContext<'_>) -> String {
    if let Some(custom) = custom {
        if let Some(extra) = ctx.append {
            return format!("{}\n\n{}", custom.trim_end(), extra);
        }
        return custom.to_string();
    }

    let agent_identity = format!(
        "You are a specialized AI coding agent built for professional software engineering.\n\n\
         Current date and time: `{current_date_time}`\n\
         Current working directory: `{current_working_directory}`\n\n\
         You can read and write files, run shell commands, and search the codebase. \
         Work systematically, verify your changes, and report your progress clearly.\n\
         - Maximize parallel tool calls where calls don't depend on each other.\n\
         - Always complete the task requested by the user before ending your turn.",
        current_date_time = Local::now().format("%Y-%m-%d %H:%M:%S"),
        current_working_directory = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "<unknown>".to_string()),
    );

    let project_section = if let Some(root) = ctx.project_root {
        format!(
            "\n\n## Project Context\n\
             Project root directory: `{}`\n\
             - Use this absolute path for all file read/write operations.\n\
             - Prefer absolute paths over relative paths in every tool call.",
            root.display()
        )
    } else {
        String::new()
    };

    let git_section = ctx
        .git_context
        .map(|git| format!("\n\n{git}"))
        .unwrap_or_default();

    let context_file_section = ctx
        .project_context_file
        .map(|content| format!("\n\n## Project Instructions\n\n{content}"))
        .unwrap_or_default();

    let ci_section = ctx
        .ci_context
        .map(|ci| format!("\n\n{ci}"))
        .unwrap_or_default();

    let guidelines_section = build_guidelines_section();

    let append_section = ctx
        .append
        .map(|extra| format!("\n\n{extra}"))
        .unwrap_or_default();

    format!(
        "{agent_identity}\n\n\
         {project_section}{git_section}{context_file_section}{ci_section}\n\n\
         {guidelines_section}\
         {append_section}",
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
