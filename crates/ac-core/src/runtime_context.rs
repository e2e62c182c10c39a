// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Runtime context for an agent session.
//!
//! This is separate from [`ac_config::Config`], which holds only
//! config-file fields. [`AgentRuntimeContext`] carries values detected or
//! specified at runtime (project root, git/CI context, prompt overrides).
use std::path::PathBuf;

/// Environment-detected context injected into an agent at construction time.
#[derive(Debug, Default, Clone)]
pub struct AgentRuntimeContext {
    /// Absolute path to the project root (found via `.git` walk-up).
    pub project_root: Option<PathBuf>,
    /// Pre-formatted git context block (branch, commit, dirty status).
    pub git_context_note: Option<String>,
    /// Pre-formatted CI environment context block.
    pub ci_context_note: Option<String>,
    /// Contents of a project instructions file (e.g. `AGENTS.md`).
    pub project_context_file: Option<String>,
    /// Text appended to the default system prompt.
    pub append_system_prompt: Option<String>,
    /// Full system prompt override. When set, replaces the default system
    /// prompt entirely (still honoring `append_system_prompt`).
    pub system_prompt_override: Option<String>,
}

impl AgentRuntimeContext {
    /// Detect ambient environment context — project root, git state, CI
    /// environment, and project instructions file — via `ac_runtime`.
    /// `append_system_prompt`/`system_prompt_override` are left unset; a
    /// caller wires those in from config after detection.
    pub fn detect() -> Self {
        let project_root = ac_runtime::find_project_root().ok();
        let git_context_note = project_root
            .as_deref()
            .map(ac_runtime::collect_git_context)
            .and_then(|git| git.to_prompt_section());
        let ci_context_note = ac_runtime::detect_ci_context().to_prompt_section();
        let project_context_file = project_root.as_deref().and_then(ac_runtime::load_project_context_file);

        Self {
            project_root,
            git_context_note,
            ci_context_note,
            project_context_file,
            append_system_prompt: None,
            system_prompt_override: None,
        }
    }

    /// Build the [`crate::prompts::PromptContext`] borrowing from this
    /// context's owned strings.
    pub fn prompt_context(&self) -> crate::prompts::PromptContext<'_> {
        crate::prompts::PromptContext {
            project_root: self.project_root.as_deref(),
            git_context: self.git_context_note.as_deref(),
            project_context_file: self.project_context_file.as_deref(),
            ci_context: self.ci_context_note.as_deref(),
            append: self.append_system_prompt.as_deref(),
        }
    }
}
