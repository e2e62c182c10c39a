// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The orchestrator: the single entry point that ties the lane scheduler,
//! session log, tool-result guard, context pipeline, agent loop, and event
//! bus together into the public surface described in spec.md §6.1.
//!
//! `AgentLoop` itself is deliberately collaborator-only and stateless across
//! calls (spec.md's "constructed fresh per run" note on its doc comment).
//! [`Orchestrator`] is what actually lives for the lifetime of a process: it
//! owns the long-lived collaborators (lane scheduler, session log, event
//! bus), keeps a small amount of bookkeeping for runs that are currently
//! in flight (their cancel tokens, for `abort`), and keeps a per-session
//! steering queue that outlives any single run so `steer` never has to
//! reject a call just because nothing happens to be running yet.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use ac_config::{CancelToken, Config};
use ac_model::ModelProvider;
use ac_tools::{ToolPolicy, ToolRegistry};

use crate::agent::{AgentLoop, FollowUpSource, RunOutput, SteeringSource};
use crate::compact::CompactionSettings;
use crate::errors::RunError;
use crate::events::{Event, EventBus, Unsubscribe};
use crate::guard::ToolResultGuard;
use crate::lanes::LaneScheduler;
use crate::prune::PruneSettings;
use crate::runtime_context::AgentRuntimeContext;
use crate::session_log::SessionLog;

/// A FIFO queue of steering messages queued for a session, shared across
/// every run admitted for that `sessionKey`. Persists independently of any
/// one run so text queued before a run starts is still delivered to the
/// first steering check inside it.
#[derive(Default)]
struct SteeringQueue {
    pending: Mutex<Vec<String>>,
}

impl SteeringQueue {
    fn push(&self, text: String) {
        self.pending.lock().expect("steering queue poisoned").push(text);
    }
}

impl SteeringSource for SteeringQueue {
    fn try_next(&self) -> Option<String> {
        let mut pending = self.pending.lock().expect("steering queue poisoned");
        if pending.is_empty() {
            None
        } else {
            Some(pending.remove(0))
        }
    }
}

/// Bookkeeping for a run currently admitted and executing.
struct ActiveRun {
    session_key: String,
    cancel: CancelToken,
}

/// Removes a run's `active_runs` entry on every exit path — success, error,
/// or cancellation — mirroring the drop-cleanup pattern the session log's
/// file lock guard already uses.
struct ActiveRunGuard<'a> {
    orchestrator: &'a Orchestrator,
    run_id: String,
}

impl Drop for ActiveRunGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator
            .active_runs
            .lock()
            .expect("active runs poisoned")
            .remove(&self.run_id);
    }
}

/// Outcome of one `Orchestrator::run` call, returned once the run completes.
///
/// spec.md §3.5 describes `RunState` as a single record carrying both the
/// in-flight bookkeeping (cancel token, steering queue, running counters)
/// and the terminal fields (final text, whether auto-compaction fired). We
/// split that in two: the in-flight half lives in `Orchestrator`'s registries
/// for the duration of the call so `abort`/`steer` can reach it, and this
/// struct carries only what remains once the run has already finished —
/// there is no caller that needs both halves live at once, since `run` is
/// awaited to completion rather than handed back as a handle.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub final_text: String,
    pub turns: u32,
    pub total_tool_calls: u32,
    /// `true` iff a context-overflow auto-compaction attempt fired during
    /// this run (spec.md §4.D.5 — at most one per run).
    pub overflow_compaction_tried: bool,
    /// Set when at least one compaction (routine or overflow-triggered)
    /// completed during this run; carries the size of the emitted summary
    /// in characters and how many messages it replaced.
    pub compaction_summary: Option<CompactionOutcome>,
}

#[derive(Debug, Clone, Copy)]
pub struct CompactionOutcome {
    pub summary_chars: usize,
    pub dropped_messages: usize,
}

/// Ties every execution-core module together behind the API described in
/// spec.md §6.1. One `Orchestrator` is built per agent process and shared
/// (behind an `Arc`) across every concurrent `run`/`steer`/`abort` call.
pub struct Orchestrator {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    tool_policy: ToolPolicy,
    lanes: Arc<LaneScheduler>,
    log: Arc<SessionLog>,
    guard: Arc<ToolResultGuard>,
    events: Arc<EventBus>,
    max_turns: u32,
    context_window_tokens: u32,
    reserve_tokens: u32,
    prune_settings: PruneSettings,
    compaction_settings: CompactionSettings,
    system_prompt: String,
    system_dynamic_suffix: Option<String>,
    active_runs: Mutex<HashMap<String, ActiveRun>>,
    steering_queues: Mutex<HashMap<String, Arc<SteeringQueue>>>,
}

impl Orchestrator {
    /// Build an orchestrator whose model provider comes from `config` via
    /// [`ac_model::from_config`].
    pub fn new(
        config: &Config,
        tools: Arc<ToolRegistry>,
        runtime_context: AgentRuntimeContext,
        sessions_dir: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        let provider: Arc<dyn ModelProvider> = ac_model::from_config(config)?.into();
        Ok(Self::with_provider(config, provider, tools, runtime_context, sessions_dir))
    }

    /// Build an orchestrator against an already-constructed provider —
    /// the entry point tests use with a [`ac_model::MockProvider`] or
    /// [`ac_model::ScriptedMockProvider`].
    pub fn with_provider(
        config: &Config,
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        runtime_context: AgentRuntimeContext,
        sessions_dir: impl Into<PathBuf>,
    ) -> Self {
        let log = Arc::new(SessionLog::new(sessions_dir));
        let guard = Arc::new(ToolResultGuard::new(log.clone()));
        let tool_policy = ToolPolicy::from_config(&config.tool_policy);
        let system_prompt = crate::prompts::system_prompt(
            config.system_prompt.as_deref(),
            runtime_context.prompt_context().stable_only(),
        );
        let system_dynamic_suffix = runtime_context.prompt_context().dynamic_block();

        if config.context.context_tokens < ac_config::CONTEXT_WINDOW_WARN {
            tracing::warn!(
                context_tokens = config.context.context_tokens,
                warn_threshold = ac_config::CONTEXT_WINDOW_WARN,
                "configured context window is below the recommended minimum"
            );
        }

        Self {
            provider,
            tools,
            tool_policy,
            lanes: Arc::new(LaneScheduler::new(config.max_concurrent_runs)),
            log,
            guard,
            events: Arc::new(EventBus::new()),
            max_turns: config.max_turns,
            context_window_tokens: config.context.context_tokens,
            reserve_tokens: config.context.reserve_tokens,
            prune_settings: PruneSettings::from_context_config(&config.context),
            compaction_settings: CompactionSettings::default(),
            system_prompt,
            system_dynamic_suffix,
            active_runs: Mutex::new(HashMap::new()),
            steering_queues: Mutex::new(HashMap::new()),
        }
    }

    fn steering_queue_for(&self, session_key: &str) -> Arc<SteeringQueue> {
        self.steering_queues
            .lock()
            .expect("steering queues poisoned")
            .entry(session_key.to_string())
            .or_default()
            .clone()
    }

    /// Run one turn of conversation for `session_key`. Admits through the
    /// lane scheduler, builds a fresh [`AgentLoop`] from this orchestrator's
    /// shared collaborators, and awaits it to completion.
    pub async fn run(&self, session_key: &str, user_text: &str) -> Result<RunResult, RunError> {
        self.run_with_follow_up(session_key, user_text, None).await
    }

    /// Like [`run`][Self::run], but additionally wires `follow_up` into the
    /// agent loop's outer-loop re-entry hook (spec.md §4.E.4) — the plug-in
    /// point subagent completion reporting uses to fold a subagent's summary
    /// back into the parent run instead of starting a new one. Plain
    /// interactive chat has no follow-up source and calls `run` instead.
    pub async fn run_with_follow_up(
        &self,
        session_key: &str,
        user_text: &str,
        follow_up: Option<&dyn FollowUpSource>,
    ) -> Result<RunResult, RunError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancelToken::new();

        self.active_runs.lock().expect("active runs poisoned").insert(
            run_id.clone(),
            ActiveRun {
                session_key: session_key.to_string(),
                cancel: cancel.clone(),
            },
        );
        let _guard = ActiveRunGuard {
            orchestrator: self,
            run_id: run_id.clone(),
        };

        let lane_guard = self.lanes.admit(session_key, &cancel).await?;

        let steering = self.steering_queue_for(session_key);

        let mut overflow_compaction_tried = false;
        let mut compaction_summary: Option<CompactionOutcome> = None;
        let watched_run_id = run_id.clone();
        let tallies: Arc<Mutex<(bool, Option<CompactionOutcome>)>> = Arc::new(Mutex::new((false, None)));
        let tallies_for_listener = tallies.clone();
        let listener = self.events.subscribe(move |event| {
            if event.run_id() != watched_run_id {
                return;
            }
            match event {
                Event::ContextOverflowCompact { .. } => {
                    tallies_for_listener.lock().expect("tallies poisoned").0 = true;
                }
                Event::Compaction {
                    summary_chars,
                    dropped_messages,
                    ..
                } => {
                    tallies_for_listener.lock().expect("tallies poisoned").1 = Some(CompactionOutcome {
                        summary_chars: *summary_chars,
                        dropped_messages: *dropped_messages,
                    });
                }
                _ => {}
            }
        });

        let agent_loop = AgentLoop {
            provider: self.provider.clone(),
            tools: self.tools.clone(),
            tool_policy: self.tool_policy.clone(),
            guard: self.guard.clone(),
            events: self.events.clone(),
            max_turns: self.max_turns,
            context_window_tokens: self.context_window_tokens,
            reserve_tokens: self.reserve_tokens,
            prune_settings: self.prune_settings.clone(),
            compaction_settings: self.compaction_settings.clone(),
            system_prompt: self.system_prompt.clone(),
            system_dynamic_suffix: self.system_dynamic_suffix.clone(),
        };

        let result: Result<RunOutput, RunError> = agent_loop
            .run_with_follow_up(&run_id, session_key, user_text, steering.as_ref(), follow_up, &cancel)
            .await;

        self.events.unsubscribe(listener);
        drop(lane_guard);

        {
            let tallied = tallies.lock().expect("tallies poisoned");
            overflow_compaction_tried = tallied.0;
            compaction_summary = tallied.1;
        }

        result.map(|out| RunResult {
            run_id,
            final_text: out.final_text,
            turns: out.turns,
            total_tool_calls: out.total_tool_calls,
            overflow_compaction_tried,
            compaction_summary,
        })
    }

    /// Cancel a specific run (`Some(run_id)`) or every currently active run
    /// (`None`). Idempotent: cancelling a run that already finished, or
    /// calling this twice for the same run, is a harmless no-op. Returns
    /// the number of runs whose cancel token was fired.
    pub fn abort(&self, run_id: Option<&str>) -> usize {
        let active = self.active_runs.lock().expect("active runs poisoned");
        match run_id {
            Some(id) => match active.get(id) {
                Some(run) => {
                    run.cancel.cancel();
                    1
                }
                None => 0,
            },
            None => {
                for run in active.values() {
                    run.cancel.cancel();
                }
                active.len()
            }
        }
    }

    /// Queue steering text for `session_key`. Never blocks and never
    /// rejects — if no run is currently in flight for this session, the
    /// text is picked up by the first steering check of the next run.
    pub fn steer(&self, session_key: &str, text: impl Into<String>) {
        self.steering_queue_for(session_key).push(text.into());
    }

    /// Subscribe to the orchestrator's shared event stream. The returned
    /// handle removes the listener on [`EventBus::unsubscribe`] (or can be
    /// dropped and unsubscribed later via another call).
    pub fn subscribe(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> Unsubscribe {
        self.events.subscribe(listener)
    }

    /// Clear a session's log and any queued steering text. Rejected with
    /// [`RunError::SessionBusy`] while a run is still admitted for this
    /// session — resetting out from under an in-flight run would desync
    /// the guard's view of pending `tool_use` entries.
    pub fn reset(&self, session_key: &str) -> Result<(), RunError> {
        let busy = self
            .active_runs
            .lock()
            .expect("active runs poisoned")
            .values()
            .any(|run| run.session_key == session_key);
        if busy {
            return Err(RunError::SessionBusy(session_key.to_string()));
        }

        self.guard
            .clear(session_key)
            .map_err(|e| RunError::ProviderStreamError(e.to_string()))?;
        self.steering_queues
            .lock()
            .expect("steering queues poisoned")
            .remove(session_key);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
