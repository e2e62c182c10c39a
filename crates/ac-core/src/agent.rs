// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent loop (spec.md §4.E): turn-by-turn orchestration of one LLM
//! conversation, including tool dispatch, steering injection, retry on
//! transient provider errors, and overflow-triggered compaction.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use ac_config::CancelToken;
use ac_model::{
    CompletionRequest, FunctionCall, Message as WireMessage, MessageContent as WireContent, ModelProvider,
    ResponseEvent, Role as WireRole, ToolSchema as WireToolSchema,
};
use ac_tools::{ToolCall as ExecToolCall, ToolContext, ToolPolicy, ToolRegistry};

use crate::compact::{self, CompactionSettings, Summarizer};
use crate::errors::RunError;
use crate::events::{Event, EventBus};
use crate::guard::ToolResultGuard;
use crate::message::{ContentBlock, Message, Role};
use crate::prune::{self, PruneSettings};

/// Retry policy for transient rate-limit errors (spec.md §4.E.1).
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 300;
const RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Non-cryptographic jitter in `[-10%, +10%]` derived from the wall clock, to
/// avoid every concurrently-throttled run retrying in lockstep.
fn jittered_delay(base_ms: u64) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let spread = (nanos % 2000) as i64 - 1000; // [-1000, 1000] => [-10%, +10%] of base*10000
    let delta = (base_ms as i64 * spread) / 10_000;
    Duration::from_millis((base_ms as i64 + delta).max(0) as u64)
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(10));
    jittered_delay(exp.min(RETRY_MAX_DELAY_MS))
}

/// FIFO queue of user-supplied steering text, checked between turns and
/// between individual tool executions. Never blocks or rejects a push.
pub trait SteeringSource: Send + Sync {
    fn try_next(&self) -> Option<String>;
}

/// Optional hook polled at outer-loop boundaries — whenever the inner loop
/// would otherwise terminate (no pending tool calls, no queued steering) —
/// to re-enter the loop with additional messages (spec.md §4.E.4). Absent in
/// plain interactive chat; used by subagent completion reporting to fold a
/// subagent's summary back into the parent run without ending it first.
pub trait FollowUpSource: Send + Sync {
    fn try_next(&self) -> Vec<String>;
}

/// Converts the persisted domain model into the wire shape a
/// [`ModelProvider`] expects. A single `ac_core` message can carry several
/// content blocks (e.g. text plus a handful of `tool_use`s); each block that
/// needs its own wire message is flattened out in order.
fn to_wire_messages(messages: &[Message]) -> Vec<WireMessage> {
    let mut out = Vec::new();
    for message in messages {
        match message.role {
            Role::User => {
                if message.is_tool_result_message() {
                    for block in &message.content {
                        if let ContentBlock::ToolResult { tool_use_id, content, .. } = block {
                            out.push(WireMessage::tool_result(tool_use_id.clone(), content.clone()));
                        }
                    }
                } else {
                    for block in &message.content {
                        if let ContentBlock::Text { text } = block {
                            out.push(WireMessage::user(text.clone()));
                        }
                    }
                }
            }
            Role::Assistant => {
                for block in &message.content {
                    match block {
                        ContentBlock::Text { text } => out.push(WireMessage::assistant(text.clone())),
                        ContentBlock::ToolUse { id, name, input } => {
                            out.push(WireMessage {
                                role: WireRole::Assistant,
                                content: WireContent::ToolCall {
                                    tool_call_id: id.clone(),
                                    function: FunctionCall {
                                        name: name.clone(),
                                        arguments: input.to_string(),
                                    },
                                },
                            });
                        }
                        ContentBlock::ToolResult { .. } => {}
                    }
                }
            }
        }
    }
    out
}

fn to_wire_tools(schemas: &[ac_tools::ToolSchema]) -> Vec<WireToolSchema> {
    schemas
        .iter()
        .map(|s| WireToolSchema {
            name: s.name.clone(),
            description: s.description.clone(),
            parameters: s.parameters.clone(),
        })
        .collect()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Accumulated state of one in-flight model turn, built up from
/// [`ResponseEvent`]s as they stream in.
#[derive(Default)]
struct TurnAccumulator {
    text: String,
    #[allow(dead_code)]
    thinking: String,
    tool_calls: Vec<(u32, String, String, String)>, // (index, id, name, arguments)
    #[allow(dead_code)]
    input_tokens: u32,
    #[allow(dead_code)]
    output_tokens: u32,
}

impl TurnAccumulator {
    fn push_tool_delta(&mut self, index: u32, id: String, name: String, arguments: String) {
        if let Some(existing) = self.tool_calls.iter_mut().find(|(i, ..)| *i == index) {
            if !id.is_empty() {
                existing.1 = id;
            }
            if !name.is_empty() {
                existing.2 = name;
            }
            existing.3.push_str(&arguments);
        } else {
            self.tool_calls.push((index, id, name, arguments));
        }
    }

    fn ordered_tool_calls(&self) -> Vec<(String, String, String)> {
        let mut calls = self.tool_calls.clone();
        calls.sort_by_key(|(i, ..)| *i);
        calls.into_iter().map(|(_, id, name, args)| (id, name, args)).collect()
    }
}

/// Run one streaming completion to exhaustion, invoking the callbacks for
/// every delta so the caller can forward progress to the [`EventBus`].
/// Returns the accumulated turn on success, or an `anyhow::Error` whose
/// message the caller classifies via `RunError::is_rate_limit_message` /
/// `is_context_overflow_message`.
async fn run_completion(
    provider: &dyn ModelProvider,
    req: CompletionRequest,
    mut on_text: impl FnMut(&str),
    mut on_thinking: impl FnMut(&str),
) -> anyhow::Result<TurnAccumulator> {
    let mut stream = provider.complete(req).await?;
    let mut acc = TurnAccumulator::default();
    while let Some(event) = stream.next().await {
        match event? {
            ResponseEvent::TextDelta(delta) => {
                on_text(&delta);
                acc.text.push_str(&delta);
            }
            ResponseEvent::ThinkingDelta(delta) => {
                on_thinking(&delta);
                acc.thinking.push_str(&delta);
            }
            ResponseEvent::ToolCall { index, id, name, arguments } => {
                acc.push_tool_delta(index, id, name, arguments);
            }
            ResponseEvent::Usage { input_tokens, output_tokens, .. } => {
                acc.input_tokens = input_tokens;
                acc.output_tokens = output_tokens;
            }
            ResponseEvent::Error(msg) => anyhow::bail!(msg),
            ResponseEvent::Done => break,
        }
    }
    Ok(acc)
}

/// Drive [`run_completion`] with the rate-limit retry policy (§4.E.1): up to
/// three attempts, exponential backoff from 300ms to 30s with ±10% jitter,
/// retried only when the error message classifies as a rate limit.
async fn stream_with_retry(
    provider: &dyn ModelProvider,
    build_req: impl Fn() -> CompletionRequest,
    events: &EventBus,
    run_id: &str,
    on_text: impl Fn(&str),
    on_thinking: impl Fn(&str),
) -> Result<TurnAccumulator, RunError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = run_completion(provider, build_req(), |d| on_text(d), |d| on_thinking(d)).await;
        match result {
            Ok(acc) => return Ok(acc),
            Err(e) => {
                let msg = e.to_string();
                if RunError::is_rate_limit_message(&msg) && attempt < RETRY_ATTEMPTS {
                    let delay = backoff_delay(attempt);
                    events.push(&Event::Retry {
                        run_id: run_id.to_string(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    });
                    tokio::time::sleep(delay).await;
                    continue;
                }
                if RunError::is_rate_limit_message(&msg) {
                    return Err(RunError::RateLimitTransient(msg));
                }
                if RunError::is_context_overflow_message(&msg) {
                    return Err(RunError::ContextOverflow(msg));
                }
                return Err(RunError::ProviderStreamError(msg));
            }
        }
    }
}

/// Bridges [`ModelProvider`] into the `compact` module's [`Summarizer`]
/// abstraction, so `ac_core::compact` itself stays independent of
/// `ac_model`.
pub struct ModelSummarizer {
    provider: Arc<dyn ModelProvider>,
}

impl ModelSummarizer {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    async fn summarize(&self, system_prompt: &str, transcript: &str) -> anyhow::Result<String> {
        let req = CompletionRequest {
            messages: vec![WireMessage::system(system_prompt), WireMessage::user(transcript)],
            tools: Vec::new(),
            stream: true,
            system_dynamic_suffix: None,
        };
        let acc = run_completion(self.provider.as_ref(), req, |_| {}, |_| {}).await?;
        Ok(acc.text)
    }
}

/// Collaborators the loop needs for exactly one run. Constructed fresh per
/// call by the orchestrator; holds only `Arc`/`Clone`-cheap handles.
pub struct AgentLoop {
    pub provider: Arc<dyn ModelProvider>,
    pub tools: Arc<ToolRegistry>,
    pub tool_policy: ToolPolicy,
    pub guard: Arc<ToolResultGuard>,
    pub events: Arc<EventBus>,
    pub max_turns: u32,
    pub context_window_tokens: u32,
    pub reserve_tokens: u32,
    pub prune_settings: PruneSettings,
    pub compaction_settings: CompactionSettings,
    pub system_prompt: String,
    pub system_dynamic_suffix: Option<String>,
}

/// Final outcome of a completed run.
pub struct RunOutput {
    pub final_text: String,
    pub turns: u32,
    pub total_tool_calls: u32,
}

impl AgentLoop {
    /// Execute the outer/inner turn loop against `session_key`, persisting
    /// every message through `self.guard` and emitting the full event
    /// taxonomy on `self.events`. Returns once the model produces a turn with
    /// no pending tool calls, the turn budget is exhausted, or cancellation
    /// fires.
    pub async fn run(
        &self,
        run_id: &str,
        session_key: &str,
        user_text: &str,
        steering: &dyn SteeringSource,
        cancel: &CancelToken,
    ) -> Result<RunOutput, RunError> {
        self.run_with_follow_up(run_id, session_key, user_text, steering, None, cancel).await
    }

    /// Like [`run`][Self::run], but additionally polls `follow_up` (if given)
    /// every time the inner loop would otherwise terminate, re-entering the
    /// outer loop with whatever messages it returns (spec.md §4.E.4).
    pub async fn run_with_follow_up(
        &self,
        run_id: &str,
        session_key: &str,
        user_text: &str,
        steering: &dyn SteeringSource,
        follow_up: Option<&dyn FollowUpSource>,
        cancel: &CancelToken,
    ) -> Result<RunOutput, RunError> {
        self.events.push(&Event::AgentStart {
            run_id: run_id.to_string(),
            session_key: session_key.to_string(),
        });

        let result = self.run_inner(run_id, session_key, user_text, steering, follow_up, cancel).await;

        // The log must never be left with an unresolved `tool_use`, whether
        // the run finished cleanly, errored, or was cancelled mid-tool-call.
        let _ = self.guard.flush_pending_tool_results(session_key);

        match &result {
            Ok(out) => self.events.end(&Event::AgentEnd {
                run_id: run_id.to_string(),
                final_text: out.final_text.clone(),
                turns: out.turns,
                total_tool_calls: out.total_tool_calls,
            }),
            Err(e) => self.events.end(&Event::AgentError {
                run_id: run_id.to_string(),
                error: e.to_string(),
            }),
        }
        result
    }

    async fn run_inner(
        &self,
        run_id: &str,
        session_key: &str,
        user_text: &str,
        steering: &dyn SteeringSource,
        follow_up: Option<&dyn FollowUpSource>,
        cancel: &CancelToken,
    ) -> Result<RunOutput, RunError> {
        let reserve = self.reserve_tokens;
        if (self.context_window_tokens as i64) < ac_config::CONTEXT_WINDOW_HARD_MIN as i64 {
            return Err(RunError::ContextWindowTooSmall(format!(
                "{} < {}",
                self.context_window_tokens,
                ac_config::CONTEXT_WINDOW_HARD_MIN
            )));
        }

        self.guard
            .append(session_key, Message::user_text(user_text, now_ms()))
            .map_err(|e| RunError::ProviderStreamError(e.to_string()))?;

        let mut overflow_compaction_tried = false;
        let mut turn: u32 = 0;
        let mut total_tool_calls: u32 = 0;
        let mut final_text = String::new();
        // Text detected mid-tool-execution (see the tool-call loop below) is
        // already announced via `Event::Steering` at detection time; it is
        // carried here so the *next* turn still opens with it as a user
        // message, without firing a second event for the same text.
        let mut carried_steer_text: Option<String> = None;

        'outer: while turn < self.max_turns {
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }

            if let Some(text) = carried_steer_text.take() {
                self.guard
                    .append(session_key, Message::user_text(&text, now_ms()))
                    .map_err(|e| RunError::ProviderStreamError(e.to_string()))?;
            } else if let Some(text) = steering.try_next() {
                self.guard
                    .append(session_key, Message::user_text(&text, now_ms()))
                    .map_err(|e| RunError::ProviderStreamError(e.to_string()))?;
                self.events.push(&Event::Steering {
                    run_id: run_id.to_string(),
                    text,
                });
            }

            turn += 1;
            self.events.push(&Event::TurnStart {
                run_id: run_id.to_string(),
                turn,
            });

            let messages = self
                .guard
                .load(session_key)
                .map_err(|e| RunError::ProviderStreamError(e.to_string()))?;
            let total_tokens: usize = messages.iter().map(Message::approx_tokens).sum();

            if compact::should_trigger_compaction(total_tokens, self.context_window_tokens, reserve)
                && !overflow_compaction_tried
            {
                self.compact_session(session_key, &messages, run_id).await?;
                overflow_compaction_tried = true;
            }

            let live = self.guard.load(session_key).map_err(|e| RunError::ProviderStreamError(e.to_string()))?;
            let pruned = prune::prune_context_messages(
                &live,
                self.context_window_tokens,
                &self.prune_settings,
                Some(&self.tool_policy),
            );

            let wire_messages = to_wire_messages(&pruned.messages);
            let tool_schemas = to_wire_tools(&self.tools.schemas());
            let build_req = {
                let wire_messages = wire_messages.clone();
                let tool_schemas = tool_schemas.clone();
                let system_prompt = self.system_prompt.clone();
                let system_dynamic_suffix = self.system_dynamic_suffix.clone();
                move || {
                    let mut messages = Vec::with_capacity(wire_messages.len() + 1);
                    messages.push(WireMessage::system(system_prompt.clone()));
                    messages.extend(wire_messages.iter().cloned());
                    CompletionRequest {
                        messages,
                        tools: tool_schemas.clone(),
                        stream: true,
                        system_dynamic_suffix: system_dynamic_suffix.clone(),
                    }
                }
            };

            let on_text = {
                let events = self.events.clone();
                let run_id_owned = run_id.to_string();
                move |delta: &str| {
                    events.push(&Event::MessageDelta {
                        run_id: run_id_owned.clone(),
                        delta: delta.to_string(),
                    });
                }
            };
            let on_thinking = {
                let events = self.events.clone();
                let run_id_owned = run_id.to_string();
                move |delta: &str| {
                    events.push(&Event::ThinkingDelta {
                        run_id: run_id_owned.clone(),
                        delta: delta.to_string(),
                    });
                }
            };

            let turn_result =
                stream_with_retry(self.provider.as_ref(), build_req, &self.events, run_id, on_text, on_thinking)
                    .await;

            let acc = match turn_result {
                Ok(acc) => acc,
                Err(RunError::ContextOverflow(_)) if !overflow_compaction_tried => {
                    let messages = self
                        .guard
                        .load(session_key)
                        .map_err(|e| RunError::ProviderStreamError(e.to_string()))?;
                    self.events.push(&Event::ContextOverflowCompact {
                        run_id: run_id.to_string(),
                    });
                    self.compact_session(session_key, &messages, run_id).await?;
                    overflow_compaction_tried = true;
                    turn = turn.saturating_sub(1);
                    continue 'outer;
                }
                Err(e) => return Err(e),
            };

            self.events.push(&Event::MessageEnd {
                run_id: run_id.to_string(),
                content: acc.text.clone(),
            });

            let tool_calls = acc.ordered_tool_calls();
            let mut assistant_blocks: Vec<ContentBlock> = Vec::new();
            if !acc.text.is_empty() {
                assistant_blocks.push(ContentBlock::text(acc.text.clone()));
            }
            for (id, name, args) in &tool_calls {
                let parsed = serde_json::from_str(args).unwrap_or(serde_json::Value::Null);
                assistant_blocks.push(ContentBlock::tool_use(id.clone(), name.clone(), parsed));
            }
            if assistant_blocks.is_empty() {
                assistant_blocks.push(ContentBlock::text(String::new()));
            }
            self.guard
                .append(
                    session_key,
                    Message {
                        role: Role::Assistant,
                        timestamp: now_ms(),
                        content: assistant_blocks,
                    },
                )
                .map_err(|e| RunError::ProviderStreamError(e.to_string()))?;

            final_text = acc.text.clone();

            if tool_calls.is_empty() {
                self.events.push(&Event::TurnEnd {
                    run_id: run_id.to_string(),
                    turn,
                });
                // The inner loop has nothing left to do. If steering already
                // queued text, let the normal top-of-loop handling pick it up
                // next iteration. Otherwise give the follow-up hook, if any,
                // a chance to fold more messages in before the run ends.
                if carried_steer_text.is_some() {
                    continue 'outer;
                }
                if let Some(text) = steering.try_next() {
                    carried_steer_text = Some(text);
                    continue 'outer;
                }
                if let Some(texts) = follow_up.map(FollowUpSource::try_next).filter(|t| !t.is_empty()) {
                    for text in texts {
                        self.guard
                            .append(session_key, Message::user_text(&text, now_ms()))
                            .map_err(|e| RunError::ProviderStreamError(e.to_string()))?;
                    }
                    continue 'outer;
                }
                break 'outer;
            }

            let mut result_blocks: Vec<ContentBlock> = Vec::new();
            let mut steered = false;
            for (id, name, args_json) in &tool_calls {
                if steered {
                    self.events.push(&Event::ToolSkipped {
                        run_id: run_id.to_string(),
                        call_id: id.clone(),
                        tool_name: name.clone(),
                    });
                    result_blocks.push(ContentBlock::tool_result(
                        id.clone(),
                        Some(name.clone()),
                        "Skipped due to queued user message.",
                    ));
                    continue;
                }

                self.events.push(&Event::ToolExecutionStart {
                    run_id: run_id.to_string(),
                    call_id: id.clone(),
                    tool_name: name.clone(),
                });
                let args = serde_json::from_str(args_json).unwrap_or(serde_json::Value::Null);
                let exec_call = ExecToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    args,
                };
                let ctx = ToolContext {
                    workspace_dir: std::env::current_dir().unwrap_or_default(),
                    session_key: session_key.to_string(),
                    agent_id: session_key.to_string(),
                    cancel_token: cancel.child(),
                    metadata: HashMap::new(),
                };
                let output = self.tools.execute(&exec_call, &ctx).await;
                total_tool_calls += 1;
                self.events.push(&Event::ToolExecutionEnd {
                    run_id: run_id.to_string(),
                    call_id: id.clone(),
                    tool_name: name.clone(),
                    is_error: output.is_error,
                });
                result_blocks.push(ContentBlock::tool_result(id.clone(), Some(name.clone()), output.content));

                if let Some(text) = steering.try_next() {
                    self.events.push(&Event::Steering {
                        run_id: run_id.to_string(),
                        text: text.clone(),
                    });
                    steered = true;
                    carried_steer_text = Some(text);
                }
            }

            self.guard
                .append(session_key, Message::user_tool_results(result_blocks, now_ms()))
                .map_err(|e| RunError::ProviderStreamError(e.to_string()))?;

            self.events.push(&Event::TurnEnd {
                run_id: run_id.to_string(),
                turn,
            });
        }

        Ok(RunOutput {
            final_text,
            turns: turn,
            total_tool_calls,
        })
    }

    async fn compact_session(&self, session_key: &str, messages: &[Message], run_id: &str) -> Result<(), RunError> {
        let pruned = prune::prune_context_messages(
            messages,
            self.context_window_tokens,
            &self.prune_settings,
            Some(&self.tool_policy),
        );
        if pruned.dropped_messages.is_empty() {
            return Ok(());
        }
        let summarizer = ModelSummarizer::new(self.provider.clone());
        let summary = compact::build_compaction_summary(&pruned.dropped_messages, &self.compaction_settings, &summarizer)
            .await
            .map_err(|e| RunError::ContextOverflow(e.to_string()))?;

        let with_ids = self
            .guard
            .load_with_ids(session_key)
            .map_err(|e| RunError::ProviderStreamError(e.to_string()))?;
        let first_kept_index = with_ids.len().saturating_sub(pruned.messages.len());
        let first_kept_entry_id = with_ids
            .get(first_kept_index)
            .map(|(id, _)| id.clone())
            .unwrap_or_default();

        let tokens_before: usize = messages.iter().map(Message::approx_tokens).sum();
        let compaction_message = compact::build_compaction_message(&pruned.dropped_messages, &summary, now_ms());
        self.guard
            .append_compaction(session_key, compaction_message, &first_kept_entry_id, tokens_before)
            .map_err(|e| RunError::ProviderStreamError(e.to_string()))?;

        self.events.push(&Event::Compaction {
            run_id: run_id.to_string(),
            summary_chars: summary.len(),
            dropped_messages: pruned.dropped_messages.len(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ac_config::ToolPolicyConfig;
    use ac_model::ScriptedMockProvider;
    use async_trait::async_trait as async_trait_attr;
    use std::sync::Mutex as StdMutex;

    struct NoSteering;
    impl SteeringSource for NoSteering {
        fn try_next(&self) -> Option<String> {
            None
        }
    }

    struct QueueSteering(StdMutex<std::collections::VecDeque<String>>);
    impl SteeringSource for QueueSteering {
        fn try_next(&self) -> Option<String> {
            self.0.lock().unwrap().pop_front()
        }
    }

    struct EchoTool;
    #[async_trait_attr]
    impl ac_tools::Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn default_policy(&self) -> ac_tools::ApprovalPolicy {
            ac_tools::ApprovalPolicy::Auto
        }
        async fn execute(&self, call: &ExecToolCall, _ctx: &ToolContext) -> anyhow::Result<ac_tools::ToolOutput> {
            Ok(ac_tools::ToolOutput::ok(&call.id, "echoed"))
        }
    }

    fn loop_with(provider: Arc<dyn ModelProvider>, dir: &tempfile::TempDir) -> AgentLoop {
        let log = Arc::new(crate::session_log::SessionLog::new(dir.path()));
        let guard = Arc::new(ToolResultGuard::new(log));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        AgentLoop {
            provider,
            tools: Arc::new(registry),
            tool_policy: ToolPolicy::from_config(&ToolPolicyConfig::default()),
            guard,
            events: Arc::new(EventBus::new()),
            max_turns: 10,
            context_window_tokens: 200_000,
            reserve_tokens: 20_000,
            prune_settings: PruneSettings::default(),
            compaction_settings: CompactionSettings::default(),
            system_prompt: "you are a test agent".to_string(),
            system_dynamic_suffix: None,
        }
    }

    #[tokio::test]
    async fn simple_text_reply_ends_the_run_with_no_tool_calls() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::always_text("hi there"));
        let agent = loop_with(provider, &dir);
        let cancel = CancelToken::new();
        let out = agent.run("run1", "s1", "hello", &NoSteering, &cancel).await.unwrap();
        assert_eq!(out.final_text, "hi there");
        assert_eq!(out.turns, 1);
        assert_eq!(out.total_tool_calls, 0);
    }

    #[tokio::test]
    async fn tool_call_then_text_executes_the_tool_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn ModelProvider> =
            Arc::new(ScriptedMockProvider::tool_then_text("t1", "echo", "{}", "done"));
        let agent = loop_with(provider, &dir);
        let cancel = CancelToken::new();
        let out = agent
            .run("run1", "s1", "do the thing", &NoSteering, &cancel)
            .await
            .unwrap();
        assert_eq!(out.final_text, "done");
        assert_eq!(out.total_tool_calls, 1);
        assert_eq!(out.turns, 2);
    }

    #[tokio::test]
    async fn cancelled_before_start_returns_cancelled_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::always_text("unused"));
        let agent = loop_with(provider, &dir);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = agent.run("run1", "s1", "hi", &NoSteering, &cancel).await.unwrap_err();
        assert!(matches!(err, RunError::Cancelled));
    }

    #[tokio::test]
    async fn steering_text_is_injected_as_a_user_message_before_the_next_turn() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::new(vec![vec![
            ResponseEvent::TextDelta("first".into()),
            ResponseEvent::Done,
        ]]));
        let agent = loop_with(provider, &dir);
        let steering = QueueSteering(StdMutex::new(std::collections::VecDeque::from(vec!["steer now".to_string()])));
        let cancel = CancelToken::new();
        agent.run("run1", "s1", "hello", &steering, &cancel).await.unwrap();
        let messages = agent.guard.load("s1").unwrap();
        assert!(messages.iter().any(|m| m.as_text() == Some("steer now")));
    }

    #[tokio::test]
    async fn max_turns_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let scripts: Vec<Vec<ResponseEvent>> = (0..5)
            .map(|_| {
                vec![
                    ResponseEvent::ToolCall {
                        index: 0,
                        id: "t".into(),
                        name: "echo".into(),
                        arguments: "{}".into(),
                    },
                    ResponseEvent::Done,
                ]
            })
            .collect();
        let provider: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::new(scripts));
        let mut agent = loop_with(provider, &dir);
        agent.max_turns = 3;
        let cancel = CancelToken::new();
        let out = agent.run("run1", "s1", "loop forever", &NoSteering, &cancel).await.unwrap();
        assert_eq!(out.turns, 3);
    }

    struct OnceFollowUp(StdMutex<Vec<Vec<String>>>);
    impl FollowUpSource for OnceFollowUp {
        fn try_next(&self) -> Vec<String> {
            let mut batches = self.0.lock().unwrap();
            if batches.is_empty() {
                Vec::new()
            } else {
                batches.remove(0)
            }
        }
    }

    #[tokio::test]
    async fn follow_up_messages_reenter_the_outer_loop_after_the_inner_loop_would_terminate() {
        let dir = tempfile::tempdir().unwrap();
        // Two text-only turns: the first ends the inner loop, at which point
        // the follow-up hook injects a message that drives a second turn.
        let provider: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::new(vec![
            vec![ResponseEvent::TextDelta("first reply".into()), ResponseEvent::Done],
            vec![ResponseEvent::TextDelta("second reply".into()), ResponseEvent::Done],
        ]));
        let agent = loop_with(provider, &dir);
        let follow_up = OnceFollowUp(StdMutex::new(vec![vec!["subagent finished: ok".to_string()]]));
        let cancel = CancelToken::new();
        let out = agent
            .run_with_follow_up("run1", "s1", "start", &NoSteering, Some(&follow_up), &cancel)
            .await
            .unwrap();
        assert_eq!(out.final_text, "second reply");
        assert_eq!(out.turns, 2);
        let messages = agent.guard.load("s1").unwrap();
        assert!(messages.iter().any(|m| m.as_text() == Some("subagent finished: ok")));
    }

    #[tokio::test]
    async fn no_follow_up_source_ends_the_run_on_the_first_text_only_turn() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::always_text("just one turn"));
        let agent = loop_with(provider, &dir);
        let cancel = CancelToken::new();
        let out = agent.run("run1", "s1", "hi", &NoSteering, &cancel).await.unwrap();
        assert_eq!(out.turns, 1);
    }
}
