// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end happy-path run: a single text reply with no tool calls.
use std::sync::{Arc, Mutex};

use ac_config::Config;
use ac_core::{AgentRuntimeContext, Event, Orchestrator, SessionLog};
use ac_model::{ModelProvider, ScriptedMockProvider};
use ac_tools::ToolRegistry;

fn session_key() -> &'static str {
    "agent:default:session:s1"
}

#[tokio::test]
async fn single_text_reply_produces_the_expected_event_sequence_and_log() {
    let dir = tempfile::tempdir().unwrap();
    let provider: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::always_text("hello"));
    let orch = Orchestrator::with_provider(
        &Config::default(),
        provider,
        Arc::new(ToolRegistry::new()),
        AgentRuntimeContext::default(),
        dir.path(),
    );

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_for_listener = events.clone();
    let _unsub = orch.subscribe(move |event| {
        events_for_listener.lock().unwrap().push(event.clone());
    });

    let result = orch.run(session_key(), "hi").await.unwrap();
    assert_eq!(result.final_text, "hello");

    let kinds: Vec<&'static str> = events
        .lock()
        .unwrap()
        .iter()
        .map(|e| match e {
            Event::AgentStart { .. } => "agent_start",
            Event::TurnStart { .. } => "turn_start",
            Event::MessageDelta { .. } => "message_delta",
            Event::MessageEnd { .. } => "message_end",
            Event::TurnEnd { .. } => "turn_end",
            Event::AgentEnd { .. } => "agent_end",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["agent_start", "turn_start", "message_delta", "message_end", "turn_end", "agent_end"],
    );

    // The one message_delta must carry exactly the scripted text.
    let delta_text = events.lock().unwrap().iter().find_map(|e| match e {
        Event::MessageDelta { delta, .. } => Some(delta.clone()),
        _ => None,
    });
    assert_eq!(delta_text.as_deref(), Some("hello"));

    // Reading back through a fresh SessionLog confirms what was persisted,
    // independent of anything the orchestrator still has cached in memory.
    let log = SessionLog::new(dir.path());
    let messages = log.load(session_key()).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].as_text(), Some("hi"));
    assert_eq!(messages[1].as_text(), Some("hello"));
}
