// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The typed event stream.
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use serde::Serialize;

/// A single event emitted by a run. Every variant carries the `runId` of the
/// run that produced it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    AgentStart {
        run_id: String,
        session_key: String,
    },
    AgentEnd {
        run_id: String,
        final_text: String,
        turns: u32,
        total_tool_calls: u32,
    },
    AgentError {
        run_id: String,
        error: String,
    },
    TurnStart {
        run_id: String,
        turn: u32,
    },
    TurnEnd {
        run_id: String,
        turn: u32,
    },
    MessageDelta {
        run_id: String,
        delta: String,
    },
    MessageEnd {
        run_id: String,
        content: String,
    },
    ThinkingDelta {
        run_id: String,
        delta: String,
    },
    ToolExecutionStart {
        run_id: String,
        call_id: String,
        tool_name: String,
    },
    ToolExecutionEnd {
        run_id: String,
        call_id: String,
        tool_name: String,
        is_error: bool,
    },
    ToolSkipped {
        run_id: String,
        call_id: String,
        tool_name: String,
    },
    Steering {
        run_id: String,
        text: String,
    },
    Compaction {
        run_id: String,
        summary_chars: usize,
        dropped_messages: usize,
    },
    ContextOverflowCompact {
        run_id: String,
    },
    Retry {
        run_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    SubagentSummary {
        run_id: String,
        subagent_id: String,
        summary: String,
    },
    SubagentError {
        run_id: String,
        subagent_id: String,
        error: String,
    },
}

impl Event {
    pub fn run_id(&self) -> &str {
        match self {
            Event::AgentStart { run_id, .. }
            | Event::AgentEnd { run_id, .. }
            | Event::AgentError { run_id, .. }
            | Event::TurnStart { run_id, .. }
            | Event::TurnEnd { run_id, .. }
            | Event::MessageDelta { run_id, .. }
            | Event::MessageEnd { run_id, .. }
            | Event::ThinkingDelta { run_id, .. }
            | Event::ToolExecutionStart { run_id, .. }
            | Event::ToolExecutionEnd { run_id, .. }
            | Event::ToolSkipped { run_id, .. }
            | Event::Steering { run_id, .. }
            | Event::Compaction { run_id, .. }
            | Event::ContextOverflowCompact { run_id }
            | Event::Retry { run_id, .. }
            | Event::SubagentSummary { run_id, .. }
            | Event::SubagentError { run_id, .. } => run_id,
        }
    }

    /// `true` for the event that terminates a run: exactly one of
    /// `agent_end`/`agent_error` fires per run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::AgentEnd { .. } | Event::AgentError { .. })
    }
}

type Listener = dyn Fn(&Event) + Send + Sync;

/// A synchronous subscriber list delivering every pushed event. There is no
/// replay: a listener registered after earlier events were pushed never sees
/// them. Listener panics are caught and swallowed so one faulty subscriber
/// cannot break delivery to the others.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<(u64, Box<Listener>)>>,
    next_id: Mutex<u64>,
}

/// Handle returned by [`EventBus::subscribe`]; dropping or calling
/// [`unsubscribe`][Unsubscribe::unsubscribe] removes the listener.
pub struct Unsubscribe {
    id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, called synchronously for every subsequent
    /// `push`. Returns a handle that removes it again.
    pub fn subscribe(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> Unsubscribe {
        let mut id_guard = self.next_id.lock().expect("EventBus next_id poisoned");
        let id = *id_guard;
        *id_guard += 1;
        drop(id_guard);
        self.listeners
            .lock()
            .expect("EventBus listeners poisoned")
            .push((id, Box::new(listener)));
        Unsubscribe { id }
    }

    pub fn unsubscribe(&self, handle: Unsubscribe) {
        self.listeners
            .lock()
            .expect("EventBus listeners poisoned")
            .retain(|(id, _)| *id != handle.id);
    }

    /// Deliver an event to every registered listener, in registration order.
    /// A panicking listener is caught and logged; it does not stop delivery
    /// to the rest.
    pub fn push(&self, event: &Event) {
        let listeners = self.listeners.lock().expect("EventBus listeners poisoned");
        for (_, listener) in listeners.iter() {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener(event)));
            if result.is_err() {
                tracing::warn!(run_id = %event.run_id(), "event listener panicked; swallowed");
            }
        }
    }

    /// Push the terminal event for a run. Equivalent to `push` but named for
    /// symmetry with the run loop's own `end(result)` call site.
    pub fn end(&self, event: &Event) {
        debug_assert!(event.is_terminal(), "end() must be called with a terminal event");
        self.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ev(run_id: &str) -> Event {
        Event::TurnStart {
            run_id: run_id.into(),
            turn: 1,
        }
    }

    #[test]
    fn subscriber_receives_pushed_event() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let _sub = bus.subscribe(move |_e| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        bus.push(&ev("r1"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_subscriber_does_not_see_past_events() {
        let bus = EventBus::new();
        bus.push(&ev("r1"));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let _sub = bus.subscribe(move |_e| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let sub = bus.subscribe(move |_e| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        bus.unsubscribe(sub);
        bus.push(&ev("r1"));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let _panicker = bus.subscribe(|_e| panic!("boom"));
        let _ok = bus.subscribe(move |_e| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        bus.push(&ev("r1"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn multiple_listeners_all_receive_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            bus.subscribe(move |_e| order.lock().unwrap().push(i));
        }
        bus.push(&ev("r1"));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn is_terminal_true_for_agent_end_and_error_only() {
        let end = Event::AgentEnd {
            run_id: "r".into(),
            final_text: "x".into(),
            turns: 1,
            total_tool_calls: 0,
        };
        let err = Event::AgentError {
            run_id: "r".into(),
            error: "x".into(),
        };
        assert!(end.is_terminal());
        assert!(err.is_terminal());
        assert!(!ev("r").is_terminal());
    }
}
