// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The lane scheduler: two-level FIFO admission bounding concurrency
//! (spec.md §4.A).
//!
//! A call is admitted only after acquiring a slot in its session lane
//! (concurrency 1) AND a slot in the global lane (default concurrency 4), in
//! that order — session first, so a saturated global lane never starves a
//! session that is otherwise idle. `tokio::sync::Semaphore` already queues
//! waiters FIFO, which is what gives both lanes their ordering guarantee.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use ac_config::CancelToken;

use crate::errors::RunError;

/// Holds the two permits admitted for one run. Dropping it releases both
/// slots in acquisition order (global first, then session), which is also
/// the correct release order since the session lane is the outer one a
/// caller can be waiting on.
pub struct LaneGuard {
    _global: OwnedSemaphorePermit,
    _session: OwnedSemaphorePermit,
}

/// Two-level admission control: one global lane shared by every session, and
/// one per-`sessionKey` lane created lazily on first use.
pub struct LaneScheduler {
    global: Arc<Semaphore>,
    sessions: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl LaneScheduler {
    pub fn new(global_concurrency: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_concurrency.max(1))),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn session_lane(&self, session_key: &str) -> Arc<Semaphore> {
        let mut sessions = self.sessions.lock().expect("lane scheduler poisoned");
        sessions
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Admit a run: block until both the session lane and the global lane
    /// have a free slot, in that order. Returns [`RunError::Cancelled`] if
    /// `cancel` fires before admission completes.
    pub async fn admit(&self, session_key: &str, cancel: &CancelToken) -> Result<LaneGuard, RunError> {
        let session_lane = self.session_lane(session_key);
        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunError::Cancelled),
            permit = session_lane.acquire_owned() => permit.expect("session lane semaphore never closes"),
        };
        let global = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunError::Cancelled),
            permit = self.global.clone().acquire_owned() => permit.expect("global lane semaphore never closes"),
        };
        Ok(LaneGuard {
            _global: global,
            _session: session,
        })
    }

    /// Number of free slots in the global lane, for diagnostics.
    pub fn global_available(&self) -> usize {
        self.global.available_permits()
    }
}
