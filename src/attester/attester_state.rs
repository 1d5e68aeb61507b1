//! Observable attester state and validator blocklist

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::error;

/// Most recent failing validators kept out of selection
pub const MAX_VALIDATOR_BLOCKLIST_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttesterPhase {
    Halted,
    SelectingNodes,
    RefillingQueue,
    Attesting,
    Sleeping,
    RetryBackoff,
}

impl fmt::Display for AttesterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttesterPhase::Halted => "HALTED",
            AttesterPhase::SelectingNodes => "SELECTING_NODES",
            AttesterPhase::RefillingQueue => "REFILLING_QUEUE",
            AttesterPhase::Attesting => "ATTESTING",
            AttesterPhase::Sleeping => "SLEEPING",
            AttesterPhase::RetryBackoff => "RETRY_BACKOFF",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttesterState {
    pub phase: AttesterPhase,
    pub last_success_challenge_time: Option<DateTime<Utc>>,
    pub last_challenge_time: Option<DateTime<Utc>>,
    pub last_action_time: DateTime<Utc>,
}

impl Default for AttesterState {
    fn default() -> Self {
        Self {
            phase: AttesterPhase::Halted,
            last_success_challenge_time: None,
            last_challenge_time: None,
            last_action_time: Utc::now(),
        }
    }
}

/// Receives every state change, e.g. to back a health endpoint
#[async_trait]
pub trait StateSink: Send + Sync {
    async fn on_state_change(&self, state: &AttesterState) -> Result<()>;
}

/// Owns the attester state and pushes each change to the optional sink.
/// Sink failures are logged and dropped.
pub struct StateTracker {
    state: AttesterState,
    sink: Option<Arc<dyn StateSink>>,
}

impl StateTracker {
    pub fn new(sink: Option<Arc<dyn StateSink>>) -> Self {
        Self {
            state: AttesterState::default(),
            sink,
        }
    }

    pub fn state(&self) -> &AttesterState {
        &self.state
    }

    pub fn set_sink(&mut self, sink: Arc<dyn StateSink>) {
        self.sink = Some(sink);
    }

    pub async fn set_phase(&mut self, phase: AttesterPhase) {
        self.update(|state| state.phase = phase).await;
    }

    /// Stamp the end of one attestation round
    pub async fn record_round(&mut self, any_success: bool) {
        let now = Utc::now();
        self.update(|state| {
            state.last_challenge_time = Some(now);
            if any_success {
                state.last_success_challenge_time = Some(now);
            }
        })
        .await;
    }

    async fn update(&mut self, apply: impl FnOnce(&mut AttesterState)) {
        apply(&mut self.state);
        self.state.last_action_time = Utc::now();
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.on_state_change(&self.state).await {
                error!(error = %e, "Failed to push attester state");
            }
        }
    }
}

/// Bounded, insertion-ordered set of validator endpoints to avoid
#[derive(Debug, Clone)]
pub struct ValidatorBlocklist {
    entries: VecDeque<String>,
    capacity: usize,
}

impl Default for ValidatorBlocklist {
    fn default() -> Self {
        Self::with_capacity(MAX_VALIDATOR_BLOCKLIST_LEN)
    }
}

impl ValidatorBlocklist {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add new endpoints, evicting the oldest past capacity
    pub fn extend<I: IntoIterator<Item = String>>(&mut self, endpoints: I) {
        for endpoint in endpoints {
            if !self.entries.contains(&endpoint) {
                self.entries.push_back(endpoint);
            }
        }
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_set(&self) -> HashSet<String> {
        self.entries.iter().cloned().collect()
    }
}
