//! Status events for observability
//!
//! Events are kept in a bounded ring buffer (oldest dropped first) and
//! published on a broadcast channel so a dashboard can follow along. They
//! never influence control flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;

/// Lifecycle stage of a lineage within a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Generating,
    Generated,
    Skipped,
    SpawningAgents,
    Running,
    Finished,
    Cleaned,
    Aggregate,
    ChampionCheck,
    Leaderboard,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub timestamp: DateTime<Utc>,
    pub generation: u32,
    /// `{type}_{mode}`, or `all` for cross-lineage steps
    pub lineage: String,
    pub variant: Option<usize>,
    pub stage: Stage,
    pub message: String,
}

#[derive(Debug)]
pub struct StatusLog {
    events: VecDeque<StatusEvent>,
    capacity: usize,
    dropped: u64,
    sender: broadcast::Sender<StatusEvent>,
}

impl StatusLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity.min(4096));
        Self {
            events: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            dropped: 0,
            sender,
        }
    }

    pub fn record(
        &mut self,
        generation: u32,
        lineage: impl Into<String>,
        variant: Option<usize>,
        stage: Stage,
        message: impl Into<String>,
    ) {
        let event = StatusEvent {
            timestamp: Utc::now(),
            generation,
            lineage: lineage.into(),
            variant,
            stage,
            message: message.into(),
        };
        log::debug!(
            "[gen {} {} {:?}] {:?}: {}",
            event.generation,
            event.lineage,
            event.variant,
            event.stage,
            event.message
        );
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.dropped += 1;
        }
        // no subscribers is fine
        let _ = self.sender.send(event.clone());
        self.events.push_back(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    pub fn events(&self) -> impl Iterator<Item = &StatusEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events evicted so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Remove and return everything buffered, e.g. at shutdown
    pub fn drain(&mut self) -> Vec<StatusEvent> {
        self.events.drain(..).collect()
    }
}
