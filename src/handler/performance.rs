//! Per-handler performance samples.
//!
//! Every completed batch exchange produces one [`PerformanceStatsSample`].
//! The owning handler's [`PerformanceRecorder`] keeps the most recent ones in
//! a ring buffer for polled snapshots and publishes each to the
//! [`StatsHub`](crate::collector::StatsHub) for live collectors.

use crate::collector::StatsHub;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Which side of a connection produced a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Duration of one named step of a batch exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StageTiming {
    pub name: String,
    pub duration_ms: f64,
}

/// Telemetry for one batch exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PerformanceStatsSample {
    pub direction: Direction,
    /// Source database id (incoming) or destination (outgoing).
    pub peer: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub stages: Vec<StageTiming>,
    pub documents: usize,
    pub tombstones: usize,
    pub conflicts: usize,
    pub superseded: usize,
}

/// Builds a sample while a batch is in flight.
///
/// ```text
/// start ──stage("read")──▶ ──stage("apply")──▶ ──stage("ack")──▶ finish
/// ```
pub struct SampleBuilder {
    direction: Direction,
    peer: String,
    started_at: DateTime<Utc>,
    started: Instant,
    mark: Instant,
    stages: Vec<StageTiming>,
    pub documents: usize,
    pub tombstones: usize,
    pub conflicts: usize,
    pub superseded: usize,
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl SampleBuilder {
    pub fn start(direction: Direction, peer: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            direction,
            peer: peer.into(),
            started_at: Utc::now(),
            started: now,
            mark: now,
            stages: Vec::new(),
            documents: 0,
            tombstones: 0,
            conflicts: 0,
            superseded: 0,
        }
    }

    /// Close the current stage, timing it from the previous mark.
    pub fn stage(&mut self, name: &str) {
        let now = Instant::now();
        self.stages.push(StageTiming {
            name: name.to_string(),
            duration_ms: millis(now.duration_since(self.mark)),
        });
        self.mark = now;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn finish(self) -> PerformanceStatsSample {
        PerformanceStatsSample {
            direction: self.direction,
            peer: self.peer,
            started_at: self.started_at,
            duration_ms: millis(self.started.elapsed()),
            stages: self.stages,
            documents: self.documents,
            tombstones: self.tombstones,
            conflicts: self.conflicts,
            superseded: self.superseded,
        }
    }
}

/// Sample sink owned by one live connection.
pub struct PerformanceRecorder {
    direction: Direction,
    peer: String,
    capacity: usize,
    recent: Mutex<VecDeque<PerformanceStatsSample>>,
    hub: StatsHub,
}

impl PerformanceRecorder {
    pub fn new(direction: Direction, peer: impl Into<String>, capacity: usize, hub: StatsHub) -> Self {
        let capacity = capacity.max(1);
        Self {
            direction,
            peer: peer.into(),
            capacity,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            hub,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Retain `sample` and hand it to every live collector.
    pub async fn record(&self, sample: PerformanceStatsSample) {
        {
            let mut recent = self.recent.lock().await;
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(sample.clone());
        }
        self.hub.publish(&sample).await;
    }

    /// Retained samples, oldest first.
    pub async fn recent(&self) -> Vec<PerformanceStatsSample> {
        self.recent.lock().await.iter().cloned().collect()
    }
}
