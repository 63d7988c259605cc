//! Agent runtime: remote evaluation units and the world they live in
//!
//! `AgentRuntime` is the seam between the orchestrator and whatever hosts
//! the simulated world. `TcpRuntime` talks the delimiter-framed JSON wire
//! protocol; `SimulatedRuntime` integrates unit motion in-process for
//! offline runs and tests.

pub mod protocol;
pub mod simulated;
pub mod tcp;
pub mod topology;

pub use simulated::SimulatedRuntime;
pub use tcp::TcpRuntime;
pub use topology::{
    generate_unit_id, parse_planet, probe_with_retries, scan, sphere_points, PlanetInfo, ScanConfig,
    TopologySnapshot,
};

use nalgebra::Vector3;
use std::sync::Arc;
use std::time::Duration;

use crate::model::PolicyNetwork;

/// World-space position
pub type Position = Vector3<f64>;

/// Constant observation every unit is fed, shifted by its displacement
pub const PROBE_INPUT: [f64; 6] = [10.1, -10.2, 10.3, -10.4, 10.5, -10.6];

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("cannot connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {millis} ms talking to {address}")]
    Timeout { address: String, millis: u64 },

    #[error("protocol error from {address}: {reason}")]
    Protocol { address: String, reason: String },

    #[error("{address} rejected request: {reason}")]
    Rejected { address: String, reason: String },

    #[error("unknown unit {unit} at {address}")]
    UnknownUnit { address: String, unit: String },

    #[error("i/o error with {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bad frame from {address}: {source}")]
    Json {
        address: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RuntimeError {
    pub fn address(&self) -> &str {
        match self {
            RuntimeError::Connect { address, .. }
            | RuntimeError::Timeout { address, .. }
            | RuntimeError::Protocol { address, .. }
            | RuntimeError::Rejected { address, .. }
            | RuntimeError::UnknownUnit { address, .. }
            | RuntimeError::Io { address, .. }
            | RuntimeError::Json { address, .. } => address,
        }
    }
}

/// Where and how to reach a world server
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// `host:port`
    pub address: String,
    pub auth_pass: String,
    /// Frame terminator appended to every message
    pub delimiter: String,
    /// Per-request connect/read timeout
    pub timeout: Duration,
}

/// Everything needed to place one unit in the world
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Remote session the unit belongs to (one per lineage)
    pub session: String,
    pub name: String,
    pub model: Arc<PolicyNetwork>,
    pub position: Position,
    /// Symmetric bound on each axis of a unit's per-tick movement
    pub clamp: f64,
}

/// Operations the orchestrator needs from a world server
#[allow(async_fn_in_trait)]
pub trait AgentRuntime {
    /// Human-readable address used in logs and errors
    fn address(&self) -> &str;

    async fn spawn(&self, request: SpawnRequest) -> Result<(), RuntimeError>;

    /// Release every frozen unit of `session` at once
    async fn unfreeze_all(&self, session: &str) -> Result<(), RuntimeError>;

    /// Drive the session's units at `tick_rate_hz` until `duration` elapses.
    /// Returns the number of ticks issued.
    async fn pulse(
        &self,
        session: &str,
        tick_rate_hz: u32,
        duration: Duration,
    ) -> Result<u64, RuntimeError>;

    async fn refresh_position(&self, unit: &str) -> Result<Position, RuntimeError>;

    async fn despawn(&self, unit: &str) -> Result<(), RuntimeError>;

    /// Remove every unit of `session`. Returns how many were removed.
    async fn destroy_all(&self, session: &str) -> Result<usize, RuntimeError>;
}

/// One control step: feed the unit's observation through its policy and
/// clamp the first three outputs into a movement delta.
pub fn unit_step(
    model: &PolicyNetwork,
    origin: &Position,
    position: &Position,
    clamp: f64,
) -> Position {
    let displacement = position - origin;
    let mut input = PROBE_INPUT;
    for axis in 0..3 {
        input[axis] += displacement[axis] * 0.01;
    }
    let output = model.forward(&input);
    let mut delta = Position::zeros();
    for axis in 0..3.min(output.len()) {
        delta[axis] = output[axis].clamp(-clamp, clamp);
    }
    delta
}

/// Number of ticks a pulse window contains
pub fn tick_count(tick_rate_hz: u32, duration: Duration) -> u64 {
    (duration.as_secs_f64() * tick_rate_hz as f64).floor() as u64
}
