//! In-process world used for offline runs and tests
//!
//! Units integrate their own clamped policy output every tick. Spawn and
//! position-refresh failures can be injected by unit name, and every call
//! is counted so tests can assert what the orchestrator actually did.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{tick_count, unit_step, AgentRuntime, Position, RuntimeError, SpawnRequest};
use crate::model::PolicyNetwork;

const SIM_ADDRESS: &str = "simulated";

#[derive(Debug)]
struct SimUnit {
    session: String,
    model: Arc<PolicyNetwork>,
    origin: Position,
    position: Position,
    clamp: f64,
    frozen: bool,
}

/// Call counters
#[derive(Debug, Default)]
pub struct SimCounters {
    pub spawns: AtomicUsize,
    pub unfreezes: AtomicUsize,
    pub pulses: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub despawns: AtomicUsize,
    pub destroys: AtomicUsize,
}

#[derive(Debug, Default)]
pub struct SimulatedRuntime {
    units: Mutex<HashMap<String, SimUnit>>,
    failing_spawns: Mutex<HashSet<String>>,
    failing_refreshes: Mutex<HashSet<String>>,
    fail_all_spawns: AtomicBool,
    /// Sleep through the pulse window instead of integrating instantly
    realtime: bool,
    pub counters: SimCounters,
}

impl SimulatedRuntime {
    /// Runtime that completes pulse windows without waiting
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime whose pulse blocks for the real window duration
    pub fn realtime() -> Self {
        Self {
            realtime: true,
            ..Self::default()
        }
    }

    /// Make spawning the named unit fail
    pub async fn fail_spawn(&self, name: impl Into<String>) {
        self.failing_spawns.lock().await.insert(name.into());
    }

    /// Make every spawn fail, as if the server refused the whole batch
    pub fn fail_all_spawns(&self, fail: bool) {
        self.fail_all_spawns.store(fail, Ordering::SeqCst);
    }

    /// Make position refresh fail for the named unit
    pub async fn fail_refresh(&self, name: impl Into<String>) {
        self.failing_refreshes.lock().await.insert(name.into());
    }

    pub async fn live_units(&self) -> usize {
        self.units.lock().await.len()
    }

    pub fn spawn_calls(&self) -> usize {
        self.counters.spawns.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.counters.destroys.load(Ordering::SeqCst)
    }
}

impl AgentRuntime for SimulatedRuntime {
    fn address(&self) -> &str {
        SIM_ADDRESS
    }

    async fn spawn(&self, request: SpawnRequest) -> Result<(), RuntimeError> {
        self.counters.spawns.fetch_add(1, Ordering::SeqCst);
        if self.fail_all_spawns.load(Ordering::SeqCst)
            || self.failing_spawns.lock().await.contains(&request.name)
        {
            return Err(RuntimeError::Rejected {
                address: SIM_ADDRESS.to_string(),
                reason: format!("spawn of {} refused", request.name),
            });
        }
        let mut units = self.units.lock().await;
        if units.contains_key(&request.name) {
            return Err(RuntimeError::Rejected {
                address: SIM_ADDRESS.to_string(),
                reason: format!("unit {} already exists", request.name),
            });
        }
        units.insert(
            request.name,
            SimUnit {
                session: request.session,
                model: request.model,
                origin: request.position,
                position: request.position,
                clamp: request.clamp,
                frozen: true,
            },
        );
        Ok(())
    }

    async fn unfreeze_all(&self, session: &str) -> Result<(), RuntimeError> {
        self.counters.unfreezes.fetch_add(1, Ordering::SeqCst);
        for unit in self.units.lock().await.values_mut() {
            if unit.session == session {
                unit.frozen = false;
            }
        }
        Ok(())
    }

    async fn pulse(
        &self,
        session: &str,
        tick_rate_hz: u32,
        duration: Duration,
    ) -> Result<u64, RuntimeError> {
        self.counters.pulses.fetch_add(1, Ordering::SeqCst);
        let ticks = tick_count(tick_rate_hz, duration);
        let period = if tick_rate_hz > 0 {
            Duration::from_secs_f64(1.0 / tick_rate_hz as f64)
        } else {
            duration
        };

        for _ in 0..ticks {
            if self.realtime {
                tokio::time::sleep(period).await;
            }
            let mut units = self.units.lock().await;
            for unit in units.values_mut() {
                if unit.session != session || unit.frozen {
                    continue;
                }
                let delta = unit_step(&unit.model, &unit.origin, &unit.position, unit.clamp);
                unit.position += delta;
            }
        }
        Ok(ticks)
    }

    async fn refresh_position(&self, unit: &str) -> Result<Position, RuntimeError> {
        self.counters.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.failing_refreshes.lock().await.contains(unit) {
            return Err(RuntimeError::Timeout {
                address: SIM_ADDRESS.to_string(),
                millis: 0,
            });
        }
        self.units
            .lock()
            .await
            .get(unit)
            .map(|u| u.position)
            .ok_or_else(|| RuntimeError::UnknownUnit {
                address: SIM_ADDRESS.to_string(),
                unit: unit.to_string(),
            })
    }

    async fn despawn(&self, unit: &str) -> Result<(), RuntimeError> {
        self.counters.despawns.fetch_add(1, Ordering::SeqCst);
        match self.units.lock().await.remove(unit) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::UnknownUnit {
                address: SIM_ADDRESS.to_string(),
                unit: unit.to_string(),
            }),
        }
    }

    async fn destroy_all(&self, session: &str) -> Result<usize, RuntimeError> {
        self.counters.destroys.fetch_add(1, Ordering::SeqCst);
        let mut units = self.units.lock().await;
        let before = units.len();
        units.retain(|_, u| u.session != session);
        Ok(before - units.len())
    }
}
