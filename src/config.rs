//! Experiment configuration
//!
//! One JSON file describes the lineages, world locations, population size,
//! mutation magnitude, evaluation replicas and generation count. Every
//! section has defaults so partial files load. A handful of environment
//! variables override connection settings after loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EvolveError, Result};
use crate::model::{Activation, ExperimentMode, LineageKey, ModelBlueprint, NumericType};
use crate::runtime::{parse_planet, Endpoint, Position, ScanConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub name: String,
    pub description: String,
    /// Numeric representation tags, e.g. `"float32"`
    pub numerical_types: Vec<String>,
    /// Structural modes, e.g. `"Replay"`
    pub modes: Vec<String>,
    /// World locations written as `(x,y,z)` in planet-grid units
    pub planets: Vec<String>,
    /// Number of generations to run
    pub episodes: u32,
    /// Population size per lineage and generation
    pub spectrum_steps: usize,
    /// Perturbation standard deviation
    pub spectrum_max_stddev: f64,
    /// Units spawned per planet for every variant
    pub evaluation_spawns_per_planet: usize,
    pub network_config: NetworkConfig,
    pub movement: MovementConfig,
    pub runtime: RuntimeConfig,
    pub evaluation: EvaluationSettings,
    pub models_root: PathBuf,
    /// Namespace mixed into every unit id
    pub unit_namespace: String,
    /// Number of status events kept in memory
    pub status_capacity: usize,
    /// Age after which another process may take over a lineage lease
    pub lease_ttl_secs: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "spectrum".to_string(),
            description: String::new(),
            numerical_types: vec!["float32".to_string()],
            modes: vec!["Standard".to_string()],
            planets: vec!["(0,0,0)".to_string()],
            episodes: 1,
            spectrum_steps: 4,
            spectrum_max_stddev: 0.1,
            evaluation_spawns_per_planet: 3,
            network_config: NetworkConfig::default(),
            movement: MovementConfig::default(),
            runtime: RuntimeConfig::default(),
            evaluation: EvaluationSettings::default(),
            models_root: PathBuf::from("models"),
            unit_namespace: "spectrum".to_string(),
            status_capacity: 1024,
            lease_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Input layer first. Empty means the default 6-128-128-3 shape.
    pub layers: Vec<LayerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub width: usize,
    #[serde(default = "one")]
    pub height: usize,
    #[serde(default = "linear")]
    pub activation: String,
}

fn one() -> usize {
    1
}

fn linear() -> String {
    "linear".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    pub translation: TranslationConfig,
    #[serde(rename = "max_lifespan_seconds")]
    pub max_lifespan_secs: u64,
}

/// Per-unit movement limits. Zero values defer to `evaluation`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub clamp: AxisClamp,
    pub actions_per_second: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisClamp {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub host: String,
    pub port: u16,
    pub auth_pass: String,
    pub delimiter: String,
    pub connect_timeout_ms: u64,
    pub probe_delay_ms: u64,
    pub probe_attempts: u32,
    pub scan_port_step: u16,
    pub scan_pods: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 14000,
            auth_pass: "my_secure_password".to_string(),
            delimiter: "<???DONE???---".to_string(),
            connect_timeout_ms: 2000,
            probe_delay_ms: 2000,
            probe_attempts: 10,
            scan_port_step: 3,
            scan_pods: 1,
        }
    }
}

/// Constants of one evaluation round
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSettings {
    pub pulse_rate_hz: u32,
    pub duration_ms: u64,
    pub output_clamp: f64,
    /// World units per planet-grid unit
    pub planet_spacing: f64,
    /// Radius of the spawn sphere around a planet
    pub spawn_radius: f64,
    /// Goal position relative to the planet center
    pub goal_offset: [f64; 3],
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            pulse_rate_hz: 10,
            duration_ms: 10_000,
            output_clamp: 20.0,
            planet_spacing: 800.0,
            spawn_radius: 120.0,
            goal_offset: [0.0, 100.0, 0.0],
        }
    }
}

impl EvaluationSettings {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn goal_offset(&self) -> Position {
        Position::new(self.goal_offset[0], self.goal_offset[1], self.goal_offset[2])
    }
}

/// A configured world location
#[derive(Debug, Clone, PartialEq)]
pub struct Planet {
    /// The string as written in the config
    pub label: String,
    /// Grid position (not yet scaled by the planet spacing)
    pub grid: Position,
}

impl ExperimentConfig {
    /// Load from a JSON file and apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let mut config: Self = serde_json::from_slice(&data)
            .map_err(|e| EvolveError::Config(format!("{}: {}", path.display(), e)))?;
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `GAME_HOST`, `GAME_PORT`, `GAME_AUTH` and `SPECTRUM_MODELS_ROOT`
    /// as returned by `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("GAME_HOST").filter(|v| !v.is_empty()) {
            self.runtime.host = host;
        }
        if let Some(port) = lookup("GAME_PORT").filter(|v| !v.is_empty()) {
            match port.parse() {
                Ok(p) => self.runtime.port = p,
                Err(_) => log::warn!(
                    "GAME_PORT '{}' is not a valid port, keeping {}",
                    port,
                    self.runtime.port
                ),
            }
        }
        if let Some(pass) = lookup("GAME_AUTH").filter(|v| !v.is_empty()) {
            self.runtime.auth_pass = pass;
        }
        if let Some(root) = lookup("SPECTRUM_MODELS_ROOT").filter(|v| !v.is_empty()) {
            self.models_root = PathBuf::from(root);
        }
    }

    /// Every valid `(type, mode)` pair in configuration order, duplicates
    /// removed. Unknown tags are logged and skipped.
    pub fn lineages(&self) -> Vec<LineageKey> {
        let types: Vec<NumericType> = self
            .numerical_types
            .iter()
            .filter_map(|t| match t.parse() {
                Ok(t) => Some(t),
                Err(e) => {
                    log::warn!("Skipping numeric type: {}", e);
                    None
                }
            })
            .collect();
        let modes: Vec<ExperimentMode> = self
            .modes
            .iter()
            .filter_map(|m| match m.parse() {
                Ok(m) => Some(m),
                Err(e) => {
                    log::warn!("Skipping mode: {}", e);
                    None
                }
            })
            .collect();

        let mut keys = Vec::new();
        for t in &types {
            for m in &modes {
                let key = LineageKey::new(*t, *m);
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    pub fn planets(&self) -> Result<Vec<Planet>> {
        self.planets
            .iter()
            .map(|s| {
                parse_planet(s)
                    .map(|grid| Planet {
                        label: s.clone(),
                        grid,
                    })
                    .map_err(EvolveError::Config)
            })
            .collect()
    }

    pub fn blueprint(&self) -> Result<ModelBlueprint> {
        if self.network_config.layers.is_empty() {
            return Ok(ModelBlueprint::default());
        }
        let mut widths = Vec::with_capacity(self.network_config.layers.len());
        let mut activations = Vec::with_capacity(self.network_config.layers.len());
        for layer in &self.network_config.layers {
            widths.push(layer.width * layer.height);
            activations.push(
                layer
                    .activation
                    .parse::<Activation>()
                    .map_err(EvolveError::Config)?,
            );
        }
        Ok(ModelBlueprint { widths, activations })
    }

    /// Tick rate of the evaluation window
    pub fn pulse_rate_hz(&self) -> u32 {
        match self.movement.translation.actions_per_second {
            0 => self.evaluation.pulse_rate_hz,
            aps => aps,
        }
    }

    /// Length of the evaluation window. A non-zero
    /// `movement.max_lifespan_seconds` caps how long any unit lives.
    pub fn evaluation_window(&self) -> Duration {
        let window = self.evaluation.duration();
        match self.movement.max_lifespan_secs {
            0 => window,
            secs => window.min(Duration::from_secs(secs)),
        }
    }

    /// Per-axis bound on a unit's movement per tick
    pub fn output_clamp(&self) -> f64 {
        let c = &self.movement.translation.clamp;
        let set: Vec<f64> = [c.x, c.y, c.z].into_iter().filter(|v| *v > 0.0).collect();
        if set.is_empty() {
            self.evaluation.output_clamp
        } else {
            set.into_iter().fold(f64::INFINITY, f64::min)
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            address: format!("{}:{}", self.runtime.host, self.runtime.port),
            auth_pass: self.runtime.auth_pass.clone(),
            delimiter: self.runtime.delimiter.clone(),
            timeout: Duration::from_millis(self.runtime.connect_timeout_ms),
        }
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            hosts: vec![self.runtime.host.clone()],
            start_port: self.runtime.port,
            port_step: self.runtime.scan_port_step,
            pods: self.runtime.scan_pods,
            auth_pass: self.runtime.auth_pass.clone(),
            delimiter: self.runtime.delimiter.clone(),
            timeout: Duration::from_millis(self.runtime.connect_timeout_ms),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.spectrum_steps == 0 {
            return Err(EvolveError::Config("spectrum_steps must be at least 1".into()));
        }
        if self.evaluation_spawns_per_planet == 0 {
            return Err(EvolveError::Config(
                "evaluation_spawns_per_planet must be at least 1".into(),
            ));
        }
        if !self.spectrum_max_stddev.is_finite() || self.spectrum_max_stddev < 0.0 {
            return Err(EvolveError::Config(format!(
                "spectrum_max_stddev must be a non-negative number, got {}",
                self.spectrum_max_stddev
            )));
        }
        if self.pulse_rate_hz() == 0 {
            return Err(EvolveError::Config("pulse rate must be positive".into()));
        }
        if self.runtime.delimiter.is_empty() {
            return Err(EvolveError::Config("runtime.delimiter must not be empty".into()));
        }
        self.planets()?;
        self.blueprint()?;
        if self.lineages().is_empty() {
            return Err(EvolveError::Config(
                "no valid (numerical_type, mode) pair configured".into(),
            ));
        }
        Ok(())
    }
}
