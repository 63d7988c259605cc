//! Dispatch & evaluation controller
//!
//! Realises one evaluation round for one variant:
//! names, spawn, unfreeze, timed run, collect, teardown. Teardown always
//! runs once anything may have been spawned, and the summary is the last
//! thing written, so a killed round is simply redone on restart.

use futures::future::join_all;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::aggregate::{UnitResult, VariantSummary};
use super::registry::Lineage;
use super::status::Stage;
use crate::config::ExperimentConfig;
use crate::error::{EvolveError, Result};
use crate::model::{ModelProvider, PolicyNetwork};
use crate::runtime::{generate_unit_id, sphere_points, AgentRuntime, Position, SpawnRequest};
use crate::storage::{self, ModelsLayout};

/// A world location with its precomputed goal and spawn points
#[derive(Debug, Clone, PartialEq)]
pub struct PlanetTarget {
    pub label: String,
    pub center: Position,
    pub goal: Position,
    pub spawn_points: Vec<Position>,
}

/// Fixed geometry and timing of every evaluation round
#[derive(Debug, Clone)]
pub struct EvaluationPlan {
    pub targets: Vec<PlanetTarget>,
    pub spawns_per_planet: usize,
    pub clamp: f64,
    pub pulse_rate_hz: u32,
    pub duration: Duration,
    pub namespace: String,
}

impl EvaluationPlan {
    pub fn from_config(config: &ExperimentConfig) -> Result<Self> {
        let eval = &config.evaluation;
        let spawns = config.evaluation_spawns_per_planet;
        let targets = config
            .planets()?
            .into_iter()
            .map(|planet| {
                let center = planet.grid * eval.planet_spacing;
                PlanetTarget {
                    label: planet.label,
                    goal: center + eval.goal_offset(),
                    spawn_points: sphere_points(spawns, eval.spawn_radius, &center),
                    center,
                }
            })
            .collect();
        Ok(Self {
            targets,
            spawns_per_planet: spawns,
            clamp: config.output_clamp(),
            pulse_rate_hz: config.pulse_rate_hz(),
            duration: config.evaluation_window(),
            namespace: config.unit_namespace.clone(),
        })
    }

    pub fn units_per_variant(&self) -> usize {
        self.targets.len() * self.spawns_per_planet
    }
}

/// Result of asking the controller to evaluate a variant
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A summary was already on disk; nothing was spawned
    AlreadyDone,
    Evaluated {
        summary: VariantSummary,
        spawn_failures: usize,
    },
}

#[derive(Debug, Clone)]
struct SpawnedUnit {
    order: usize,
    name: String,
    planet: String,
    start: Position,
    goal: Position,
}

pub struct DispatchController<'a, R: AgentRuntime, P: ModelProvider> {
    layout: &'a ModelsLayout,
    runtime: &'a R,
    provider: &'a P,
    plan: &'a EvaluationPlan,
}

impl<'a, R: AgentRuntime, P: ModelProvider> DispatchController<'a, R, P> {
    pub fn new(
        layout: &'a ModelsLayout,
        runtime: &'a R,
        provider: &'a P,
        plan: &'a EvaluationPlan,
    ) -> Self {
        Self {
            layout,
            runtime,
            provider,
            plan,
        }
    }

    /// Reuse the variant's names file, or derive and persist a fresh one
    pub fn allocate_names(
        &self,
        lineage: &Lineage,
        generation: u32,
        variant: usize,
    ) -> Result<Vec<String>> {
        let key = &lineage.key;
        let names_path = self.layout.agent_names(generation, key, variant);
        if names_path.exists() {
            let names: Vec<String> = storage::read_json(&names_path)?;
            debug!("Reusing {} unit names from {}", names.len(), names_path.display());
            return Ok(names);
        }

        let artifact = self.layout.variant(generation, key, variant);
        let names: Vec<String> = (0..self.plan.units_per_variant())
            .map(|seq| generate_unit_id(&artifact, &self.plan.namespace, generation, seq))
            .collect();
        storage::write_json_once(&names_path, &names)?;
        info!("Saved {} unit names to {}", names.len(), names_path.display());
        Ok(names)
    }

    /// Spawn one unit per (planet, spawn point) concurrently. Failed spawns
    /// are logged and left out. Returns the live units and the failure count.
    async fn spawn_batch(
        &self,
        lineage: &Lineage,
        generation: u32,
        variant: usize,
        names: &[String],
        model: Arc<PolicyNetwork>,
    ) -> (Vec<SpawnedUnit>, usize) {
        let expected = self.plan.units_per_variant();
        if names.len() < expected {
            warn!(
                "Only {} unit names for {} gen {} variant {}, expected {}",
                names.len(),
                lineage.key,
                generation,
                variant,
                expected
            );
        } else if names.len() > expected {
            warn!("{} unit names were unused", names.len() - expected);
        }

        let assignments = self
            .plan
            .targets
            .iter()
            .flat_map(|t| t.spawn_points.iter().map(move |p| (t, *p)))
            .zip(names.iter())
            .enumerate();

        let spawned = Mutex::new(Vec::with_capacity(expected));
        let attempts = assignments.map(|(order, ((target, position), name))| {
            let spawned = &spawned;
            let request = SpawnRequest {
                session: lineage.session.clone(),
                name: name.clone(),
                model: model.clone(),
                position,
                clamp: self.plan.clamp,
            };
            async move {
                match self.runtime.spawn(request).await {
                    Ok(()) => {
                        debug!(
                            "Spawned {} on {} at ({:.2}, {:.2}, {:.2})",
                            name, target.label, position.x, position.y, position.z
                        );
                        spawned.lock().await.push(SpawnedUnit {
                            order,
                            name: name.clone(),
                            planet: target.label.clone(),
                            start: position,
                            goal: target.goal,
                        });
                        true
                    }
                    Err(e) => {
                        warn!(
                            "Spawn failed for {} ({} gen {} variant {}): {}",
                            name, lineage.key, generation, variant, e
                        );
                        false
                    }
                }
            }
        });
        let failures = join_all(attempts).await.into_iter().filter(|ok| !ok).count();

        let mut units = spawned.into_inner();
        units.sort_by_key(|u| u.order);
        (units, failures)
    }

    /// Final positions and progress for every spawned unit. A unit whose
    /// position cannot be refreshed keeps its last known position.
    async fn collect(&self, units: &[SpawnedUnit]) -> Vec<UnitResult> {
        let mut results = Vec::with_capacity(units.len());
        for unit in units {
            let end = match self.runtime.refresh_position(&unit.name).await {
                Ok(p) => p,
                Err(e) => {
                    warn!("Could not refresh {}, keeping last known position: {}", unit.name, e);
                    unit.start
                }
            };
            let initial_distance = (unit.start - unit.goal).norm();
            let final_distance = (end - unit.goal).norm();
            results.push(UnitResult {
                name: unit.name.clone(),
                planet: unit.planet.clone(),
                goal: unit.goal.into(),
                initial_position: unit.start.into(),
                final_position: end.into(),
                initial_distance,
                final_distance,
                progress: initial_distance - final_distance,
                delta_y: end.y - unit.start.y,
            });
        }
        results
    }

    /// Evaluate one variant. Skips entirely if its summary already exists.
    pub async fn evaluate<F: FnMut(Stage, String)>(
        &self,
        lineage: &Lineage,
        generation: u32,
        variant: usize,
        mut notify: F,
    ) -> Result<DispatchOutcome> {
        let key = &lineage.key;
        let summary_path = self.layout.summary(generation, key, variant);
        if summary_path.exists() {
            debug!("Summary exists for {} gen {} variant {}", key, generation, variant);
            return Ok(DispatchOutcome::AlreadyDone);
        }

        let names = self.allocate_names(lineage, generation, variant)?;
        let model = Arc::new(self.provider.load(&self.layout.variant(generation, key, variant))?);

        notify(Stage::SpawningAgents, format!("Spawning {} units", names.len()));
        let (units, failures) = self.spawn_batch(lineage, generation, variant, &names, model).await;

        let outcome = self
            .run_round(lineage, generation, variant, &units, failures, &summary_path, &mut notify)
            .await;

        match self.runtime.destroy_all(&lineage.session).await {
            Ok(count) => info!("Destroyed {} units of session {}", count, lineage.session),
            Err(e) => warn!(
                "Teardown of session {} after gen {} variant {} failed: {}",
                lineage.session, generation, variant, e
            ),
        }
        notify(Stage::Cleaned, "Units destroyed".to_string());
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_round<F: FnMut(Stage, String)>(
        &self,
        lineage: &Lineage,
        generation: u32,
        variant: usize,
        units: &[SpawnedUnit],
        failures: usize,
        summary_path: &Path,
        notify: &mut F,
    ) -> Result<DispatchOutcome> {
        let partial = EvolveError::PartialSpawnFailure {
            lineage: lineage.label(),
            generation,
            variant,
            attempted: units.len() + failures,
            failed: failures,
        };
        if units.is_empty() {
            return Err(partial);
        }
        if failures > 0 {
            warn!("{}", partial);
        }

        self.runtime.unfreeze_all(&lineage.session).await?;
        notify(Stage::Running, format!("{} units running", units.len()));

        let ticks = self
            .runtime
            .pulse(&lineage.session, self.plan.pulse_rate_hz, self.plan.duration)
            .await?;
        debug!("Pulsed session {} for {} ticks", lineage.session, ticks);

        let summary = VariantSummary::from_results(self.collect(units).await);
        if storage::write_json_once(summary_path, &summary)? {
            info!(
                "Saved summary for {} gen {} variant {} (mean {:.4}) -> {}",
                lineage.key,
                generation,
                variant,
                summary.mean_progress,
                summary_path.display()
            );
        }
        notify(
            Stage::Finished,
            format!("Mean progress {:.4}", summary.mean_progress),
        );
        Ok(DispatchOutcome::Evaluated {
            summary,
            spawn_failures: failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::variants::VariantGenerator;
    use crate::model::{
        build_initial_models, Activation, ExperimentMode, JsonModelProvider, LineageKey,
        ModelBlueprint, NumericType,
    };
    use crate::runtime::SimulatedRuntime;

    struct Fixture {
        layout: ModelsLayout,
        lineage: Lineage,
        plan: EvaluationPlan,
    }

    fn fixture() -> Fixture {
        let layout = ModelsLayout::new(
            std::env::temp_dir().join(format!("spectrum-dispatch-test-{}", uuid::Uuid::new_v4())),
        );
        let lineage = Lineage::new(LineageKey::new(NumericType::Float64, ExperimentMode::Standard));
        let blueprint = ModelBlueprint {
            widths: vec![6, 8, 3],
            activations: vec![Activation::Linear, Activation::Relu, Activation::Tanh],
        };
        build_initial_models(&layout, &JsonModelProvider, &[lineage.key], &blueprint).unwrap();
        VariantGenerator::new(&layout, &JsonModelProvider)
            .generate(&lineage.key, 0, 2, 0.1)
            .unwrap();

        let config = ExperimentConfig {
            planets: vec!["(0,0,0)".into(), "(1,0,1)".into()],
            evaluation_spawns_per_planet: 3,
            evaluation: crate::config::EvaluationSettings {
                duration_ms: 500,
                ..Default::default()
            },
            ..Default::default()
        };
        let plan = EvaluationPlan::from_config(&config).unwrap();
        Fixture { layout, lineage, plan }
    }

    #[test]
    fn test_plan_geometry() {
        let f = fixture();
        assert_eq!(f.plan.units_per_variant(), 6);
        let second = &f.plan.targets[1];
        assert_eq!(second.center, Position::new(800.0, 0.0, 800.0));
        assert_eq!(second.goal, Position::new(800.0, 100.0, 800.0));
        assert_eq!(second.spawn_points.len(), 3);
        assert_eq!(f.plan.duration, Duration::from_millis(500));

        let _ = std::fs::remove_dir_all(f.layout.root());
    }

    #[tokio::test]
    async fn test_two_planets_three_replicas() {
        let f = fixture();
        let sim = SimulatedRuntime::new();
        let controller = DispatchController::new(&f.layout, &sim, &JsonModelProvider, &f.plan);

        let mut stages = Vec::new();
        let outcome = controller
            .evaluate(&f.lineage, 0, 1, |stage, _| stages.push(stage))
            .await
            .unwrap();

        let names: Vec<String> =
            storage::read_json(&f.layout.agent_names(0, &f.lineage.key, 1)).unwrap();
        assert_eq!(names.len(), 6);
        let summary: VariantSummary =
            storage::read_json(&f.layout.summary(0, &f.lineage.key, 1)).unwrap();
        assert_eq!(summary.results.len(), 6);
        assert_eq!(
            outcome,
            DispatchOutcome::Evaluated {
                summary: summary.clone(),
                spawn_failures: 0
            }
        );
        assert_eq!(
            stages,
            vec![Stage::SpawningAgents, Stage::Running, Stage::Finished, Stage::Cleaned]
        );
        // teardown leaves nothing behind
        assert_eq!(sim.live_units().await, 0);
        assert_eq!(sim.destroy_calls(), 1);

        let _ = std::fs::remove_dir_all(f.layout.root());
    }

    #[tokio::test]
    async fn test_existing_summary_means_no_spawns() {
        let f = fixture();
        let sim = SimulatedRuntime::new();
        let controller = DispatchController::new(&f.layout, &sim, &JsonModelProvider, &f.plan);
        controller.evaluate(&f.lineage, 0, 0, |_, _| {}).await.unwrap();
        let spawned = sim.spawn_calls();
        let bytes = std::fs::read(f.layout.summary(0, &f.lineage.key, 0)).unwrap();

        let again = controller.evaluate(&f.lineage, 0, 0, |_, _| {}).await.unwrap();
        assert_eq!(again, DispatchOutcome::AlreadyDone);
        assert_eq!(sim.spawn_calls(), spawned);
        assert_eq!(std::fs::read(f.layout.summary(0, &f.lineage.key, 0)).unwrap(), bytes);

        let _ = std::fs::remove_dir_all(f.layout.root());
    }

    #[tokio::test]
    async fn test_names_are_reused() {
        let f = fixture();
        let sim = SimulatedRuntime::new();
        let controller = DispatchController::new(&f.layout, &sim, &JsonModelProvider, &f.plan);
        let first = controller.allocate_names(&f.lineage, 0, 1).unwrap();
        let second = controller.allocate_names(&f.lineage, 0, 1).unwrap();
        assert_eq!(first, second);
        let other = controller.allocate_names(&f.lineage, 0, 0).unwrap();
        assert!(first.iter().all(|n| !other.contains(n)));

        let _ = std::fs::remove_dir_all(f.layout.root());
    }

    #[tokio::test]
    async fn test_partial_spawn_failure_excludes_unit() {
        let f = fixture();
        let sim = SimulatedRuntime::new();
        let controller = DispatchController::new(&f.layout, &sim, &JsonModelProvider, &f.plan);
        let names = controller.allocate_names(&f.lineage, 0, 1).unwrap();
        sim.fail_spawn(names[2].clone()).await;

        match controller.evaluate(&f.lineage, 0, 1, |_, _| {}).await.unwrap() {
            DispatchOutcome::Evaluated { summary, spawn_failures } => {
                assert_eq!(spawn_failures, 1);
                assert_eq!(summary.results.len(), 5);
                assert!(summary.results.iter().all(|r| r.name != names[2]));
            }
            other => panic!("unexpected {:?}", other),
        }

        let _ = std::fs::remove_dir_all(f.layout.root());
    }

    #[tokio::test]
    async fn test_all_spawns_failing_writes_nothing() {
        let f = fixture();
        let sim = SimulatedRuntime::new();
        sim.fail_all_spawns(true);
        let controller = DispatchController::new(&f.layout, &sim, &JsonModelProvider, &f.plan);

        let err = controller.evaluate(&f.lineage, 0, 1, |_, _| {}).await.unwrap_err();
        assert!(matches!(err, EvolveError::PartialSpawnFailure { failed: 6, .. }));
        assert!(!f.layout.summary(0, &f.lineage.key, 1).exists());
        // teardown still ran
        assert_eq!(sim.destroy_calls(), 1);

        let _ = std::fs::remove_dir_all(f.layout.root());
    }

    #[tokio::test]
    async fn test_failed_refresh_scores_zero() {
        let f = fixture();
        let sim = SimulatedRuntime::new();
        let controller = DispatchController::new(&f.layout, &sim, &JsonModelProvider, &f.plan);
        let names = controller.allocate_names(&f.lineage, 0, 1).unwrap();
        sim.fail_refresh(names[0].clone()).await;

        match controller.evaluate(&f.lineage, 0, 1, |_, _| {}).await.unwrap() {
            DispatchOutcome::Evaluated { summary, .. } => {
                let stuck = summary.results.iter().find(|r| r.name == names[0]).unwrap();
                assert_eq!(stuck.progress, 0.0);
                assert_eq!(stuck.delta_y, 0.0);
            }
            other => panic!("unexpected {:?}", other),
        }

        let _ = std::fs::remove_dir_all(f.layout.root());
    }
}
