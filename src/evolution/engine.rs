//! Generation loop
//!
//! Drives every lineage through one generation at a time:
//! Generating, Generated, per variant dispatch, Aggregate, ChampionCheck.
//! After all lineages, the cross-lineage leaderboard is written. Every
//! stage consults the artifact tree (and the stage ledger) before doing
//! work, so a killed run picks up where it stopped.

use log::{debug, error, info, warn};
use std::path::Path;

use super::aggregate::{rank_lineage, write_leaderboard, Aggregated};
use super::champion::{ChampionPromoter, PromotionDecision};
use super::dispatch::{DispatchController, DispatchOutcome, EvaluationPlan};
use super::registry::{Lineage, LineageRegistry};
use super::status::{Stage, StatusLog};
use super::variants::{VariantGenerator, VariantReport};
use crate::config::ExperimentConfig;
use crate::error::{EvolveError, Result};
use crate::model::{build_initial_models, ModelProvider};
use crate::runtime::AgentRuntime;
use crate::storage::ledger::Stage as LedgerStage;
use crate::storage::{LineageLease, ModelsLayout, StageLedger};

/// Label used in status events for cross-lineage steps
pub const ALL_LINEAGES: &str = "all";

/// What happened to one lineage in one generation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineageReport {
    pub lineage: String,
    pub generation: u32,
    /// Another process holds this lineage's lease
    pub lease_skipped: bool,
    pub variants: Option<VariantReport>,
    pub evaluated: Vec<usize>,
    /// Variants whose summary already existed
    pub skipped: Vec<usize>,
    pub failed: Vec<(usize, String)>,
    pub ranked: bool,
    pub promotion: Option<PromotionDecision>,
}

/// A lineage that stopped with an error
#[derive(Debug, Clone, PartialEq)]
pub struct LineageFailure {
    pub lineage: String,
    pub reason: String,
    /// Rerunning is expected to get past it without manual repair
    pub transient: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationReport {
    pub generation: u32,
    pub lineages: Vec<LineageReport>,
    pub errors: Vec<LineageFailure>,
    pub leaderboard_written: bool,
}

/// True when `artifact` exists. The artifact wins over the ledger in both
/// directions: a missing ledger entry is backfilled, and an entry whose
/// artifact has disappeared is ignored so the stage runs again.
fn stage_done(
    ledger: &mut StageLedger,
    stage: LedgerStage,
    key: &str,
    artifact: &Path,
) -> Result<bool> {
    if !artifact.exists() {
        if ledger.is_complete(stage, key) {
            warn!(
                "Ledger marks {} {} complete but {} is missing, redoing it",
                stage.as_str(),
                key,
                artifact.display()
            );
        }
        return Ok(false);
    }
    ledger.check_or_backfill(stage, key, artifact)
}

pub struct Orchestrator<R: AgentRuntime, P: ModelProvider> {
    config: ExperimentConfig,
    layout: ModelsLayout,
    provider: P,
    runtime: R,
    registry: LineageRegistry,
    plan: EvaluationPlan,
    status: StatusLog,
    ledger: StageLedger,
}

impl<R: AgentRuntime, P: ModelProvider> Orchestrator<R, P> {
    pub fn new(config: ExperimentConfig, runtime: R, provider: P) -> Result<Self> {
        config.validate()?;
        let layout = ModelsLayout::new(&config.models_root);
        let ledger = StageLedger::open(layout.ledger())?;
        let registry = LineageRegistry::from_config(&config);
        let plan = EvaluationPlan::from_config(&config)?;
        info!(
            "Orchestrator for '{}': {} lineages, {} variants each, {} units per variant, {}",
            config.name,
            registry.len(),
            config.spectrum_steps,
            plan.units_per_variant(),
            runtime.address()
        );
        Ok(Self {
            status: StatusLog::new(config.status_capacity),
            config,
            layout,
            provider,
            runtime,
            registry,
            plan,
            ledger,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn layout(&self) -> &ModelsLayout {
        &self.layout
    }

    pub fn registry(&self) -> &LineageRegistry {
        &self.registry
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn ledger(&self) -> &StageLedger {
        &self.ledger
    }

    pub fn status(&self) -> &StatusLog {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut StatusLog {
        &mut self.status
    }

    /// Create any missing generation-0 models
    pub fn init_models(&self) -> Result<usize> {
        let blueprint = self.config.blueprint()?;
        let created = build_initial_models(
            &self.layout,
            &self.provider,
            &self.registry.keys(),
            &blueprint,
        )?;
        Ok(created.len())
    }

    /// Run every configured generation, starting from 0. Completed work is
    /// skipped, so this also resumes an interrupted run.
    pub async fn run(&mut self) -> Result<Vec<GenerationReport>> {
        let created = self.init_models()?;
        if created > 0 {
            info!("Built {} generation-0 models", created);
        }
        let mut reports = Vec::with_capacity(self.config.episodes as usize);
        for generation in 0..self.config.episodes {
            info!("=== Generation {} of {} ===", generation + 1, self.config.episodes);
            reports.push(self.run_generation(generation).await?);
        }
        Ok(reports)
    }

    /// One generation across all lineages, then the leaderboard
    pub async fn run_generation(&mut self, generation: u32) -> Result<GenerationReport> {
        let mut report = GenerationReport {
            generation,
            ..Default::default()
        };
        let lineages: Vec<Lineage> = self.registry.iter().cloned().collect();
        for lineage in &lineages {
            match self.run_lineage(generation, lineage).await {
                Ok(r) => report.lineages.push(r),
                Err(e) => {
                    let transient = e.is_transient();
                    if transient {
                        warn!(
                            "{} gen {} interrupted, rerun to resume: {}",
                            lineage.key, generation, e
                        );
                    } else {
                        error!("{} gen {} needs repair: {}", lineage.key, generation, e);
                    }
                    report.errors.push(LineageFailure {
                        lineage: lineage.label(),
                        reason: e.to_string(),
                        transient,
                    });
                }
            }
        }

        self.status.record(
            generation,
            ALL_LINEAGES,
            None,
            Stage::Leaderboard,
            "Writing leaderboard",
        );
        let key = generation.to_string();
        let path = self.layout.leaderboard(generation);
        if stage_done(&mut self.ledger, LedgerStage::Leaderboard, &key, &path)? {
            debug!("Leaderboard for gen {} already written", generation);
        } else {
            let unranked: Vec<String> = lineages
                .iter()
                .filter(|l| !self.layout.ranked(generation, &l.key).exists())
                .map(|l| l.label())
                .collect();
            if !unranked.is_empty() {
                warn!(
                    "Deferring gen {} leaderboard, not yet ranked: {}",
                    generation,
                    unranked.join(", ")
                );
            } else if let Some(Aggregated::Written(board)) =
                write_leaderboard(&self.layout, generation)?
            {
                let detail = board
                    .first()
                    .map(|top| {
                        format!(
                            "{}_{} variant {} ({:.4})",
                            top.num_type, top.mode, top.variant, top.mean_progress
                        )
                    })
                    .unwrap_or_default();
                self.ledger.mark_complete(LedgerStage::Leaderboard, &key, detail)?;
                report.leaderboard_written = true;
            }
        }
        Ok(report)
    }

    /// Drive one lineage through one generation
    pub async fn run_lineage(
        &mut self,
        generation: u32,
        lineage: &Lineage,
    ) -> Result<LineageReport> {
        let label = lineage.label();
        let mut report = LineageReport {
            lineage: label.clone(),
            generation,
            ..Default::default()
        };

        let ttl = chrono::Duration::seconds(self.config.lease_ttl_secs.min(i32::MAX as u64) as i64);
        let _lease = match LineageLease::acquire(&self.layout.lease(&lineage.key), &label, ttl) {
            Ok(lease) => lease,
            Err(e @ EvolveError::LeaseHeld { .. }) => {
                warn!("Skipping {} gen {}: {}", label, generation, e);
                self.status.record(generation, &label, None, Stage::Skipped, e.to_string());
                report.lease_skipped = true;
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        // variants
        self.status.record(generation, &label, None, Stage::Generating, "Generating variants");
        let steps = self.config.spectrum_steps;
        let generated = VariantGenerator::new(&self.layout, &self.provider).generate(
            &lineage.key,
            generation,
            steps,
            self.config.spectrum_max_stddev,
        );
        let variants = match generated {
            Ok(v) => v,
            Err(e) => {
                self.status.record(generation, &label, None, Stage::Failed, e.to_string());
                return Err(e);
            }
        };
        let lineage_key = format!("{}/{}", generation, label);
        if !self.ledger.is_complete(LedgerStage::Variants, &lineage_key) {
            self.ledger.mark_complete(
                LedgerStage::Variants,
                &lineage_key,
                variants.base.display().to_string(),
            )?;
        }
        self.status.record(
            generation,
            &label,
            None,
            Stage::Generated,
            format!(
                "{} created, {} already present",
                variants.created.len(),
                variants.skipped.len()
            ),
        );
        report.variants = Some(variants);

        // dispatch
        let controller =
            DispatchController::new(&self.layout, &self.runtime, &self.provider, &self.plan);
        for variant in 0..steps {
            let summary_key = format!("{}/{}", lineage_key, variant);
            let summary_path = self.layout.summary(generation, &lineage.key, variant);
            if stage_done(&mut self.ledger, LedgerStage::Summary, &summary_key, &summary_path)? {
                self.status.record(
                    generation,
                    &label,
                    Some(variant),
                    Stage::Skipped,
                    "Summary already exists",
                );
                report.skipped.push(variant);
                continue;
            }

            let status = &mut self.status;
            let outcome = controller
                .evaluate(lineage, generation, variant, |stage, message| {
                    status.record(generation, label.as_str(), Some(variant), stage, message)
                })
                .await;
            match outcome {
                Ok(DispatchOutcome::Evaluated { summary, .. }) => {
                    self.ledger.mark_complete(
                        LedgerStage::Summary,
                        &summary_key,
                        format!("{:.6}", summary.mean_progress),
                    )?;
                    report.evaluated.push(variant);
                }
                Ok(DispatchOutcome::AlreadyDone) => {
                    self.ledger.check_or_backfill(
                        LedgerStage::Summary,
                        &summary_key,
                        &summary_path,
                    )?;
                    report.skipped.push(variant);
                }
                Err(e) => {
                    warn!(
                        "{} gen {} variant {} not evaluated: {}",
                        label, generation, variant, e
                    );
                    self.status
                        .record(generation, &label, Some(variant), Stage::Failed, e.to_string());
                    report.failed.push((variant, e.to_string()));
                }
            }
        }

        // aggregate
        self.status.record(generation, &label, None, Stage::Aggregate, "Ranking variants");
        match rank_lineage(&self.layout, &lineage.key, generation, steps) {
            Ok(Aggregated::Written(entries)) => {
                let detail = entries
                    .first()
                    .map(|top| format!("variant {} ({:.4})", top.variant, top.mean_progress))
                    .unwrap_or_default();
                self.ledger.mark_complete(LedgerStage::Ranked, &lineage_key, detail)?;
            }
            Ok(Aggregated::AlreadyExists) => {
                self.ledger.check_or_backfill(
                    LedgerStage::Ranked,
                    &lineage_key,
                    &self.layout.ranked(generation, &lineage.key),
                )?;
            }
            Err(e @ EvolveError::IncompleteGeneration { .. }) => {
                warn!("{}, skipping champion check until a rerun completes it", e);
                return Ok(report);
            }
            Err(e) => {
                self.status.record(generation, &label, None, Stage::Failed, e.to_string());
                return Err(e);
            }
        }
        report.ranked = true;

        // champion
        self.status
            .record(generation, &label, None, Stage::ChampionCheck, "Comparing with champion");
        if self.ledger.is_complete(LedgerStage::Champion, &lineage_key) {
            debug!("Champion check for {} gen {} already done", label, generation);
            return Ok(report);
        }
        let decision =
            ChampionPromoter::new(&self.layout).promote_if_better(&lineage.key, generation)?;
        let detail = match &decision {
            PromotionDecision::Promoted { variant, score, .. } => {
                format!("promoted variant {} ({:.4})", variant, score)
            }
            PromotionDecision::Kept { incumbent, .. } => format!("kept ({:.4})", incumbent.score),
        };
        self.ledger.mark_complete(LedgerStage::Champion, &lineage_key, detail)?;
        report.promotion = Some(decision);
        Ok(report)
    }
}
