//! The generation/variant orchestration engine
//!
//! Lineage registry, variant generation, dispatch and evaluation,
//! aggregation, champion promotion and the generation loop that ties
//! them together.

pub mod aggregate;
pub mod champion;
pub mod dispatch;
pub mod engine;
pub mod registry;
pub mod status;
pub mod variants;

pub use aggregate::{
    rank, rank_lineage, read_ranked, write_leaderboard, Aggregated, LeaderboardEntry, RankedEntry,
    SummaryStats, UnitResult, VariantSummary,
};
pub use champion::{
    ChampionPromoter, ChampionProvenance, Incumbent, IncumbentSource, PromotionDecision,
};
pub use dispatch::{DispatchController, DispatchOutcome, EvaluationPlan, PlanetTarget};
pub use engine::{GenerationReport, LineageFailure, LineageReport, Orchestrator};
pub use registry::{Lineage, LineageRegistry};
pub use status::{Stage, StatusEvent, StatusLog};
pub use variants::{VariantGenerator, VariantReport};
