//! Spectrum: evolutionary orchestration for control policies
//!
//! Repeatedly mutates a population of policy artifacts per lineage
//! (numeric representation x structural mode), dispatches each mutant to a
//! remote world for a timed evaluation window, ranks the population and
//! promotes the best artifact to a durable champion slot. All state lives
//! in the on-disk artifact tree, so a run can be killed and resumed.

pub mod config;
pub mod error;
pub mod evolution;
pub mod model;
pub mod runtime;
pub mod storage;

pub use config::ExperimentConfig;
pub use error::{EvolveError, Result};
pub use evolution::{Orchestrator, StatusLog};
pub use model::{JsonModelProvider, LineageKey, ModelProvider, PolicyNetwork};
pub use runtime::{AgentRuntime, SimulatedRuntime, TcpRuntime};
pub use storage::ModelsLayout;
