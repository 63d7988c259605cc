//! Model artifacts and the provider the orchestrator loads them through

pub mod builder;
pub mod network;
pub mod numeric;
pub mod provider;

pub use builder::{build_initial_models, ModelBlueprint};
pub use network::{Activation, DenseLayer, PolicyNetwork, ReplaySettings};
pub use numeric::{ExperimentMode, LineageKey, NumericType};
pub use provider::{JsonModelProvider, ModelProvider};
