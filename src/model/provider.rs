//! ModelProvider: load, save, clone and perturb artifacts
//!
//! The orchestrator only ever goes through this trait. It never reads a
//! weight directly; artifacts are moved around as files and handed to the
//! runtime whole.

use std::path::Path;

use super::network::PolicyNetwork;
use crate::error::{EvolveError, Result};
use crate::storage;

pub trait ModelProvider {
    fn load(&self, path: &Path) -> Result<PolicyNetwork>;

    /// Persist atomically; a crash never leaves a partial artifact at `path`
    fn save(&self, artifact: &PolicyNetwork, path: &Path) -> Result<()>;

    fn clone_artifact(&self, artifact: &PolicyNetwork) -> PolicyNetwork {
        artifact.clone()
    }

    /// Perturb in place. Must be deterministic for a given `(stddev, seed)`.
    fn perturb(&self, artifact: &mut PolicyNetwork, stddev: f64, seed: u64);
}

/// Provider storing networks as pretty-printed JSON
#[derive(Debug, Clone, Default)]
pub struct JsonModelProvider;

impl ModelProvider for JsonModelProvider {
    fn load(&self, path: &Path) -> Result<PolicyNetwork> {
        let net: PolicyNetwork = storage::read_json(path)?;
        if net.layers.is_empty() {
            return Err(EvolveError::Malformed {
                path: path.to_path_buf(),
                reason: "network has no layers".to_string(),
            });
        }
        for (i, layer) in net.layers.iter().enumerate() {
            if layer.bias.len() != layer.weights.nrows() {
                return Err(EvolveError::Malformed {
                    path: path.to_path_buf(),
                    reason: format!(
                        "layer {} has {} outputs but {} biases",
                        i,
                        layer.weights.nrows(),
                        layer.bias.len()
                    ),
                });
            }
        }
        for (i, pair) in net.layers.windows(2).enumerate() {
            if pair[0].outputs() != pair[1].inputs() {
                return Err(EvolveError::Malformed {
                    path: path.to_path_buf(),
                    reason: format!(
                        "layer {} outputs {} but layer {} expects {}",
                        i,
                        pair[0].outputs(),
                        i + 1,
                        pair[1].inputs()
                    ),
                });
            }
        }
        Ok(net)
    }

    fn save(&self, artifact: &PolicyNetwork, path: &Path) -> Result<()> {
        storage::write_json_atomic(path, artifact)
    }

    fn perturb(&self, artifact: &mut PolicyNetwork, stddev: f64, seed: u64) {
        artifact.perturb(stddev, seed);
    }
}
