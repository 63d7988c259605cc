//! Generation-0 model setup
//!
//! Builds the canonical starting network for every lineage that does not
//! have one yet. The random initialisation is seeded from the lineage label
//! so a rebuilt tree produces the same generation-0 artifacts.

use sha2::{Digest, Sha256};
use std::path::PathBuf;

use super::network::{Activation, PolicyNetwork};
use super::numeric::LineageKey;
use super::provider::ModelProvider;
use crate::error::Result;
use crate::storage::ModelsLayout;

/// Layer widths and activations of a freshly built network
#[derive(Debug, Clone, PartialEq)]
pub struct ModelBlueprint {
    /// Widths including the input layer
    pub widths: Vec<usize>,
    /// One per width; the input entry is ignored
    pub activations: Vec<Activation>,
}

impl Default for ModelBlueprint {
    fn default() -> Self {
        Self {
            widths: vec![6, 128, 128, 3],
            activations: vec![
                Activation::Linear,
                Activation::Relu,
                Activation::Relu,
                Activation::Tanh,
            ],
        }
    }
}

impl ModelBlueprint {
    pub fn build(&self, key: &LineageKey) -> PolicyNetwork {
        PolicyNetwork::random(
            key.numeric_type,
            key.mode,
            &self.widths,
            &self.activations,
            lineage_seed(key),
        )
    }
}

/// Deterministic seed derived from the lineage label
pub fn lineage_seed(key: &LineageKey) -> u64 {
    let digest = Sha256::digest(key.label().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Write `models/0/{type}_{mode}.json` for every lineage missing one.
/// Existing files are left untouched. Returns the paths that were created.
pub fn build_initial_models<P: ModelProvider>(
    layout: &ModelsLayout,
    provider: &P,
    keys: &[LineageKey],
    blueprint: &ModelBlueprint,
) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    for key in keys {
        let path = layout.base_artifact(0, key);
        if path.exists() {
            log::debug!("Generation-0 model for {} already exists at {}", key, path.display());
            continue;
        }
        let net = blueprint.build(key);
        provider.save(&net, &path)?;
        log::info!(
            "Built generation-0 model for {} ({} parameters) at {}",
            key,
            net.parameter_count(),
            path.display()
        );
        created.push(path);
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExperimentMode, JsonModelProvider, NumericType};

    fn small() -> ModelBlueprint {
        ModelBlueprint {
            widths: vec![6, 4, 4, 3],
            activations: vec![
                Activation::Linear,
                Activation::Relu,
                Activation::Relu,
                Activation::Tanh,
            ],
        }
    }

    #[test]
    fn test_seed_differs_per_lineage() {
        let a = LineageKey::new(NumericType::Float32, ExperimentMode::Standard);
        let b = LineageKey::new(NumericType::Float32, ExperimentMode::Replay);
        assert_eq!(lineage_seed(&a), lineage_seed(&a));
        assert_ne!(lineage_seed(&a), lineage_seed(&b));
    }

    #[test]
    fn test_build_initial_models_skips_existing() {
        let dir = std::env::temp_dir()
            .join(format!("spectrum-builder-test-{}", uuid::Uuid::new_v4()));
        let layout = ModelsLayout::new(&dir);
        let keys = [
            LineageKey::new(NumericType::Int8, ExperimentMode::Standard),
            LineageKey::new(NumericType::Float64, ExperimentMode::DynamicReplay),
        ];

        let created = build_initial_models(&layout, &JsonModelProvider, &keys, &small()).unwrap();
        assert_eq!(created.len(), 2);
        let first = std::fs::read(layout.base_artifact(0, &keys[0])).unwrap();

        let again = build_initial_models(&layout, &JsonModelProvider, &keys, &small()).unwrap();
        assert!(again.is_empty());
        assert_eq!(std::fs::read(layout.base_artifact(0, &keys[0])).unwrap(), first);

        let loaded = JsonModelProvider.load(&layout.base_artifact(0, &keys[1])).unwrap();
        assert_eq!(loaded.numeric_type, NumericType::Float64);
        assert_eq!(loaded.mode, ExperimentMode::DynamicReplay);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_default_blueprint_shape() {
        let key = LineageKey::new(NumericType::Float32, ExperimentMode::Replay);
        let net = ModelBlueprint::default().build(&key);
        assert_eq!(net.input_size(), 6);
        assert_eq!(net.output_size(), 3);
        assert!(net.layers[1].replay.enabled);
    }
}
