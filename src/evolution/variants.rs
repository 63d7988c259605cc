//! Variant generator
//!
//! Produces the fixed-size population of a lineage's generation. Variant 0
//! is an unperturbed control: a byte copy of the reigning champion, or of
//! the base artifact when there is no champion yet. Variants `1..S` are
//! clones of the base perturbed with their own index as the seed. Existing
//! variant files are never touched.

use log::{info, warn};
use std::path::{Path, PathBuf};

use super::aggregate::RankedEntry;
use crate::error::{EvolveError, Result};
use crate::model::{LineageKey, ModelProvider, PolicyNetwork};
use crate::storage::{self, ModelsLayout};

/// What one generation pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariantReport {
    pub base: PathBuf,
    pub created: Vec<usize>,
    pub skipped: Vec<usize>,
    /// Variant 0 was written from the champion slot
    pub seeded_from_champion: bool,
}

pub struct VariantGenerator<'a, P: ModelProvider> {
    layout: &'a ModelsLayout,
    provider: &'a P,
}

impl<'a, P: ModelProvider> VariantGenerator<'a, P> {
    pub fn new(layout: &'a ModelsLayout, provider: &'a P) -> Self {
        Self { layout, provider }
    }

    fn missing_base(
        &self,
        key: &LineageKey,
        generation: u32,
        path: &Path,
        reason: impl Into<String>,
    ) -> EvolveError {
        EvolveError::MissingBaseArtifact {
            lineage: key.label(),
            generation,
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Path of the artifact generation `generation` is seeded from.
    ///
    /// Generation 0 uses the canonical `models/0/{type}_{mode}.json`; later
    /// generations use rank 0 of the previous generation's ranked list.
    pub fn resolve_base(&self, key: &LineageKey, generation: u32) -> Result<PathBuf> {
        if generation == 0 {
            let path = self.layout.base_artifact(0, key);
            if !path.exists() {
                return Err(self.missing_base(
                    key,
                    generation,
                    &path,
                    "generation-0 model not found",
                ));
            }
            return Ok(path);
        }

        let ranked_path = self.layout.ranked(generation - 1, key);
        if !ranked_path.exists() {
            return Err(self.missing_base(
                key,
                generation,
                &ranked_path,
                "previous generation has no ranked results",
            ));
        }
        let ranked: Vec<RankedEntry> = storage::read_json(&ranked_path)
            .map_err(|e| self.missing_base(key, generation, &ranked_path, e.to_string()))?;
        let top = ranked.first().ok_or_else(|| {
            self.missing_base(key, generation, &ranked_path, "ranked list is empty")
        })?;

        let path = self.layout.variant(generation - 1, key, top.variant);
        if !path.exists() {
            return Err(self.missing_base(
                key,
                generation,
                &path,
                format!("top variant {} of gen {} not found", top.variant, generation - 1),
            ));
        }
        Ok(path)
    }

    fn load_base(&self, key: &LineageKey, generation: u32, path: &Path) -> Result<PolicyNetwork> {
        let net = self
            .provider
            .load(path)
            .map_err(|e| self.missing_base(key, generation, path, e.to_string()))?;
        if net.numeric_type != key.numeric_type || net.mode != key.mode {
            return Err(self.missing_base(
                key,
                generation,
                path,
                format!("artifact is {}_{}, expected {}", net.numeric_type, net.mode, key),
            ));
        }
        Ok(net)
    }

    /// Ensure `population` variants exist for `(key, generation)`
    pub fn generate(
        &self,
        key: &LineageKey,
        generation: u32,
        population: usize,
        stddev: f64,
    ) -> Result<VariantReport> {
        let base_path = self.resolve_base(key, generation)?;
        let mut report = VariantReport {
            base: base_path.clone(),
            ..Default::default()
        };

        let pending: Vec<usize> = (0..population)
            .filter(|i| {
                let exists = self.layout.variant(generation, key, *i).exists();
                if exists {
                    report.skipped.push(*i);
                }
                !exists
            })
            .collect();

        let base = if pending.is_empty() {
            None
        } else {
            Some(self.load_base(key, generation, &base_path)?)
        };

        // record which artifact this generation descended from
        let base_copy = self.layout.base_artifact(generation, key);
        if generation > 0 && !base_copy.exists() {
            storage::copy_atomic(&base_path, &base_copy)?;
        }

        let Some(base) = base else {
            info!("All {} variants for {} gen {} already exist", population, key, generation);
            return Ok(report);
        };

        for index in pending {
            let path = self.layout.variant(generation, key, index);
            if index == 0 {
                let champion = self.layout.champion(key);
                if champion.exists() {
                    storage::copy_atomic(&champion, &path)?;
                    report.seeded_from_champion = true;
                    info!("Seeded {} gen {} variant 0 from champion", key, generation);
                } else {
                    storage::copy_atomic(&base_path, &path)?;
                }
            } else {
                let mut clone = self.provider.clone_artifact(&base);
                self.provider.perturb(&mut clone, stddev, index as u64);
                if let Err(e) = self.provider.save(&clone, &path) {
                    warn!(
                        "Failed to save {} gen {} variant {} at {}: {}",
                        key,
                        generation,
                        index,
                        path.display(),
                        e
                    );
                    return Err(e);
                }
            }
            report.created.push(index);
        }

        info!(
            "Generated {} variants for {} gen {} from {} ({} already present)",
            report.created.len(),
            key,
            generation,
            base_path.display(),
            report.skipped.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        build_initial_models, Activation, ExperimentMode, JsonModelProvider, ModelBlueprint,
        NumericType,
    };

    fn setup() -> (ModelsLayout, LineageKey) {
        let layout = ModelsLayout::new(
            std::env::temp_dir().join(format!("spectrum-variants-test-{}", uuid::Uuid::new_v4())),
        );
        let key = LineageKey::new(NumericType::Float32, ExperimentMode::Standard);
        let blueprint = ModelBlueprint {
            widths: vec![6, 5, 3],
            activations: vec![Activation::Linear, Activation::Relu, Activation::Tanh],
        };
        build_initial_models(&layout, &JsonModelProvider, &[key], &blueprint).unwrap();
        (layout, key)
    }

    fn read_all(layout: &ModelsLayout, key: &LineageKey, gen: u32, n: usize) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| std::fs::read(layout.variant(gen, key, i)).unwrap())
            .collect()
    }

    #[test]
    fn test_population_of_four() {
        let (layout, key) = setup();
        let generator = VariantGenerator::new(&layout, &JsonModelProvider);
        let report = generator.generate(&key, 0, 4, 0.1).unwrap();
        assert_eq!(report.created, vec![0, 1, 2, 3]);
        assert!(!report.seeded_from_champion);

        let base = std::fs::read(layout.base_artifact(0, &key)).unwrap();
        let variants = read_all(&layout, &key, 0, 4);
        assert_eq!(variants[0], base);
        for i in 1..4 {
            assert_ne!(variants[i], base);
            for j in i + 1..4 {
                assert_ne!(variants[i], variants[j]);
            }
        }

        let _ = std::fs::remove_dir_all(layout.root());
    }

    #[test]
    fn test_generation_is_idempotent() {
        let (layout, key) = setup();
        let generator = VariantGenerator::new(&layout, &JsonModelProvider);
        generator.generate(&key, 0, 3, 0.1).unwrap();
        let first = read_all(&layout, &key, 0, 3);
        let modified: Vec<_> = (0..3)
            .map(|i| std::fs::metadata(layout.variant(0, &key, i)).unwrap().modified().unwrap())
            .collect();

        let report = generator.generate(&key, 0, 3, 0.1).unwrap();
        assert!(report.created.is_empty());
        assert_eq!(report.skipped, vec![0, 1, 2]);
        assert_eq!(read_all(&layout, &key, 0, 3), first);
        for i in 0..3 {
            let again = std::fs::metadata(layout.variant(0, &key, i)).unwrap().modified().unwrap();
            assert_eq!(again, modified[i]);
        }

        // a fresh tree produces the same bytes
        let _ = std::fs::remove_dir_all(layout.mutated_dir(0, &key));
        generator.generate(&key, 0, 3, 0.1).unwrap();
        assert_eq!(read_all(&layout, &key, 0, 3), first);

        let _ = std::fs::remove_dir_all(layout.root());
    }

    #[test]
    fn test_variant_zero_copies_champion() {
        let (layout, key) = setup();
        let champion = b"{\"not\": \"parsed\"}".to_vec();
        storage::write_atomic(&layout.champion(&key), &champion).unwrap();

        let report = VariantGenerator::new(&layout, &JsonModelProvider)
            .generate(&key, 0, 2, 0.1)
            .unwrap();
        assert!(report.seeded_from_champion);
        assert_eq!(std::fs::read(layout.variant(0, &key, 0)).unwrap(), champion);

        let _ = std::fs::remove_dir_all(layout.root());
    }

    #[test]
    fn test_next_generation_seeds_from_rank_zero() {
        let (layout, key) = setup();
        let generator = VariantGenerator::new(&layout, &JsonModelProvider);
        generator.generate(&key, 0, 3, 0.1).unwrap();
        storage::write_json_atomic(
            &layout.ranked(0, &key),
            &vec![
                RankedEntry { variant: 2, mean_progress: 3.0 },
                RankedEntry { variant: 0, mean_progress: 1.0 },
            ],
        )
        .unwrap();

        let report = generator.generate(&key, 1, 3, 0.1).unwrap();
        assert_eq!(report.base, layout.variant(0, &key, 2));
        let top = std::fs::read(layout.variant(0, &key, 2)).unwrap();
        assert_eq!(std::fs::read(layout.base_artifact(1, &key)).unwrap(), top);
        assert_eq!(std::fs::read(layout.variant(1, &key, 0)).unwrap(), top);

        let _ = std::fs::remove_dir_all(layout.root());
    }

    #[test]
    fn test_missing_base_is_reported() {
        let (layout, key) = setup();
        let generator = VariantGenerator::new(&layout, &JsonModelProvider);

        let err = generator.generate(&key, 1, 2, 0.1).unwrap_err();
        assert!(matches!(err, EvolveError::MissingBaseArtifact { generation: 1, .. }));

        let other = LineageKey::new(NumericType::Int8, ExperimentMode::Replay);
        let err = generator.generate(&other, 0, 2, 0.1).unwrap_err();
        assert!(matches!(err, EvolveError::MissingBaseArtifact { generation: 0, .. }));
        assert!(!layout.mutated_dir(0, &other).exists());

        std::fs::write(layout.base_artifact(0, &other), "garbage").unwrap();
        let err = generator.generate(&other, 0, 2, 0.1).unwrap_err();
        assert!(matches!(err, EvolveError::MissingBaseArtifact { .. }));

        let _ = std::fs::remove_dir_all(layout.root());
    }
}
