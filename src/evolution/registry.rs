//! Lineage registry: one entry per configured (numeric type, mode) pair

use crate::config::ExperimentConfig;
use crate::model::LineageKey;
use crate::storage::ModelsLayout;

/// One independent evolutionary line
#[derive(Debug, Clone, PartialEq)]
pub struct Lineage {
    pub key: LineageKey,
    /// Remote session name; `destroy_all` on it removes only this lineage's units
    pub session: String,
}

impl Lineage {
    pub fn new(key: LineageKey) -> Self {
        Self {
            session: key.label(),
            key,
        }
    }

    pub fn label(&self) -> String {
        self.key.label()
    }

    /// Highest generation with a persisted ranked list, if any
    pub fn last_ranked_generation(&self, layout: &ModelsLayout) -> Option<u32> {
        let entries = std::fs::read_dir(layout.root()).ok()?;
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
            .filter(|gen| layout.ranked(*gen, &self.key).exists())
            .max()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LineageRegistry {
    lineages: Vec<Lineage>,
}

impl LineageRegistry {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self::from_keys(config.lineages())
    }

    pub fn from_keys(keys: impl IntoIterator<Item = LineageKey>) -> Self {
        let mut lineages: Vec<Lineage> = Vec::new();
        for key in keys {
            if !lineages.iter().any(|l| l.key == key) {
                lineages.push(Lineage::new(key));
            }
        }
        Self { lineages }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lineage> {
        self.lineages.iter()
    }

    pub fn keys(&self) -> Vec<LineageKey> {
        self.lineages.iter().map(|l| l.key).collect()
    }

    pub fn get(&self, label: &str) -> Option<&Lineage> {
        self.lineages.iter().find(|l| l.label() == label)
    }

    pub fn len(&self) -> usize {
        self.lineages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lineages.is_empty()
    }
}
