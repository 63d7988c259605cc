//! Path layout of the `models/` artifact tree
//!
//! ```text
//! models/{gen}/{type}_{mode}.json                                 base artifact
//! models/{gen}/mutated_{type}_{mode}/variant_{i}.json             immutable variants
//! models/{gen}/mutated_{type}_{mode}/agent_names/variant_{i}.json unit names
//! models/{gen}/mutated_{type}_{mode}/results/variant_{i}_summary.json
//! models/{gen}/total_results/{type}_{mode}.json                   ranked list
//! models/{gen}/total_results/full_results.json                    leaderboard
//! models/champion/{type}_{mode}.json                              champion
//! models/champion/{type}_{mode}.provenance.json                   champion provenance
//! models/ledger.json, models/locks/{type}_{mode}.lock
//! ```

use crate::model::LineageKey;
use std::path::{Path, PathBuf};

pub const LEADERBOARD_FILE: &str = "full_results.json";

#[derive(Debug, Clone)]
pub struct ModelsLayout {
    root: PathBuf,
}

impl ModelsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generation_dir(&self, gen: u32) -> PathBuf {
        self.root.join(gen.to_string())
    }

    pub fn base_artifact(&self, gen: u32, key: &LineageKey) -> PathBuf {
        self.generation_dir(gen).join(format!("{}.json", key.label()))
    }

    pub fn mutated_dir(&self, gen: u32, key: &LineageKey) -> PathBuf {
        self.generation_dir(gen).join(format!("mutated_{}", key.label()))
    }

    pub fn variant(&self, gen: u32, key: &LineageKey, index: usize) -> PathBuf {
        self.mutated_dir(gen, key).join(format!("variant_{}.json", index))
    }

    pub fn agent_names(&self, gen: u32, key: &LineageKey, index: usize) -> PathBuf {
        self.mutated_dir(gen, key)
            .join("agent_names")
            .join(format!("variant_{}.json", index))
    }

    pub fn results_dir(&self, gen: u32, key: &LineageKey) -> PathBuf {
        self.mutated_dir(gen, key).join("results")
    }

    pub fn summary(&self, gen: u32, key: &LineageKey, index: usize) -> PathBuf {
        self.results_dir(gen, key)
            .join(format!("variant_{}_summary.json", index))
    }

    pub fn total_results_dir(&self, gen: u32) -> PathBuf {
        self.generation_dir(gen).join("total_results")
    }

    pub fn ranked(&self, gen: u32, key: &LineageKey) -> PathBuf {
        self.total_results_dir(gen).join(format!("{}.json", key.label()))
    }

    pub fn leaderboard(&self, gen: u32) -> PathBuf {
        self.total_results_dir(gen).join(LEADERBOARD_FILE)
    }

    pub fn champion_dir(&self) -> PathBuf {
        self.root.join("champion")
    }

    pub fn champion(&self, key: &LineageKey) -> PathBuf {
        self.champion_dir().join(format!("{}.json", key.label()))
    }

    pub fn champion_provenance(&self, key: &LineageKey) -> PathBuf {
        self.champion_dir()
            .join(format!("{}.provenance.json", key.label()))
    }

    pub fn ledger(&self) -> PathBuf {
        self.root.join("ledger.json")
    }

    pub fn lease(&self, key: &LineageKey) -> PathBuf {
        self.root.join("locks").join(format!("{}.lock", key.label()))
    }
}

/// Parse `variant_{i}_summary.json` into `i`
pub fn parse_summary_index(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix("variant_")?
        .strip_suffix("_summary.json")?
        .parse()
        .ok()
}
