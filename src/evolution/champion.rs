//! Champion promoter
//!
//! The champion slot holds the best artifact ever promoted for a lineage.
//! Its score is read from the provenance file written next to it when the
//! recorded hash still matches the champion bytes. Trees without usable
//! provenance fall back to scanning ranked lists backward for a variant
//! whose bytes equal the champion.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::aggregate::read_ranked;
use crate::error::{EvolveError, Result};
use crate::model::LineageKey;
use crate::storage::{self, ModelsLayout};

const GENESIS: &str = "genesis";

/// One promotion in a champion's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRecord {
    pub generation: u32,
    pub variant: usize,
    pub score: f64,
    pub artifact_hash: String,
    pub promoted_at: DateTime<Utc>,
    /// sha256 over the previous record's chain hash and this record
    pub chain_hash: String,
}

/// Stored at `models/champion/{type}_{mode}.provenance.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChampionProvenance {
    pub artifact_hash: String,
    pub generation: u32,
    pub variant: usize,
    pub score: f64,
    pub promoted_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<PromotionRecord>,
}

impl ChampionProvenance {
    /// Whether every record links to its predecessor and the head fields
    /// agree with the newest record
    pub fn verify_chain(&self) -> bool {
        let mut prev = GENESIS.to_string();
        for record in &self.history {
            let expected = chain_hash(
                &prev,
                record.generation,
                record.variant,
                record.score,
                &record.artifact_hash,
            );
            if expected != record.chain_hash {
                return false;
            }
            prev = expected;
        }
        match self.history.last() {
            Some(last) => {
                last.artifact_hash == self.artifact_hash
                    && last.generation == self.generation
                    && last.variant == self.variant
                    && last.score == self.score
            }
            None => true,
        }
    }
}

/// Where the incumbent's score came from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IncumbentSource {
    Provenance,
    /// Found by byte comparison in this generation's ranked list
    Scan { generation: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Incumbent {
    pub score: f64,
    pub generation: u32,
    pub variant: usize,
    pub source: IncumbentSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PromotionDecision {
    Promoted {
        generation: u32,
        variant: usize,
        score: f64,
        /// `None` when there was no champion or its score could not be found
        previous_score: Option<f64>,
    },
    Kept {
        incumbent: Incumbent,
        candidate_score: f64,
    },
}

pub fn artifact_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn chain_hash(
    prev_hash: &str,
    generation: u32,
    variant: usize,
    score: f64,
    artifact_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(generation.to_le_bytes());
    hasher.update((variant as u64).to_le_bytes());
    hasher.update(score.to_le_bytes());
    hasher.update(artifact_hash.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct ChampionPromoter<'a> {
    layout: &'a ModelsLayout,
}

impl<'a> ChampionPromoter<'a> {
    pub fn new(layout: &'a ModelsLayout) -> Self {
        Self { layout }
    }

    pub fn provenance(&self, key: &LineageKey) -> Option<ChampionProvenance> {
        let path = self.layout.champion_provenance(key);
        if !path.exists() {
            return None;
        }
        match storage::read_json(&path) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("Ignoring unreadable champion provenance {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Score of the stored champion, or `None` if no record of it exists
    pub fn incumbent(
        &self,
        key: &LineageKey,
        generation: u32,
        champion: &[u8],
    ) -> Result<Option<Incumbent>> {
        let hash = artifact_hash(champion);
        if let Some(prov) = self.provenance(key) {
            if !prov.verify_chain() {
                warn!("Champion provenance for {} fails its hash chain, scanning history", key);
                return self.scan_for(key, generation, champion);
            }
            if prov.artifact_hash == hash {
                return Ok(Some(Incumbent {
                    score: prov.score,
                    generation: prov.generation,
                    variant: prov.variant,
                    source: IncumbentSource::Provenance,
                }));
            }
            warn!(
                "Champion {} does not match its provenance (gen {} variant {}), scanning history",
                key, prov.generation, prov.variant
            );
        }
        self.scan_for(key, generation, champion)
    }

    /// Walk ranked lists from `generation` down to 0 and return the first
    /// entry whose variant bytes equal `champion`
    fn scan_for(
        &self,
        key: &LineageKey,
        generation: u32,
        champion: &[u8],
    ) -> Result<Option<Incumbent>> {
        for gen in (0..=generation).rev() {
            if !self.layout.ranked(gen, key).exists() {
                continue;
            }
            let ranked = match read_ranked(self.layout, key, gen) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Skipping ranked list of {} gen {}: {}", key, gen, e);
                    continue;
                }
            };
            for entry in ranked {
                let path = self.layout.variant(gen, key, entry.variant);
                match std::fs::read(&path) {
                    Ok(bytes) if bytes == champion => {
                        debug!(
                            "Champion {} matches gen {} variant {}",
                            key, gen, entry.variant
                        );
                        return Ok(Some(Incumbent {
                            score: entry.mean_progress,
                            generation: gen,
                            variant: entry.variant,
                            source: IncumbentSource::Scan { generation: gen },
                        }));
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Cannot read {}: {}", path.display(), e),
                }
            }
        }
        Ok(None)
    }

    /// Compare rank 0 of `generation` against the champion and replace it if
    /// strictly better. Ties keep the incumbent.
    pub fn promote_if_better(
        &self,
        key: &LineageKey,
        generation: u32,
    ) -> Result<PromotionDecision> {
        let ranked = read_ranked(self.layout, key, generation)?;
        let top = ranked.first().ok_or_else(|| EvolveError::Malformed {
            path: self.layout.ranked(generation, key),
            reason: "ranked list is empty".to_string(),
        })?;
        let candidate = std::fs::read(self.layout.variant(generation, key, top.variant))?;

        let champion_path = self.layout.champion(key);
        let previous_score = if champion_path.exists() {
            let champion = std::fs::read(&champion_path)?;
            match self.incumbent(key, generation, &champion)? {
                Some(incumbent) if top.mean_progress > incumbent.score => Some(incumbent.score),
                Some(incumbent) => {
                    info!(
                        "Keeping champion for {} ({:.4} >= {:.4} from gen {} variant {})",
                        key,
                        incumbent.score,
                        top.mean_progress,
                        incumbent.generation,
                        incumbent.variant
                    );
                    if let IncumbentSource::Scan { .. } = incumbent.source {
                        info!("Rewriting champion provenance for {} from scan", key);
                        self.write_provenance(
                            key,
                            incumbent.generation,
                            incumbent.variant,
                            incumbent.score,
                            artifact_hash(&champion),
                        )?;
                    }
                    return Ok(PromotionDecision::Kept {
                        incumbent,
                        candidate_score: top.mean_progress,
                    });
                }
                None => {
                    warn!(
                        "No record of where the champion for {} came from, replacing it",
                        key
                    );
                    None
                }
            }
        } else {
            None
        };

        self.write_champion(key, generation, top.variant, top.mean_progress, &candidate)?;
        info!(
            "Promoted {} gen {} variant {} to champion ({:.4}, was {})",
            key,
            generation,
            top.variant,
            top.mean_progress,
            previous_score.map_or_else(|| "none".to_string(), |s| format!("{:.4}", s))
        );
        Ok(PromotionDecision::Promoted {
            generation,
            variant: top.variant,
            score: top.mean_progress,
            previous_score,
        })
    }

    fn write_champion(
        &self,
        key: &LineageKey,
        generation: u32,
        variant: usize,
        score: f64,
        bytes: &[u8],
    ) -> Result<()> {
        storage::write_atomic(&self.layout.champion(key), bytes)?;
        self.write_provenance(key, generation, variant, score, artifact_hash(bytes))
    }

    /// Record `hash` as the current champion. A history whose chain no
    /// longer verifies is restarted.
    fn write_provenance(
        &self,
        key: &LineageKey,
        generation: u32,
        variant: usize,
        score: f64,
        hash: String,
    ) -> Result<()> {
        let promoted_at = Utc::now();
        let mut history = match self.provenance(key) {
            Some(p) if p.verify_chain() => p.history,
            Some(_) => {
                warn!("Restarting broken champion history for {}", key);
                Vec::new()
            }
            None => Vec::new(),
        };
        let prev = history
            .last()
            .map(|r| r.chain_hash.clone())
            .unwrap_or_else(|| GENESIS.to_string());
        history.push(PromotionRecord {
            generation,
            variant,
            score,
            artifact_hash: hash.clone(),
            promoted_at,
            chain_hash: chain_hash(&prev, generation, variant, score, &hash),
        });

        let provenance = ChampionProvenance {
            artifact_hash: hash,
            generation,
            variant,
            score,
            promoted_at,
            history,
        };
        storage::write_json_atomic(&self.layout.champion_provenance(key), &provenance)
    }
}
