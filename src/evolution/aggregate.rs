//! Aggregator: per-unit results to variant summaries to ranked lists
//!
//! Both reductions are write-once. A ranked list that already exists is
//! never recomputed, even if summaries change underneath it; deleting the
//! output is the only way to force a re-rank.

use log::{info, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;

use crate::error::{EvolveError, Result};
use crate::model::LineageKey;
use crate::storage::{self, layout::parse_summary_index, ModelsLayout};

/// One evaluated unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub name: String,
    pub planet: String,
    pub goal: [f64; 3],
    pub initial_position: [f64; 3],
    pub final_position: [f64; 3],
    pub initial_distance: f64,
    pub final_distance: f64,
    /// initial distance to goal minus final distance to goal
    pub progress: f64,
    /// Vertical displacement over the window
    pub delta_y: f64,
}

/// Written once per variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSummary {
    pub mean_progress: f64,
    pub median_progress: f64,
    pub max_progress: f64,
    pub min_progress: f64,
    pub results: Vec<UnitResult>,
}

impl VariantSummary {
    pub fn from_results(results: Vec<UnitResult>) -> Self {
        let progress: Vec<f64> = results.iter().map(|r| r.progress).collect();
        let stats = SummaryStats::compute(&progress);
        Self {
            mean_progress: stats.mean,
            median_progress: stats.median,
            max_progress: stats.max,
            min_progress: stats.min,
            results,
        }
    }
}

/// Mean, median, min and max of a sample. All zero for an empty sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SummaryStats {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

impl SummaryStats {
    pub fn compute(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let n = sorted.len();
        let median = if n % 2 == 0 {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        } else {
            sorted[n / 2]
        };
        Self {
            mean: sorted.iter().sum::<f64>() / n as f64,
            median,
            min: sorted[0],
            max: sorted[n - 1],
        }
    }
}

/// Variant indices are stored as strings (`"3"`) in ranked lists
mod variant_string {
    use super::*;

    pub fn serialize<S: Serializer>(variant: &usize, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&variant.to_string())
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(usize),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<usize, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        }
    }
}

/// One row of a ranked lineage result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    #[serde(with = "variant_string")]
    pub variant: usize,
    pub mean_progress: f64,
}

/// One row of the cross-lineage leaderboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub num_type: String,
    pub mode: String,
    #[serde(with = "variant_string")]
    pub variant: usize,
    pub mean_progress: f64,
}

/// What a write-once aggregation step did
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregated<T> {
    Written(T),
    AlreadyExists,
}

/// Minimal view of a summary; only the mean is needed for ranking
#[derive(Deserialize)]
struct SummaryHead {
    mean_progress: Option<f64>,
}

/// Sort descending by mean progress, keeping enumeration order for ties
pub fn rank(entries: &mut [RankedEntry]) {
    entries.sort_by(|a, b| {
        b.mean_progress
            .partial_cmp(&a.mean_progress)
            .unwrap_or(Ordering::Equal)
    });
}

/// Build and persist the ranked list for one lineage and generation.
///
/// Requires a summary for every variant in `[0, population)`; otherwise
/// fails with `IncompleteGeneration` and writes nothing.
pub fn rank_lineage(
    layout: &ModelsLayout,
    key: &LineageKey,
    generation: u32,
    population: usize,
) -> Result<Aggregated<Vec<RankedEntry>>> {
    let output = layout.ranked(generation, key);
    if output.exists() {
        info!("Ranked results already exist at {}, skipping", output.display());
        return Ok(Aggregated::AlreadyExists);
    }

    let missing = (0..population)
        .filter(|i| !layout.summary(generation, key, *i).exists())
        .count();
    if missing > 0 {
        return Err(EvolveError::IncompleteGeneration {
            lineage: key.label(),
            generation,
            missing,
            expected: population,
        });
    }

    let results_dir = layout.results_dir(generation, key);
    let mut indices: Vec<usize> = std::fs::read_dir(&results_dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| parse_summary_index(&entry.file_name().to_string_lossy()))
        .collect();
    indices.sort_unstable();

    let mut entries = Vec::with_capacity(indices.len());
    for index in indices {
        let path = layout.summary(generation, key, index);
        match storage::read_json::<SummaryHead>(&path) {
            Ok(SummaryHead {
                mean_progress: Some(mean),
            }) if mean.is_finite() => entries.push(RankedEntry {
                variant: index,
                mean_progress: mean,
            }),
            Ok(_) => warn!(
                "Summary {} for {} gen {} variant {} has no usable mean_progress, skipping",
                path.display(),
                key,
                generation,
                index
            ),
            Err(e) => warn!(
                "Skipping summary for {} gen {} variant {}: {}",
                key, generation, index, e
            ),
        }
    }

    if entries.is_empty() {
        return Err(EvolveError::Malformed {
            path: results_dir,
            reason: "no valid variant summaries".to_string(),
        });
    }

    rank(&mut entries);
    storage::write_json_once(&output, &entries)?;
    info!(
        "Ranked {} variants for {} gen {}, best variant {} ({:.4}) -> {}",
        entries.len(),
        key,
        generation,
        entries[0].variant,
        entries[0].mean_progress,
        output.display()
    );
    Ok(Aggregated::Written(entries))
}

/// Read a persisted ranked list
pub fn read_ranked(
    layout: &ModelsLayout,
    key: &LineageKey,
    generation: u32,
) -> Result<Vec<RankedEntry>> {
    storage::read_json(&layout.ranked(generation, key))
}

/// Build and persist the cross-lineage leaderboard for a generation from
/// every ranked list present in `total_results/`.
///
/// Returns `Ok(None)` when there is nothing to rank yet.
pub fn write_leaderboard(
    layout: &ModelsLayout,
    generation: u32,
) -> Result<Option<Aggregated<Vec<LeaderboardEntry>>>> {
    let output = layout.leaderboard(generation);
    if output.exists() {
        info!("Leaderboard already exists at {}, skipping", output.display());
        return Ok(Some(Aggregated::AlreadyExists));
    }
    let dir = layout.total_results_dir(generation);
    if !dir.exists() {
        return Ok(None);
    }

    let mut files: Vec<String> = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| {
            name.ends_with(".json")
                && !name.starts_with('.')
                && name != storage::layout::LEADERBOARD_FILE
        })
        .collect();
    files.sort();

    let mut board = Vec::new();
    for file in files {
        let label = file.trim_end_matches(".json");
        let key: LineageKey = match label.parse() {
            Ok(k) => k,
            Err(e) => {
                warn!("Unexpected ranked file {}: {}", file, e);
                continue;
            }
        };
        match read_ranked(layout, &key, generation) {
            Ok(ranked) => match ranked.first() {
                Some(top) => board.push(LeaderboardEntry {
                    num_type: key.numeric_type.to_string(),
                    mode: key.mode.to_string(),
                    variant: top.variant,
                    mean_progress: top.mean_progress,
                }),
                None => warn!("Ranked list {} is empty", file),
            },
            Err(e) => warn!("Skipping ranked list {}: {}", file, e),
        }
    }

    if board.is_empty() {
        return Ok(None);
    }
    board.sort_by(|a, b| {
        b.mean_progress
            .partial_cmp(&a.mean_progress)
            .unwrap_or(Ordering::Equal)
    });
    storage::write_json_once(&output, &board)?;
    info!(
        "Saved leaderboard for gen {} with {} lineages -> {}",
        generation,
        board.len(),
        output.display()
    );
    Ok(Some(Aggregated::Written(board)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExperimentMode, NumericType};

    fn test_layout() -> ModelsLayout {
        ModelsLayout::new(
            std::env::temp_dir().join(format!("spectrum-aggregate-test-{}", uuid::Uuid::new_v4())),
        )
    }

    fn summary(mean: f64) -> VariantSummary {
        VariantSummary {
            mean_progress: mean,
            median_progress: mean,
            max_progress: mean,
            min_progress: mean,
            results: Vec::new(),
        }
    }

    #[test]
    fn test_stats_example() {
        let stats = SummaryStats::compute(&[2.0, 4.0, 6.0, 8.0]);
        assert_eq!(stats.mean, 5.0);
        assert_eq!(stats.median, 5.0);
        assert_eq!(stats.max, 8.0);
        assert_eq!(stats.min, 2.0);
    }

    #[test]
    fn test_stats_odd_and_empty() {
        let stats = SummaryStats::compute(&[9.0, -1.0, 3.0]);
        assert_eq!(stats.median, 3.0);
        assert_eq!(stats.min, -1.0);
        assert_eq!(SummaryStats::compute(&[]), SummaryStats::default());
    }

    #[test]
    fn test_rank_is_stable_descending() {
        let mut entries = vec![
            RankedEntry { variant: 0, mean_progress: 1.0 },
            RankedEntry { variant: 1, mean_progress: 3.0 },
            RankedEntry { variant: 2, mean_progress: 1.0 },
            RankedEntry { variant: 3, mean_progress: 3.0 },
            RankedEntry { variant: 4, mean_progress: 2.0 },
        ];
        rank(&mut entries);
        let order: Vec<usize> = entries.iter().map(|e| e.variant).collect();
        assert_eq!(order, vec![1, 3, 4, 0, 2]);
    }

    #[test]
    fn test_variant_serialized_as_string() {
        let json = serde_json::to_string(&RankedEntry {
            variant: 3,
            mean_progress: 1.5,
        })
        .unwrap();
        assert_eq!(json, r#"{"variant":"3","mean_progress":1.5}"#);
        let back: RankedEntry =
            serde_json::from_str(r#"{"variant":7,"mean_progress":0.0}"#).unwrap();
        assert_eq!(back.variant, 7);
    }

    #[test]
    fn test_rank_lineage_requires_all_summaries() {
        let layout = test_layout();
        let key = LineageKey::new(NumericType::Int16, ExperimentMode::Standard);
        storage::write_json_atomic(&layout.summary(0, &key, 0), &summary(1.0)).unwrap();

        let err = rank_lineage(&layout, &key, 0, 2).unwrap_err();
        assert!(matches!(err, EvolveError::IncompleteGeneration { missing: 1, .. }));
        assert!(!layout.ranked(0, &key).exists());

        let _ = std::fs::remove_dir_all(layout.root());
    }

    #[test]
    fn test_rank_lineage_skips_malformed_and_is_write_once() {
        let layout = test_layout();
        let key = LineageKey::new(NumericType::Float32, ExperimentMode::Replay);
        // index 10 sorts before 2 lexically; enumeration must be numeric
        for (i, mean) in [(0, 2.0), (1, 5.0), (2, 5.0), (10, 5.0)] {
            storage::write_json_atomic(&layout.summary(0, &key, i), &summary(mean)).unwrap();
        }
        std::fs::write(layout.summary(0, &key, 3), r#"{"median_progress": 1.0}"#).unwrap();

        let ranked = match rank_lineage(&layout, &key, 0, 4).unwrap() {
            Aggregated::Written(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        let order: Vec<usize> = ranked.iter().map(|e| e.variant).collect();
        assert_eq!(order, vec![1, 2, 10, 0]);

        // inputs change, output does not
        storage::write_json_atomic(&layout.summary(0, &key, 0), &summary(99.0)).unwrap();
        assert_eq!(rank_lineage(&layout, &key, 0, 4).unwrap(), Aggregated::AlreadyExists);
        assert_eq!(read_ranked(&layout, &key, 0).unwrap(), ranked);

        let _ = std::fs::remove_dir_all(layout.root());
    }

    #[test]
    fn test_leaderboard_takes_top_per_lineage() {
        let layout = test_layout();
        let a = LineageKey::new(NumericType::Int8, ExperimentMode::Standard);
        let b = LineageKey::new(NumericType::Float64, ExperimentMode::DynamicReplay);
        storage::write_json_atomic(
            &layout.ranked(1, &a),
            &vec![
                RankedEntry { variant: 2, mean_progress: 4.0 },
                RankedEntry { variant: 0, mean_progress: 1.0 },
            ],
        )
        .unwrap();
        storage::write_json_atomic(
            &layout.ranked(1, &b),
            &vec![RankedEntry { variant: 1, mean_progress: 9.0 }],
        )
        .unwrap();

        let board = match write_leaderboard(&layout, 1).unwrap() {
            Some(Aggregated::Written(board)) => board,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].num_type, "float64");
        assert_eq!(board[0].mode, "DynamicReplay");
        assert_eq!(board[1].variant, 2);

        assert_eq!(write_leaderboard(&layout, 1).unwrap(), Some(Aggregated::AlreadyExists));
        assert_eq!(write_leaderboard(&layout, 7).unwrap(), None);

        let _ = std::fs::remove_dir_all(layout.root());
    }
}
