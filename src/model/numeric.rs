//! Representation tags: numeric type, structural mode and the lineage key
//!
//! A lineage is one numeric representation crossed with one structural
//! mode. Both sets are closed, so every call site dispatches through the
//! same enum instead of one branch per representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric representation a policy network's weights are stored in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericType {
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
}

impl NumericType {
    pub const ALL: [NumericType; 12] = [
        NumericType::Int,
        NumericType::Int8,
        NumericType::Int16,
        NumericType::Int32,
        NumericType::Int64,
        NumericType::Uint,
        NumericType::Uint8,
        NumericType::Uint16,
        NumericType::Uint32,
        NumericType::Uint64,
        NumericType::Float32,
        NumericType::Float64,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NumericType::Int => "int",
            NumericType::Int8 => "int8",
            NumericType::Int16 => "int16",
            NumericType::Int32 => "int32",
            NumericType::Int64 => "int64",
            NumericType::Uint => "uint",
            NumericType::Uint8 => "uint8",
            NumericType::Uint16 => "uint16",
            NumericType::Uint32 => "uint32",
            NumericType::Uint64 => "uint64",
            NumericType::Float32 => "float32",
            NumericType::Float64 => "float64",
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, NumericType::Float32 | NumericType::Float64)
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            NumericType::Uint
                | NumericType::Uint8
                | NumericType::Uint16
                | NumericType::Uint32
                | NumericType::Uint64
        )
    }

    fn bits(&self) -> u32 {
        match self {
            NumericType::Int8 | NumericType::Uint8 => 8,
            NumericType::Int16 | NumericType::Uint16 => 16,
            NumericType::Int32 | NumericType::Uint32 | NumericType::Float32 => 32,
            _ => 64,
        }
    }

    /// Fixed-point step for integer representations (weights are stored as
    /// `raw * quantum`). Floats have no quantum.
    pub fn quantum(&self) -> Option<f64> {
        if self.is_float() {
            return None;
        }
        Some(match self.bits() {
            8 => 1.0 / 32.0,
            16 => 1.0 / 1024.0,
            _ => 1.0 / 65536.0,
        })
    }

    /// Snap a weight onto the grid this representation can express
    pub fn quantize(&self, value: f64) -> f64 {
        match self {
            NumericType::Float64 => value,
            NumericType::Float32 => value as f32 as f64,
            _ => {
                let q = self.quantum().unwrap_or(1.0);
                let (min_raw, max_raw) = self.raw_range();
                let raw = (value / q).round().clamp(min_raw, max_raw);
                raw * q
            }
        }
    }

    fn raw_range(&self) -> (f64, f64) {
        // 64-bit ranges are far outside any weight we produce, cap them to keep f64 exact
        let bits = self.bits().min(53);
        if self.is_unsigned() {
            (0.0, (2f64).powi(bits as i32) - 1.0)
        } else {
            let half = (2f64).powi(bits as i32 - 1);
            (-half, half - 1.0)
        }
    }
}

impl fmt::Display for NumericType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NumericType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NumericType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown numeric type: {}", s))
    }
}

/// Structural mode of a policy network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExperimentMode {
    Standard,
    Replay,
    DynamicReplay,
}

impl ExperimentMode {
    pub const ALL: [ExperimentMode; 3] = [
        ExperimentMode::Standard,
        ExperimentMode::Replay,
        ExperimentMode::DynamicReplay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentMode::Standard => "Standard",
            ExperimentMode::Replay => "Replay",
            ExperimentMode::DynamicReplay => "DynamicReplay",
        }
    }
}

impl fmt::Display for ExperimentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Standard" => Ok(ExperimentMode::Standard),
            "Replay" => Ok(ExperimentMode::Replay),
            "DynamicReplay" => Ok(ExperimentMode::DynamicReplay),
            other => Err(format!("unsupported mode: {}", other)),
        }
    }
}

/// Identity of one independent evolutionary line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineageKey {
    pub numeric_type: NumericType,
    pub mode: ExperimentMode,
}

impl LineageKey {
    pub fn new(numeric_type: NumericType, mode: ExperimentMode) -> Self {
        Self { numeric_type, mode }
    }

    /// `{type}_{mode}`, the stem used for every per-lineage file name
    pub fn label(&self) -> String {
        format!("{}_{}", self.numeric_type, self.mode)
    }
}

impl fmt::Display for LineageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.numeric_type, self.mode)
    }
}

impl FromStr for LineageKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (t, m) = s
            .split_once('_')
            .ok_or_else(|| format!("unexpected lineage label: {}", s))?;
        Ok(LineageKey::new(t.parse()?, m.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_roundtrip() {
        for t in NumericType::ALL {
            for m in ExperimentMode::ALL {
                let key = LineageKey::new(t, m);
                let parsed: LineageKey = key.label().parse().unwrap();
                assert_eq!(parsed, key);
            }
        }
    }

    #[test]
    fn test_unknown_tags_rejected() {
        assert!("complex64".parse::<NumericType>().is_err());
        assert!("Turbo".parse::<ExperimentMode>().is_err());
        assert!("float32".parse::<LineageKey>().is_err());
    }

    #[test]
    fn test_quantize_float32() {
        let v = 0.1f64;
        assert_eq!(NumericType::Float32.quantize(v), 0.1f32 as f64);
        assert_eq!(NumericType::Float64.quantize(v), v);
    }

    #[test]
    fn test_quantize_integer_grid() {
        let q = NumericType::Int8.quantum().unwrap();
        let snapped = NumericType::Int8.quantize(0.1);
        assert!((snapped / q).fract().abs() < 1e-12);
        // int8 raw range is [-128, 127]
        assert_eq!(NumericType::Int8.quantize(100.0), 127.0 * q);
        assert_eq!(NumericType::Int8.quantize(-100.0), -128.0 * q);
    }

    #[test]
    fn test_unsigned_clamps_at_zero() {
        assert_eq!(NumericType::Uint16.quantize(-0.5), 0.0);
        assert!(NumericType::Uint16.quantize(0.5) > 0.0);
    }

    #[test]
    fn test_serde_tags() {
        let json = serde_json::to_string(&NumericType::Uint32).unwrap();
        assert_eq!(json, "\"uint32\"");
        let mode: ExperimentMode = serde_json::from_str("\"DynamicReplay\"").unwrap();
        assert_eq!(mode, ExperimentMode::DynamicReplay);
    }
}
