//! Parameter metadata for scanner configuration
//!
//! This module describes the tunable knobs of a scan, enabling:
//! - Threshold grid sweeps
//! - Parameter documentation
//! - Configuration from loosely typed key/value input
//!
//! # Example
//!
//! ```rust
//! use retrace::prelude::*;
//!
//! for param in ScanConfig::param_meta() {
//!   println!("{}: {:?} (default: {})", param.name, param.param_type, param.default);
//! }
//! ```

use std::collections::HashMap;

use crate::{PatternError, Result, Threshold};

// ============================================================
// PARAMETER TYPES
// ============================================================

/// Type of parameter value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
  /// Integer basis points in 1..=9999
  BasisPoints,
  /// Whole calendar days (positive integer)
  Days,
}

/// Metadata for a single scan parameter
#[derive(Debug, Clone)]
pub struct ParamMeta {
  /// Parameter name (e.g., "threshold_bp")
  pub name: &'static str,
  pub param_type: ParamType,
  pub default: f64,
  /// Range for grid sweeps: (min, max, step)
  pub range: (f64, f64, f64),
  pub description: &'static str,
}

impl ParamMeta {
  pub const fn basis_points(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self { name, param_type: ParamType::BasisPoints, default, range, description }
  }

  pub const fn days(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self { name, param_type: ParamType::Days, default, range, description }
  }

  /// Generate all values for a grid sweep
  pub fn generate_grid(&self) -> Vec<f64> {
    let (min, max, step) = self.range;
    let mut values = Vec::new();
    let mut v = min;
    while v <= max + f64::EPSILON {
      values.push(v);
      v += step;
    }
    values
  }

  /// Validate a value for this parameter
  pub fn validate(&self, value: f64) -> Result<()> {
    if !value.is_finite() || value.fract() != 0.0 {
      return Err(match self.param_type {
        ParamType::BasisPoints => PatternError::InvalidValue("Basis points must be an integer"),
        ParamType::Days => PatternError::InvalidValue("Days must be a positive integer"),
      });
    }
    let (min, max, _) = self.range;
    if value < min || value > max {
      return Err(PatternError::OutOfRange {
        field: self.name,
        value: value as i64,
        min: min as i64,
        max: max as i64,
      });
    }
    Ok(())
  }
}

/// Detection threshold, in basis points of the anchor price
pub const THRESHOLD_BP: ParamMeta = ParamMeta::basis_points(
  "threshold_bp",
  2000.0,
  (500.0, 5000.0, 500.0),
  "Move away from the anchor that opens a pattern",
);

/// Expiration horizon, in calendar days
pub const EXPIRATION_DAYS: ParamMeta = ParamMeta::days(
  "expiration_days",
  1200.0,
  (30.0, 3600.0, 30.0),
  "Days after its anchor before an open pattern expires",
);

// ============================================================
// PARAMETERIZED TRAIT
// ============================================================

/// Trait for configuration types built from loose parameters
pub trait Parameterized: Sized {
  /// Returns metadata for all configurable parameters
  fn param_meta() -> &'static [ParamMeta];

  /// Build from a HashMap. Missing parameters use their default values.
  fn with_params(params: &HashMap<&str, f64>) -> Result<Self>;
}

// ============================================================
// PARAMETER VALUE HELPERS
// ============================================================

/// Helper to get a Threshold from params with default fallback
pub fn get_threshold(params: &HashMap<&str, f64>, key: &str, default: u32) -> Result<Threshold> {
  let value = params.get(key).copied().unwrap_or(f64::from(default));
  if !value.is_finite() || value.fract() != 0.0 {
    return Err(PatternError::InvalidValue("Basis points must be an integer"));
  }
  // saturating cast; out-of-range values are rejected by Threshold::new
  Threshold::new(value as u32)
}

/// Helper to get a day count from params with default fallback
pub fn get_days(params: &HashMap<&str, f64>, key: &str, default: u32) -> Result<u32> {
  let value = params.get(key).copied().unwrap_or(f64::from(default));
  if !value.is_finite() || value.fract() != 0.0 || value < 1.0 || value > f64::from(u32::MAX) {
    return Err(PatternError::InvalidValue("Days must be a positive integer"));
  }
  Ok(value as u32)
}

// ============================================================
// TESTS
// ============================================================
