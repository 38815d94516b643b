// * Numeric Values - Typed Metric Values and Human-Readable Thresholds
// * Comparison and formatting differ for integral and floating metric semantics

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// * Decimal and binary unit multipliers for human-readable numbers
const SI_STEP: f64 = 1000.0;
const BINARY_STEP: f64 = 1024.0;

lazy_static! {
    // * Mantissa, optional unit prefix (k, M, G, T, P with optional binary `i`), optional `B`
    static ref HUMAN_READABLE: Regex =
        Regex::new(r"^([+-]?(?:\d+(?:\.\d*)?|\.\d+))\s*(?:([kKMGTP])(i)?)?B?$").unwrap();
}

/// Declared numeric semantic of a metric field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericKind {
    Integer,
    Float,
}

/// A metric or threshold value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Integer(i64),
    Float(f64),
}

impl Number {
    /// Builds a number from a raw query value according to the field's semantic
    pub fn from_raw(value: f64, kind: NumericKind) -> Self {
        match kind {
            NumericKind::Integer if value.is_finite() => Number::Integer(value.round() as i64),
            _ => Number::Float(value),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Number::Integer(v) => v as f64,
            Number::Float(v) => v,
        }
    }

    /// Compares two numbers under the given semantic
    ///
    /// Integer semantics compare exactly when both sides are integral.
    /// Returns `None` only when a NaN is involved.
    pub fn compare(&self, other: &Number, kind: NumericKind) -> Option<Ordering> {
        match (kind, self, other) {
            (NumericKind::Integer, Number::Integer(a), Number::Integer(b)) => Some(a.cmp(b)),
            _ => self.as_f64().partial_cmp(&other.as_f64()),
        }
    }

    /// Difference `self - other` under the given semantic
    pub fn delta(&self, other: &Number, kind: NumericKind) -> Number {
        match (kind, self, other) {
            (NumericKind::Integer, Number::Integer(a), Number::Integer(b)) => {
                Number::Integer(a.saturating_sub(*b))
            }
            _ => Number::Float(self.as_f64() - other.as_f64()),
        }
    }

    /// Formats for display: integral kinds without decimals, floating kinds with two
    pub fn format(&self, kind: NumericKind) -> String {
        match kind {
            NumericKind::Integer => match *self {
                Number::Integer(v) => v.to_string(),
                Number::Float(v) => format!("{:.0}", v),
            },
            NumericKind::Float => format!("{:.2}", self.as_f64()),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Integer(v) => write!(f, "{}", v),
            Number::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Parses a number carrying a unit suffix such as `10k`, `1.5M` or `4KiB`
pub fn parse_human_readable(text: &str) -> Option<Number> {
    let caps = HUMAN_READABLE.captures(text.trim())?;
    let mantissa: f64 = caps.get(1)?.as_str().parse().ok()?;

    let step = if caps.get(3).is_some() { BINARY_STEP } else { SI_STEP };
    let exponent = match caps.get(2).map(|m| m.as_str()) {
        None => 0,
        Some("k") | Some("K") => 1,
        Some("M") => 2,
        Some("G") => 3,
        Some("T") => 4,
        Some("P") => 5,
        Some(_) => return None,
    };

    let value = mantissa * step.powi(exponent);
    Some(integral_or_float(value))
}

/// Parses a plain decimal literal (`42`, `-0.5`, `1e3`)
pub fn parse_decimal(text: &str) -> Option<Number> {
    let text = text.trim();
    if let Ok(v) = text.parse::<i64>() {
        return Some(Number::Integer(v));
    }
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(Number::Float)
}

/// Parses a threshold string: unit-suffix form first, plain decimal as fallback
pub fn parse_threshold_text(text: &str) -> Option<Number> {
    parse_human_readable(text).or_else(|| parse_decimal(text))
}

fn integral_or_float(value: f64) -> Number {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Number::Integer(value as i64)
    } else {
        Number::Float(value)
    }
}
