//! Resource quantity parsing
//!
//! Converts quantity strings such as `"100m"`, `"2"` or `"512Mi"` into a
//! canonical numeric value (cores for CPU, bytes for memory).

use crate::error::{Error, Result};

/// Suffix → multiplier table
pub type SuffixTable = [(&'static str, f64)];

/// CPU suffixes (canonical unit: cores)
pub const CPU_SUFFIXES: &SuffixTable = &[("m", 1e-3), ("u", 1e-6), ("n", 1e-9)];

/// Memory and storage suffixes (canonical unit: bytes)
pub const MEMORY_SUFFIXES: &SuffixTable = &[
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
    ("m", 1e-3),
];

/// Pick the suffix table appropriate for a metric key
pub fn suffixes_for(metric: &str) -> &'static SuffixTable {
    let metric = metric.rsplit('/').next().unwrap_or(metric);
    if metric.contains("memory") || metric.contains("storage") || metric.starts_with("hugepages-")
    {
        MEMORY_SUFFIXES
    } else {
        CPU_SUFFIXES
    }
}

/// A parsed quantity in canonical base units
///
/// Always finite and non-negative.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Quantity(f64);

impl Quantity {
    /// Zero quantity
    pub const ZERO: Quantity = Quantity(0.0);

    /// The value in canonical base units
    pub fn value(self) -> f64 {
        self.0
    }
}

impl From<Quantity> for f64 {
    fn from(q: Quantity) -> Self {
        q.0
    }
}

/// Parse a quantity string using the given suffix table
///
/// The suffix must match the trailing characters exactly; when several
/// suffixes match, the longest one wins.
/// Without a matching suffix the whole string is parsed as a decimal.
pub fn parse_quantity(input: &str, suffixes: &SuffixTable) -> Result<Quantity> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_quantity(input, "empty quantity"));
    }

    let (literal, multiplier) = suffixes
        .iter()
        .filter(|(suffix, _)| !suffix.is_empty() && trimmed.ends_with(suffix))
        .max_by_key(|(suffix, _)| suffix.len())
        .map(|(suffix, mult)| (&trimmed[..trimmed.len() - suffix.len()], *mult))
        .unwrap_or((trimmed, 1.0));

    let number: f64 = literal
        .parse()
        .map_err(|_| Error::invalid_quantity(input, format!("{literal:?} is not a decimal number")))?;

    if !number.is_finite() {
        return Err(Error::invalid_quantity(input, "value is not finite"));
    }
    if number < 0.0 {
        return Err(Error::invalid_quantity(input, "value is negative"));
    }

    let value = number * multiplier;
    if !value.is_finite() {
        return Err(Error::invalid_quantity(input, "value overflows"));
    }

    // normalizes -0.0
    Ok(Quantity(value + 0.0))
}
