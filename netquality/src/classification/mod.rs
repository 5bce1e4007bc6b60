//! Connection quality classification.
//!
//! Maps an aggregated throughput/latency pair onto a discrete quality band
//! ("slow-2g", "2g", "3g", "4g", ...) using an ordered rule table.
//!
//! # Rule Semantics
//!
//! Rules are scanned in order and the first match wins. A rule matches when
//! the measured throughput is below its throughput ceiling **or** the
//! measured latency is above its latency floor. Tables must therefore be
//! authored slowest-to-fastest with tightening bounds; the last rule is the
//! catch-all for anything faster than every earlier band.
//!
//! ```text
//! throughput, latency ──► rule[0] ──► rule[1] ──► ... ──► rule[n-1] (catch-all)
//!                            │           │
//!                         match?      match?
//! ```
//!
//! # Example
//!
//! ```
//! use netquality::classification::tables;
//!
//! let table = tables::wicg();
//! assert_eq!(table.classify(0.5, 100.0), "3g");
//! assert_eq!(table.classify(2.0, 50.0), "4g");
//! ```

pub mod tables;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building a classification table.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClassificationError {
    /// A table needs at least one rule to have a catch-all band.
    #[error("Classification table must contain at least one rule")]
    EmptyTable,

    /// A rule list could not be decoded from JSON.
    #[error("Invalid classification table JSON: {0}")]
    InvalidJson(String),
}

/// One quality band in a classification table.
///
/// Both bounds are exclusive. A rule without bounds never matches during the
/// scan and only applies as the final catch-all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationRule {
    /// Quality band tag reported to consumers (e.g. "3g").
    pub label: String,

    /// Throughput ceiling in Mbps. Measurements below it fall into this band.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_throughput: Option<f64>,

    /// Latency floor in milliseconds. Measurements above it fall into this band.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_latency: Option<f64>,

    /// Free-form description of the band.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ClassificationRule {
    /// Create an unbounded rule with the given label.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            max_throughput: None,
            min_latency: None,
            description: None,
        }
    }

    /// Set the throughput ceiling (Mbps).
    pub fn with_max_throughput(mut self, mbps: f64) -> Self {
        self.max_throughput = Some(mbps);
        self
    }

    /// Set the latency floor (ms).
    pub fn with_min_latency(mut self, ms: f64) -> Self {
        self.min_latency = Some(ms);
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Check whether a measurement falls into this band.
    pub fn matches(&self, throughput_mbps: f64, latency_ms: f64) -> bool {
        let too_slow = self
            .max_throughput
            .is_some_and(|ceiling| throughput_mbps < ceiling);
        let too_laggy = self.min_latency.is_some_and(|floor| latency_ms > floor);
        too_slow || too_laggy
    }
}

/// Immutable, non-empty, ordered list of classification rules.
///
/// Cloning is cheap; the rules are shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationTable {
    rules: Arc<[ClassificationRule]>,
}

impl ClassificationTable {
    /// Build a table from rules ordered slowest to fastest.
    ///
    /// # Errors
    ///
    /// Returns [`ClassificationError::EmptyTable`] if `rules` is empty.
    pub fn new(rules: Vec<ClassificationRule>) -> Result<Self, ClassificationError> {
        if rules.is_empty() {
            return Err(ClassificationError::EmptyTable);
        }
        Ok(Self {
            rules: rules.into(),
        })
    }

    /// Decode a table from a JSON array of rules.
    ///
    /// ```
    /// use netquality::classification::ClassificationTable;
    ///
    /// let table = ClassificationTable::from_json(
    ///     r#"[{"label": "slow", "maxThroughput": 1.0}, {"label": "fast"}]"#,
    /// ).unwrap();
    /// assert_eq!(table.classify(0.5, 10.0), "slow");
    /// ```
    pub fn from_json(json: &str) -> Result<Self, ClassificationError> {
        let rules: Vec<ClassificationRule> = serde_json::from_str(json)
            .map_err(|e| ClassificationError::InvalidJson(e.to_string()))?;
        Self::new(rules)
    }

    /// The rules in scan order.
    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Always false; tables cannot be empty.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The slowest band, used for invalid measurements.
    pub fn slowest(&self) -> &ClassificationRule {
        &self.rules[0]
    }

    /// The catch-all band.
    pub fn fastest(&self) -> &ClassificationRule {
        &self.rules[self.rules.len() - 1]
    }

    /// Classify a throughput (Mbps) and latency (ms) pair.
    ///
    /// Non-finite or non-positive throughput and non-finite or negative
    /// latency are treated as worst case and map to the first rule.
    pub fn classify(&self, throughput_mbps: f64, latency_ms: f64) -> &str {
        let invalid_throughput = !throughput_mbps.is_finite() || throughput_mbps <= 0.0;
        let invalid_latency = !latency_ms.is_finite() || latency_ms < 0.0;
        if invalid_throughput || invalid_latency {
            return &self.slowest().label;
        }

        self.rules
            .iter()
            .find(|rule| rule.matches(throughput_mbps, latency_ms))
            .unwrap_or_else(|| self.fastest())
            .label
            .as_str()
    }
}
