//! Engine configuration.
//!
//! Configuration is resolved once at construction and never changes for the
//! lifetime of an engine. Callers describe only what they want to change via
//! [`EngineOptions`]; [`EngineOptions::resolve`] merges those overrides over
//! the documented defaults and validates the result into an [`EngineConfig`].
//!
//! The classification table is the one setting with no default. It must be
//! passed explicitly, either as a [`ClassificationTable`] value or by naming
//! a bundled preset in an INI file.
//!
//! # Example Configuration (INI)
//!
//! ```ini
//! [network_quality]
//! origin = https://speed.cloudflare.com
//! probe_count = 3
//! base_payload_bytes = 20000
//! payload_growth_factor = 5
//! periodic_enabled = true
//! periodic_interval_ms = 300000
//! classification = wicg
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use thiserror::Error;

use crate::classification::{tables, ClassificationTable};

/// INI section holding engine settings.
pub const INI_SECTION: &str = "network_quality";

/// Default probe endpoint origin.
pub const DEFAULT_ORIGIN: &str = "https://speed.cloudflare.com";

/// Default estimate of server processing time per request (ms).
pub const DEFAULT_SERVER_PROCESSING_TIME_MS: f64 = 10.0;

/// Default fraction added to payload size for header bytes.
pub const DEFAULT_HEADER_OVERHEAD_FRACTION: f64 = 0.02;

/// Default number of probes per measurement cycle.
pub const DEFAULT_PROBE_COUNT: usize = 3;

/// Default payload size of the first download probe (bytes).
pub const DEFAULT_BASE_PAYLOAD_BYTES: u64 = 20_000;

/// Default growth factor between consecutive probe payloads.
pub const DEFAULT_PAYLOAD_GROWTH_FACTOR: f64 = 5.0;

/// Default minimum time between periodic measurement cycles.
pub const DEFAULT_PERIODIC_INTERVAL: Duration = Duration::from_secs(300);

/// Errors raised while building or loading configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// A resolved field has an unusable value.
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// An INI value could not be parsed.
    #[error("Invalid value for '{key}': '{value}'")]
    InvalidValue { key: String, value: String },

    /// The INI file could not be read.
    #[error("Failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    /// The INI text is malformed.
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// The named classification preset does not exist.
    #[error("Unknown classification preset '{0}'")]
    UnknownPreset(String),
}

/// Empirical tuning constants for probing and aggregation.
///
/// These have no derivation beyond observed behaviour; they are exposed so
/// they can be adjusted rather than re-derived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeTuning {
    /// Pause between the latency probe and the download probe of one sample.
    pub settle_delay: Duration,

    /// Pause between consecutive samples in a cycle.
    pub inter_probe_delay: Duration,

    /// Share of wall-clock time attributed to latency for zero-byte probes
    /// when no resource timing is available.
    pub latency_only_fraction: f64,

    /// Share of wall-clock time attributed to latency for download probes
    /// when no resource timing is available.
    pub download_latency_fraction: f64,

    /// Ceiling on the latency share of a download probe (ms).
    pub download_latency_cap_ms: f64,

    /// Floor applied to derived durations (ms).
    pub min_duration_ms: f64,

    /// Uplink estimate as a fraction of downlink.
    pub uplink_ratio: f64,

    /// How often the scheduler checks whether a periodic cycle is due.
    pub housekeeping_interval: Duration,
}

impl Default for ProbeTuning {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(50),
            inter_probe_delay: Duration::from_millis(200),
            latency_only_fraction: 0.9,
            download_latency_fraction: 0.3,
            download_latency_cap_ms: 200.0,
            min_duration_ms: 1.0,
            uplink_ratio: 0.5,
            housekeeping_interval: Duration::from_secs(10),
        }
    }
}

/// Fully resolved engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Probe endpoint origin, without trailing slash.
    pub origin: String,

    /// Server processing time estimate (ms), used when the response carries
    /// no `server-timing` duration.
    pub server_processing_time_ms: f64,

    /// Fraction added to requested bytes to account for headers when the
    /// transferred size is not reported.
    pub header_overhead_fraction: f64,

    /// Probes per measurement cycle.
    pub probe_count: usize,

    /// Payload size of probe 0 (bytes).
    pub base_payload_bytes: u64,

    /// Payload size multiplier between consecutive probes.
    pub payload_growth_factor: f64,

    /// Whether the periodic scheduler runs.
    pub periodic_enabled: bool,

    /// Minimum time between periodic cycles.
    pub periodic_interval: Duration,

    /// Rule table mapping metrics to quality labels.
    pub classification: ClassificationTable,

    /// Empirical tuning constants.
    pub tuning: ProbeTuning,
}

impl EngineConfig {
    /// Create a configuration with default settings and the given table.
    pub fn new(classification: ClassificationTable) -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            server_processing_time_ms: DEFAULT_SERVER_PROCESSING_TIME_MS,
            header_overhead_fraction: DEFAULT_HEADER_OVERHEAD_FRACTION,
            probe_count: DEFAULT_PROBE_COUNT,
            base_payload_bytes: DEFAULT_BASE_PAYLOAD_BYTES,
            payload_growth_factor: DEFAULT_PAYLOAD_GROWTH_FACTOR,
            periodic_enabled: false,
            periodic_interval: DEFAULT_PERIODIC_INTERVAL,
            classification,
            tuning: ProbeTuning::default(),
        }
    }

    /// Payload size for probe `index`: `base × growth^index`, rounded.
    pub fn payload_size(&self, index: usize) -> u64 {
        let exponent = i32::try_from(index).unwrap_or(i32::MAX);
        let size = self.base_payload_bytes as f64 * self.payload_growth_factor.powi(exponent);
        if size.is_finite() && size < u64::MAX as f64 {
            size.round() as u64
        } else {
            u64::MAX
        }
    }

    /// Check every field for a usable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };

        if self.origin.is_empty() {
            return Err(invalid("origin", "must not be empty"));
        }
        if self.origin.ends_with('/') {
            return Err(invalid("origin", "must not end with '/'"));
        }
        if !self.server_processing_time_ms.is_finite() || self.server_processing_time_ms < 0.0 {
            return Err(invalid(
                "server_processing_time_ms",
                "must be a non-negative number",
            ));
        }
        if !self.header_overhead_fraction.is_finite() || self.header_overhead_fraction < 0.0 {
            return Err(invalid(
                "header_overhead_fraction",
                "must be a non-negative number",
            ));
        }
        if self.probe_count == 0 {
            return Err(invalid("probe_count", "must be at least 1"));
        }
        if self.base_payload_bytes == 0 {
            return Err(invalid("base_payload_bytes", "must be at least 1"));
        }
        if !self.payload_growth_factor.is_finite() || self.payload_growth_factor < 1.0 {
            return Err(invalid("payload_growth_factor", "must be at least 1.0"));
        }
        if self.periodic_enabled && self.periodic_interval.is_zero() {
            return Err(invalid("periodic_interval", "must be non-zero"));
        }
        if self.tuning.housekeeping_interval.is_zero() {
            return Err(invalid("housekeeping_interval", "must be non-zero"));
        }
        let fraction_ok = |f: f64| f.is_finite() && (0.0..=1.0).contains(&f);
        if !fraction_ok(self.tuning.latency_only_fraction)
            || !fraction_ok(self.tuning.download_latency_fraction)
        {
            return Err(invalid("tuning", "latency fractions must be within 0..=1"));
        }
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.tuning.download_latency_cap_ms) {
            return Err(invalid(
                "download_latency_cap_ms",
                "must be a positive number",
            ));
        }
        if !positive(self.tuning.min_duration_ms) {
            return Err(invalid("min_duration_ms", "must be a positive number"));
        }
        if !self.tuning.uplink_ratio.is_finite() || self.tuning.uplink_ratio < 0.0 {
            return Err(invalid("uplink_ratio", "must be a non-negative number"));
        }
        Ok(())
    }
}

/// Caller overrides merged over the defaults at construction.
///
/// Every field is optional; unset fields take the documented default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOptions {
    pub origin: Option<String>,
    pub server_processing_time_ms: Option<f64>,
    pub header_overhead_fraction: Option<f64>,
    pub probe_count: Option<usize>,
    pub base_payload_bytes: Option<u64>,
    pub payload_growth_factor: Option<f64>,
    pub periodic_enabled: Option<bool>,
    pub periodic_interval: Option<Duration>,
    pub tuning: Option<ProbeTuning>,
    /// Bundled table preset named in a config file.
    pub classification_preset: Option<String>,
}

impl EngineOptions {
    /// Create empty overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the probe endpoint origin. A trailing slash is removed.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        let origin: String = origin.into();
        self.origin = Some(origin.trim_end_matches('/').to_string());
        self
    }

    /// Set the server processing time estimate (ms).
    pub fn with_server_processing_time_ms(mut self, ms: f64) -> Self {
        self.server_processing_time_ms = Some(ms);
        self
    }

    /// Set the header overhead fraction.
    pub fn with_header_overhead_fraction(mut self, fraction: f64) -> Self {
        self.header_overhead_fraction = Some(fraction);
        self
    }

    /// Set the number of probes per cycle.
    pub fn with_probe_count(mut self, count: usize) -> Self {
        self.probe_count = Some(count);
        self
    }

    /// Set the first probe's payload size.
    pub fn with_base_payload_bytes(mut self, bytes: u64) -> Self {
        self.base_payload_bytes = Some(bytes);
        self
    }

    /// Set the payload growth factor.
    pub fn with_payload_growth_factor(mut self, factor: f64) -> Self {
        self.payload_growth_factor = Some(factor);
        self
    }

    /// Enable periodic measurement with the given minimum interval.
    pub fn with_periodic(mut self, interval: Duration) -> Self {
        self.periodic_enabled = Some(true);
        self.periodic_interval = Some(interval);
        self
    }

    /// Override the tuning constants.
    pub fn with_tuning(mut self, tuning: ProbeTuning) -> Self {
        self.tuning = Some(tuning);
        self
    }

    /// Merge these overrides over the defaults and validate.
    pub fn resolve(self, classification: ClassificationTable) -> Result<EngineConfig, ConfigError> {
        let defaults = EngineConfig::new(classification);
        let config = EngineConfig {
            origin: self.origin.unwrap_or(defaults.origin),
            server_processing_time_ms: self
                .server_processing_time_ms
                .unwrap_or(defaults.server_processing_time_ms),
            header_overhead_fraction: self
                .header_overhead_fraction
                .unwrap_or(defaults.header_overhead_fraction),
            probe_count: self.probe_count.unwrap_or(defaults.probe_count),
            base_payload_bytes: self
                .base_payload_bytes
                .unwrap_or(defaults.base_payload_bytes),
            payload_growth_factor: self
                .payload_growth_factor
                .unwrap_or(defaults.payload_growth_factor),
            periodic_enabled: self.periodic_enabled.unwrap_or(defaults.periodic_enabled),
            periodic_interval: self.periodic_interval.unwrap_or(defaults.periodic_interval),
            classification: defaults.classification,
            tuning: self.tuning.unwrap_or(defaults.tuning),
        };
        config.validate()?;
        Ok(config)
    }

    /// Resolve using the preset named by `classification_preset`.
    ///
    /// Fails if no preset was named or the name is unknown.
    pub fn resolve_with_preset(self) -> Result<EngineConfig, ConfigError> {
        let table = self
            .classification_table()?
            .ok_or(ConfigError::Invalid {
                field: "classification",
                reason: "no classification table configured".to_string(),
            })?;
        self.resolve(table)
    }

    /// The bundled table named by `classification_preset`, if any.
    pub fn classification_table(&self) -> Result<Option<ClassificationTable>, ConfigError> {
        match &self.classification_preset {
            None => Ok(None),
            Some(name) => tables::by_name(name)
                .map(Some)
                .ok_or_else(|| ConfigError::UnknownPreset(name.clone())),
        }
    }

    /// Load overrides from an INI file.
    pub fn from_ini_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    /// Load overrides from INI text.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let Some(section) = ini.section(Some(INI_SECTION)) else {
            tracing::debug!(section = INI_SECTION, "Config section absent, using defaults");
            return Ok(Self::default());
        };

        let mut options = Self {
            origin: section
                .get("origin")
                .map(|s| s.trim().trim_end_matches('/').to_string()),
            server_processing_time_ms: parse_key(section, "server_processing_time_ms")?,
            header_overhead_fraction: parse_key(section, "header_overhead_fraction")?,
            probe_count: parse_key(section, "probe_count")?,
            base_payload_bytes: parse_key(section, "base_payload_bytes")?,
            payload_growth_factor: parse_key(section, "payload_growth_factor")?,
            periodic_enabled: parse_bool_key(section, "periodic_enabled")?,
            periodic_interval: parse_key::<u64>(section, "periodic_interval_ms")?
                .map(Duration::from_millis),
            tuning: None,
            classification_preset: section.get("classification").map(|s| s.trim().to_string()),
        };

        let settle = parse_key::<u64>(section, "settle_delay_ms")?;
        let gap = parse_key::<u64>(section, "inter_probe_delay_ms")?;
        let uplink = parse_key::<f64>(section, "uplink_ratio")?;
        let housekeeping = parse_key::<u64>(section, "housekeeping_interval_ms")?;
        if settle.is_some() || gap.is_some() || uplink.is_some() || housekeeping.is_some() {
            let mut tuning = ProbeTuning::default();
            if let Some(ms) = settle {
                tuning.settle_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = gap {
                tuning.inter_probe_delay = Duration::from_millis(ms);
            }
            if let Some(ratio) = uplink {
                tuning.uplink_ratio = ratio;
            }
            if let Some(ms) = housekeeping {
                tuning.housekeeping_interval = Duration::from_millis(ms);
            }
            options.tuning = Some(tuning);
        }

        Ok(options)
    }
}

fn parse_key<T: FromStr>(section: &Properties, key: &str) -> Result<Option<T>, ConfigError> {
    match section.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.to_string(),
            }),
    }
}

fn parse_bool_key(section: &Properties, key: &str) -> Result<Option<bool>, ConfigError> {
    match section.get(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(Some(true)),
            "false" | "no" | "off" | "0" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.to_string(),
            }),
        },
    }
}
