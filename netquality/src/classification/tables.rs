//! Bundled classification tables.
//!
//! Tables are plain functions so callers pick one explicitly; the engine
//! never falls back to a table on its own.

use super::{ClassificationRule, ClassificationTable};

/// Preset name for [`wicg`].
pub const WICG: &str = "wicg";

/// Effective connection types from the WICG Network Information draft.
///
/// | Label    | Throughput ceiling | Latency floor |
/// |----------|--------------------|---------------|
/// | slow-2g  | 0.05 Mbps          | 1400 ms       |
/// | 2g       | 0.07 Mbps          | 270 ms        |
/// | 3g       | 0.7 Mbps           | -             |
/// | 4g       | -                  | -             |
pub fn wicg() -> ClassificationTable {
    let rules = vec![
        ClassificationRule::new("slow-2g")
            .with_max_throughput(0.05)
            .with_min_latency(1400.0)
            .with_description("Text-only pages; images and video rarely load"),
        ClassificationRule::new("2g")
            .with_max_throughput(0.07)
            .with_min_latency(270.0)
            .with_description("Small images load; video is impractical"),
        ClassificationRule::new("3g")
            .with_max_throughput(0.7)
            .with_description("High resolution images load; low resolution video plays"),
        ClassificationRule::new("4g").with_description("HD video and real-time media"),
    ];

    // Non-empty literal; construction cannot fail.
    ClassificationTable {
        rules: rules.into(),
    }
}

/// Look up a bundled table by its preset name (case-insensitive).
pub fn by_name(name: &str) -> Option<ClassificationTable> {
    match name.trim().to_lowercase().as_str() {
        WICG => Some(wicg()),
        _ => None,
    }
}
