//! Aggregated connection state.
//!
//! Holds the latest aggregated metrics and the label the classification
//! table assigns them. The state starts empty and is only written by the
//! aggregation step of a measurement cycle.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::classification::ClassificationTable;
use crate::measurement::AggregatedMetrics;

/// Physical connection type. Never observable without a native signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Unknown,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Unknown => "unknown",
        }
    }
}

/// Point-in-time copy of the connection state, in the NetInfo shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    /// Downlink throughput (Mbps).
    #[serde(rename = "downlink")]
    pub downlink_mbps: Option<f64>,
    /// Uplink throughput (Mbps), derived from downlink.
    #[serde(rename = "uplink")]
    pub uplink_mbps: Option<f64>,
    /// Round-trip latency (ms).
    #[serde(rename = "rtt")]
    pub rtt_ms: Option<f64>,
    /// Label assigned by the classification table.
    #[serde(rename = "effectiveType")]
    pub effective_type: Option<String>,
    /// Always false.
    #[serde(rename = "saveData")]
    pub save_data: bool,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    /// When the state was last written.
    #[serde(rename = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ConnectionSnapshot {
    /// True until the first aggregation lands.
    pub fn is_empty(&self) -> bool {
        self.effective_type.is_none()
    }
}

/// Payload of a "change" event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionChange {
    pub downlink: f64,
    pub uplink: f64,
    pub rtt: f64,
    pub effective_type: String,
    /// Set for the early single-sample update of a multi-probe cycle.
    pub preliminary: bool,
}

/// The engine's single connection state.
#[derive(Debug)]
pub struct ConnectionState {
    table: ClassificationTable,
    uplink_ratio: f64,
    inner: Mutex<ConnectionSnapshot>,
}

impl ConnectionState {
    pub fn new(table: ClassificationTable, uplink_ratio: f64) -> Self {
        Self {
            table,
            uplink_ratio,
            inner: Mutex::new(ConnectionSnapshot::default()),
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.lock().clone()
    }

    /// Label the table assigns to `metrics`.
    pub fn classify(&self, metrics: &AggregatedMetrics) -> &str {
        self.table
            .classify(metrics.throughput_mbps, metrics.latency_ms)
    }

    /// Write aggregated metrics and return the change to publish.
    pub fn apply(&self, metrics: &AggregatedMetrics, preliminary: bool) -> ConnectionChange {
        let label = self.classify(metrics).to_string();
        let downlink = metrics.throughput_mbps;
        let uplink = downlink * self.uplink_ratio;
        let rtt = metrics.latency_ms;

        {
            let mut inner = self.inner.lock();
            inner.downlink_mbps = Some(downlink);
            inner.uplink_mbps = Some(uplink);
            inner.rtt_ms = Some(rtt);
            inner.effective_type = Some(label.clone());
            inner.updated_at = Some(Utc::now());
        }

        tracing::debug!(
            downlink_mbps = format!("{:.3}", downlink),
            rtt_ms = format!("{:.1}", rtt),
            effective_type = %label,
            preliminary,
            "Connection state updated"
        );

        ConnectionChange {
            downlink,
            uplink,
            rtt,
            effective_type: label,
            preliminary,
        }
    }
}
