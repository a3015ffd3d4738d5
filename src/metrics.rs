//! Metrics sink (spec §6.3): recorded events with a monotonic timestamp.
//! The recording *backend* is out of scope (spec §1 lists "metric
//! recording sinks" as an external collaborator); this module specifies
//! the event set and the `MetricsSink` trait, plus a concrete
//! newline-delimited JSON writer as the default adapter, grounded on the
//! teacher's `monitoring::MetricsCollector` event categories.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

use crate::error::LogStoreError;
use crate::types::{NodeId, Rank, Term};

/// The complete event set of spec §6.3.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MetricEvent {
    ElectionStarted,
    ElectionWon { term: Term, duration_ms: u64 },
    PromotionStarted { rank: RankField },
    PromotionSucceeded { rank: RankField, duration_ms: u64 },
    PromotionFailed { rank: RankField, reason: String },
    SubleaderAssigned { rank: RankField, peer: NodeId },
    StepDown { reason: String },
    HeartbeatRtt { peer: NodeId, rtt_ms: f64 },
}

/// Rank serializes as its wire value (0/1) so NDJSON consumers don't need
/// to know about the Rust enum.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(transparent)]
pub struct RankField(u8);

impl From<Rank> for RankField {
    fn from(r: Rank) -> Self {
        RankField(r.as_u8())
    }
}

/// A timestamped record as actually written to the sink.
#[derive(Debug, Clone, Serialize)]
pub struct MetricRecord {
    pub node_id: NodeId,
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub event: MetricEvent,
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, node_id: NodeId, timestamp_ms: u64, event: MetricEvent);
}

/// Writes one JSON object per line, matching spec §6.3's "sink format is
/// newline-delimited records; exact encoding is implementation-free".
pub struct NdjsonMetricsSink {
    file: Mutex<File>,
}

impl NdjsonMetricsSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, LogStoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }
}

impl MetricsSink for NdjsonMetricsSink {
    fn record(&self, node_id: NodeId, timestamp_ms: u64, event: MetricEvent) {
        let record = MetricRecord { node_id, timestamp_ms, event };
        info!(target: "sraft::metrics", ?record, "metric");
        match serde_json::to_string(&record) {
            Ok(line) => {
                let mut file = self.file.lock().expect("metrics sink mutex poisoned");
                let _ = writeln!(file, "{line}");
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize metric record");
            }
        }
    }
}

/// Discards every record — used when `--metrics-path` is unset.
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn record(&self, _node_id: NodeId, _timestamp_ms: u64, _event: MetricEvent) {}
}

/// In-memory recorder for assertions in tests.
#[derive(Default)]
pub struct RecordingMetricsSink {
    pub events: Mutex<Vec<MetricRecord>>,
}

impl MetricsSink for RecordingMetricsSink {
    fn record(&self, node_id: NodeId, timestamp_ms: u64, event: MetricEvent) {
        self.events
            .lock()
            .expect("recording sink mutex poisoned")
            .push(MetricRecord { node_id, timestamp_ms, event });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndjson_sink_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.ndjson");
        let sink = NdjsonMetricsSink::create(&path).unwrap();

        sink.record(1, 100, MetricEvent::ElectionStarted);
        sink.record(
            1,
            150,
            MetricEvent::ElectionWon { term: 4, duration_ms: 50 },
        );

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("election_started"));
        assert!(lines[1].contains("election_won"));
    }

    #[test]
    fn recording_sink_captures_events_in_order() {
        let sink = RecordingMetricsSink::default();
        sink.record(1, 0, MetricEvent::StepDown { reason: "higher term".into() });
        sink.record(1, 1, MetricEvent::ElectionStarted);
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
    }
}
