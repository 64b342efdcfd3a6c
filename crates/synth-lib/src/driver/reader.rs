//! Trace file parsing
//!
//! Traces are delimited tabular files with named columns. Timestamps are
//! seconds since the epoch or an RFC 3339 date-time. GPU rows additionally
//! carry a device index and an optional VRAM column. A pod map file (single
//! `key` column) assigns session identifiers to numeric pod indices by row
//! order.

use crate::error::SynthesisError;
use crate::events::ResourceKind;
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer};
use std::path::Path;
use tracing::warn;

/// One utilization reading, normalized across resource kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub pod_idx: usize,
    pub value: f64,
    /// Physical device index (GPU only).
    pub device: u32,
    /// VRAM usage in GB (GPU only).
    pub vram_gb: f64,
}

impl Reading {
    pub fn new(timestamp: DateTime<Utc>, pod_idx: usize, value: f64) -> Self {
        Self {
            timestamp,
            pod_idx,
            value,
            device: 0,
            vram_gb: 0.0,
        }
    }

    pub fn with_device(mut self, device: u32, vram_gb: f64) -> Self {
        self.device = device;
        self.vram_gb = vram_gb;
        self
    }
}

/// Accepts either epoch seconds or an RFC 3339 date-time in the timestamp
/// column.
fn de_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(secs) = raw.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| de::Error::custom(format!("timestamp {secs} out of range")));
    }
    if let Ok(secs) = raw.parse::<f64>() {
        return DateTime::<Utc>::from_timestamp(secs as i64, 0)
            .ok_or_else(|| de::Error::custom(format!("timestamp {secs} out of range")));
    }
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| de::Error::custom(format!("unparseable timestamp {raw:?}: {e}")))
}

#[derive(Debug, Deserialize)]
pub(crate) struct CpuRecord {
    #[serde(deserialize_with = "de_timestamp")]
    timestamp: DateTime<Utc>,
    pod: usize,
    value: f64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GpuRecord {
    #[serde(deserialize_with = "de_timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "exported_pod")]
    pod: usize,
    gpu: u32,
    value: f64,
    #[serde(default)]
    vram: f64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MemoryRecord {
    #[serde(deserialize_with = "de_timestamp")]
    timestamp: DateTime<Utc>,
    pod: usize,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct PodMapRecord {
    key: String,
}

/// Streaming iterator over the readings of one trace file, normalized
/// across resource kinds. Yields `Err` for unparseable rows so callers can
/// skip them without aborting the drive.
pub(crate) enum ReadingIter {
    Cpu(csv::DeserializeRecordsIntoIter<std::fs::File, CpuRecord>),
    Gpu(csv::DeserializeRecordsIntoIter<std::fs::File, GpuRecord>),
    Memory(csv::DeserializeRecordsIntoIter<std::fs::File, MemoryRecord>),
}

impl Iterator for ReadingIter {
    type Item = Result<Reading, csv::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            ReadingIter::Cpu(records) => records
                .next()
                .map(|r| r.map(|r| Reading::new(r.timestamp, r.pod, r.value))),
            ReadingIter::Gpu(records) => records.next().map(|r| {
                r.map(|r| Reading::new(r.timestamp, r.pod, r.value).with_device(r.gpu, r.vram))
            }),
            ReadingIter::Memory(records) => records
                .next()
                .map(|r| r.map(|r| Reading::new(r.timestamp, r.pod, r.value))),
        }
    }
}

/// Opens one trace file for streaming.
pub(crate) fn open_trace(kind: ResourceKind, path: &Path) -> Result<ReadingIter, SynthesisError> {
    let reader = csv::Reader::from_path(path)?;
    Ok(match kind {
        ResourceKind::Cpu => ReadingIter::Cpu(reader.into_deserialize()),
        ResourceKind::Gpu => ReadingIter::Gpu(reader.into_deserialize()),
        ResourceKind::Memory => ReadingIter::Memory(reader.into_deserialize()),
    })
}

/// Loads a pod map file: row N maps pod index N to the session id in the
/// `key` column.
pub fn load_pod_map(path: &Path) -> Result<Vec<String>, SynthesisError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut map = Vec::new();
    for record in reader.deserialize::<PodMapRecord>() {
        map.push(record?.key);
    }
    Ok(map)
}

/// Parses a downtime specification: a comma-separated list of UNIX
/// timestamps alternating "became down" / "became up".
pub fn parse_downtimes(spec: &str) -> Result<Vec<i64>, SynthesisError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(Vec::new());
    }
    spec.split(',')
        .map(|part| {
            part.trim().parse::<i64>().map_err(|e| {
                SynthesisError::InvalidConfiguration(format!(
                    "bad downtime timestamp {part:?}: {e}"
                ))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn collect(kind: ResourceKind, path: &Path) -> Vec<Reading> {
        open_trace(kind, path)
            .unwrap()
            .filter_map(|record| record.ok())
            .collect()
    }

    #[test]
    fn test_cpu_trace_parsing() {
        let file = write_temp("timestamp,pod,value\n60,0,12.5\n120,1,0.0\n");
        let readings = collect(ResourceKind::Cpu, file.path());

        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].pod_idx, 0);
        assert_eq!(readings[0].value, 12.5);
        assert_eq!(readings[0].timestamp.timestamp(), 60);
    }

    #[test]
    fn test_gpu_trace_parsing_with_vram() {
        let file = write_temp(
            "timestamp,exported_pod,gpu,value,vram\n60,0,0,55.0,12.0\n60,0,1,45.0,8.0\n",
        );
        let readings = collect(ResourceKind::Gpu, file.path());

        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].device, 0);
        assert_eq!(readings[1].device, 1);
        assert_eq!(readings[0].vram_gb, 12.0);
    }

    #[test]
    fn test_rfc3339_timestamps_accepted() {
        let file = write_temp("timestamp,pod,value\n1970-01-01T00:01:00Z,0,5.0\n");
        let readings = collect(ResourceKind::Cpu, file.path());

        assert_eq!(readings[0].timestamp.timestamp(), 60);
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let file = write_temp("timestamp,pod,value\n60,0,1.0\nnot-a-time,x,y\n120,0,2.0\n");
        let readings = collect(ResourceKind::Cpu, file.path());

        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1].value, 2.0);
    }

    #[test]
    fn test_pod_map_loading() {
        let file = write_temp("key\nsession-a\nsession-b\n");
        let map = load_pod_map(file.path()).unwrap();

        assert_eq!(map, vec!["session-a".to_string(), "session-b".to_string()]);
    }

    #[test]
    fn test_downtime_parsing() {
        assert_eq!(parse_downtimes("").unwrap(), Vec::<i64>::new());
        assert_eq!(parse_downtimes("100,200").unwrap(), vec![100, 200]);
        assert!(parse_downtimes("100,banana").is_err());
    }
}
