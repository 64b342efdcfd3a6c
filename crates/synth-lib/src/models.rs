//! Workload templates and resource-ceiling data
//!
//! A template describes a workload explicitly: sessions with start/stop
//! ticks and training intervals with utilization magnitudes. The
//! [`MaxUtilizationProvider`] supplies the lifetime and per-training
//! resource ceilings attached to session events; it can be assembled from a
//! pre-run pass or loaded from summary files.

use crate::driver::SessionMaxTracker;
use crate::error::SynthesisError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

/// One training interval within a session template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingTemplate {
    pub start_tick: i64,
    pub duration_ticks: i64,
    /// CPU utilization during the interval, 0-100 per vCPU.
    pub cpu_util: f64,
    /// Memory usage in GB during the interval.
    pub memory_gb: f64,
    /// Per-device GPU utilization; the length is the device count.
    #[serde(default)]
    pub gpu_util: Vec<f64>,
    /// VRAM usage in GB during the interval.
    #[serde(default)]
    pub vram_gb: f64,
}

impl TrainingTemplate {
    pub fn num_gpus(&self) -> usize {
        self.gpu_util.len()
    }

    /// Number of devices with non-zero requested utilization.
    pub fn active_gpus(&self) -> u32 {
        self.gpu_util.iter().filter(|util| **util > 0.0).count() as u32
    }

    pub fn end_tick(&self) -> i64 {
        self.start_tick + self.duration_ticks
    }
}

/// One session in a workload template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTemplate {
    pub id: String,
    pub max_cpus: f64,
    pub max_memory_gb: f64,
    pub max_gpus: u32,
    #[serde(default)]
    pub max_vram_gb: f64,
    pub start_tick: i64,
    pub stop_tick: i64,
    #[serde(default)]
    pub trainings: Vec<TrainingTemplate>,
}

/// Lifetime and per-training resource ceilings per session, consumed by the
/// synthesizer when building session event payloads.
#[derive(Debug, Clone, Default)]
pub struct MaxUtilizationProvider {
    pub session_cpus: HashMap<String, f64>,
    pub session_memory_gb: HashMap<String, f64>,
    pub session_gpus: HashMap<String, u32>,
    pub session_vram_gb: HashMap<String, f64>,
    pub training_cpus: HashMap<String, Vec<f64>>,
    pub training_memory_gb: HashMap<String, Vec<f64>>,
    pub training_gpus: HashMap<String, Vec<u32>>,
}

/// Rounds `x` up to the next multiple of `unit`.
pub(crate) fn round_up(x: f64, unit: f64) -> f64 {
    (x / unit).ceil() * unit
}

/// Maximum number of devices a session is expected to use; out-of-range
/// values in summary files are reported but kept.
const MAX_EXPECTED_GPUS: u32 = 8;

fn derated_gpus(num_gpus: f64, max_utilization: f64) -> u32 {
    // A session that peaked at e.g. 250% utilization across 8 devices only
    // ever needed 3; sessions are charged per device, so never go below 1.
    let derated = round_up(max_utilization / 100.0, 1.0) as u32;
    let gpus = derated.min(num_gpus as u32).max(1);
    if gpus > MAX_EXPECTED_GPUS {
        warn!(
            gpus,
            num_gpus, max_utilization, "unexpected device count derived from summary file"
        );
    }
    gpus
}

#[derive(Debug, Deserialize)]
struct SessionMaxCpuRecord {
    session_id: String,
    max_cpu_utilization: f64,
}

#[derive(Debug, Deserialize)]
struct SessionMaxMemoryRecord {
    session_id: String,
    max_memory_bytes: f64,
}

#[derive(Debug, Deserialize)]
struct SessionMaxGpuRecord {
    session_id: String,
    max_gpu_utilization: f64,
    num_gpus: f64,
}

#[derive(Debug, Deserialize)]
struct TrainingMaxCpuRecord {
    session_id: String,
    #[allow(dead_code)]
    seq: u32,
    max_cpu_utilization: f64,
}

#[derive(Debug, Deserialize)]
struct TrainingMaxMemoryRecord {
    session_id: String,
    #[allow(dead_code)]
    seq: u32,
    max_mem_bytes: f64,
}

#[derive(Debug, Deserialize)]
struct TrainingMaxGpuRecord {
    session_id: String,
    #[allow(dead_code)]
    seq: u32,
    max_gpu_utilization: f64,
    num_gpus: f64,
}

impl MaxUtilizationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the provider from a workload template: the session envelope
    /// comes from the session maxima, the per-training ceilings from each
    /// training interval in order.
    pub fn from_templates(templates: &[SessionTemplate]) -> Self {
        let mut provider = Self::new();
        for session in templates {
            provider
                .session_cpus
                .insert(session.id.clone(), session.max_cpus);
            provider
                .session_memory_gb
                .insert(session.id.clone(), session.max_memory_gb);
            provider
                .session_gpus
                .insert(session.id.clone(), session.max_gpus);
            provider
                .session_vram_gb
                .insert(session.id.clone(), session.max_vram_gb);

            if session.trainings.is_empty() {
                continue;
            }
            provider.training_cpus.insert(
                session.id.clone(),
                session.trainings.iter().map(|t| t.cpu_util).collect(),
            );
            provider.training_memory_gb.insert(
                session.id.clone(),
                session.trainings.iter().map(|t| t.memory_gb).collect(),
            );
            provider.training_gpus.insert(
                session.id.clone(),
                session
                    .trainings
                    .iter()
                    .map(|t| t.num_gpus() as u32)
                    .collect(),
            );
        }
        provider
    }

    /// Builds the provider from the maxima recorded by a pre-run pass of
    /// the trace drivers. Raw trace units are converted to the session
    /// envelope units: CPU percentage to whole vCPUs, memory bytes to GB.
    pub fn from_pre_run(
        cpu: Option<&SessionMaxTracker>,
        gpu: Option<&SessionMaxTracker>,
        memory: Option<&SessionMaxTracker>,
    ) -> Self {
        let mut provider = Self::new();

        if let Some(tracker) = cpu {
            for (session, max) in tracker.session_maxes() {
                provider
                    .session_cpus
                    .insert(session.clone(), cpus_from_utilization(max));
            }
            for (session, maxes) in tracker.training_maxes() {
                provider.training_cpus.insert(
                    session.clone(),
                    maxes.iter().map(|m| cpus_from_utilization(*m)).collect(),
                );
            }
        }

        if let Some(tracker) = memory {
            for (session, max) in tracker.session_maxes() {
                provider
                    .session_memory_gb
                    .insert(session.clone(), gb_from_bytes(max));
            }
            for (session, maxes) in tracker.training_maxes() {
                provider.training_memory_gb.insert(
                    session.clone(),
                    maxes.iter().map(|m| gb_from_bytes(*m)).collect(),
                );
            }
        }

        if let Some(tracker) = gpu {
            for (session, devices) in tracker.session_devices() {
                provider.session_gpus.insert(session.clone(), devices);
                // No VRAM column in the traces this was tuned against;
                // assume 8 GB devices at 75% occupancy.
                provider
                    .session_vram_gb
                    .insert(session.clone(), (f64::from(devices) * 8.0 * 0.75).ceil());
            }
            for (session, devices) in tracker.training_devices() {
                provider.training_gpus.insert(session.clone(), devices);
            }
        }

        provider
    }

    /// True when no map knows the given session.
    pub fn is_unknown_session(&self, session_id: &str) -> bool {
        !self.session_cpus.contains_key(session_id)
            && !self.session_memory_gb.contains_key(session_id)
            && !self.session_gpus.contains_key(session_id)
    }

    /// Loads per-session max CPU from a `session_id,max_cpu_utilization`
    /// summary file. Utilization is rounded up to whole vCPUs.
    pub fn load_session_cpus(&mut self, path: &Path) -> Result<(), SynthesisError> {
        let mut reader = csv::Reader::from_path(path)?;
        for record in reader.deserialize() {
            let record: SessionMaxCpuRecord = record?;
            self.session_cpus.insert(
                record.session_id,
                cpus_from_utilization(record.max_cpu_utilization),
            );
        }
        Ok(())
    }

    /// Loads per-session max memory from a `session_id,max_memory_bytes`
    /// summary file.
    pub fn load_session_memory(&mut self, path: &Path) -> Result<(), SynthesisError> {
        let mut reader = csv::Reader::from_path(path)?;
        for record in reader.deserialize() {
            let record: SessionMaxMemoryRecord = record?;
            self.session_memory_gb
                .insert(record.session_id, gb_from_bytes(record.max_memory_bytes));
        }
        Ok(())
    }

    /// Loads per-session device counts from a
    /// `session_id,max_gpu_utilization,num_gpus` summary file. With
    /// `adjust`, the reservation is derated by the peak utilization.
    pub fn load_session_gpus(&mut self, path: &Path, adjust: bool) -> Result<(), SynthesisError> {
        let mut reader = csv::Reader::from_path(path)?;
        for record in reader.deserialize() {
            let record: SessionMaxGpuRecord = record?;
            let gpus = if adjust {
                derated_gpus(record.num_gpus, record.max_gpu_utilization)
            } else {
                record.num_gpus as u32
            };
            self.session_gpus.insert(record.session_id, gpus);
        }
        Ok(())
    }

    /// Loads per-training max CPU from a
    /// `session_id,seq,max_cpu_utilization` summary file. Rows must be in
    /// training order per session.
    pub fn load_training_cpus(&mut self, path: &Path) -> Result<(), SynthesisError> {
        let mut reader = csv::Reader::from_path(path)?;
        for record in reader.deserialize() {
            let record: TrainingMaxCpuRecord = record?;
            self.training_cpus
                .entry(record.session_id)
                .or_default()
                .push(cpus_from_utilization(record.max_cpu_utilization));
        }
        Ok(())
    }

    /// Loads per-training max memory from a `session_id,seq,max_mem_bytes`
    /// summary file.
    pub fn load_training_memory(&mut self, path: &Path) -> Result<(), SynthesisError> {
        let mut reader = csv::Reader::from_path(path)?;
        for record in reader.deserialize() {
            let record: TrainingMaxMemoryRecord = record?;
            self.training_memory_gb
                .entry(record.session_id)
                .or_default()
                .push(gb_from_bytes(record.max_mem_bytes));
        }
        Ok(())
    }

    /// Loads per-training device counts from a
    /// `session_id,seq,max_gpu_utilization,num_gpus` summary file.
    pub fn load_training_gpus(&mut self, path: &Path, adjust: bool) -> Result<(), SynthesisError> {
        let mut reader = csv::Reader::from_path(path)?;
        for record in reader.deserialize() {
            let record: TrainingMaxGpuRecord = record?;
            let gpus = if adjust {
                derated_gpus(record.num_gpus, record.max_gpu_utilization)
            } else {
                record.num_gpus as u32
            };
            self.training_gpus
                .entry(record.session_id)
                .or_default()
                .push(gpus);
        }
        Ok(())
    }
}

/// Whole vCPUs required for a peak utilization percentage (100% = 1 vCPU),
/// never below one.
fn cpus_from_utilization(max_utilization: f64) -> f64 {
    (round_up(max_utilization, 100.0) / 100.0).max(1.0)
}

/// Whole GB required for a peak byte count, never below one.
fn gb_from_bytes(bytes: f64) -> f64 {
    (bytes / 1.0e9).ceil().max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpus_from_utilization_rounds_up() {
        assert_eq!(cpus_from_utilization(8.3), 1.0);
        assert_eq!(cpus_from_utilization(103.57), 2.0);
        assert_eq!(cpus_from_utilization(200.0), 2.0);
        assert_eq!(cpus_from_utilization(0.0), 1.0);
    }

    #[test]
    fn test_gb_from_bytes_rounds_up() {
        assert_eq!(gb_from_bytes(1.0), 1.0);
        assert_eq!(gb_from_bytes(1.5e9), 2.0);
        assert_eq!(gb_from_bytes(4.0e9), 4.0);
    }

    #[test]
    fn test_derated_gpus_clamps_to_at_least_one() {
        assert_eq!(derated_gpus(8.0, 0.0), 1);
        assert_eq!(derated_gpus(8.0, 250.0), 3);
        assert_eq!(derated_gpus(2.0, 800.0), 2);
    }

    #[test]
    fn test_from_templates_populates_all_maps() {
        let templates = vec![SessionTemplate {
            id: "session-1".to_string(),
            max_cpus: 4.0,
            max_memory_gb: 16.0,
            max_gpus: 2,
            max_vram_gb: 8.0,
            start_tick: 0,
            stop_tick: 10,
            trainings: vec![TrainingTemplate {
                start_tick: 2,
                duration_ticks: 3,
                cpu_util: 50.0,
                memory_gb: 4.0,
                gpu_util: vec![75.0, 25.0],
                vram_gb: 4.0,
            }],
        }];

        let provider = MaxUtilizationProvider::from_templates(&templates);

        assert_eq!(provider.session_cpus["session-1"], 4.0);
        assert_eq!(provider.session_gpus["session-1"], 2);
        assert_eq!(provider.training_cpus["session-1"], vec![50.0]);
        assert_eq!(provider.training_gpus["session-1"], vec![2]);
        assert!(!provider.is_unknown_session("session-1"));
        assert!(provider.is_unknown_session("session-2"));
    }
}
