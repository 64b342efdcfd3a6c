//! Synthesizer daemon configuration

use anyhow::Result;
use serde::Deserialize;

/// Configuration for one synthesis run, loaded from the environment with
/// the `SYNTH_` prefix (e.g. `SYNTH_CPU_TRACE=/data/cpu.csv`).
#[derive(Debug, Clone, Deserialize)]
pub struct SynthConfig {
    /// RNG seed for the stochastic event ordering.
    #[serde(default)]
    pub seed: u64,

    /// Sampling interval of the traces in seconds.
    #[serde(default = "default_trace_step")]
    pub trace_step_secs: i64,

    /// Readings beyond this UNIX timestamp are ignored.
    #[serde(default)]
    pub last_timestamp: Option<i64>,

    /// Run a pre-run pass to compute resource ceilings before the real
    /// synthesis instead of loading them from summary files.
    #[serde(default)]
    pub pre_run: bool,

    #[serde(default)]
    pub cpu_trace: Option<String>,
    #[serde(default)]
    pub cpu_mapping: Option<String>,
    /// Comma-separated alternating down/up UNIX timestamps.
    #[serde(default)]
    pub cpu_downtime: Option<String>,

    #[serde(default)]
    pub gpu_trace: Option<String>,
    #[serde(default)]
    pub gpu_mapping: Option<String>,

    #[serde(default)]
    pub mem_trace: Option<String>,
    #[serde(default)]
    pub mem_mapping: Option<String>,
    #[serde(default)]
    pub mem_downtime: Option<String>,

    /// Per-session resource ceiling summary files.
    #[serde(default)]
    pub max_session_cpu_file: Option<String>,
    #[serde(default)]
    pub max_session_mem_file: Option<String>,
    #[serde(default)]
    pub max_session_gpu_file: Option<String>,

    /// Per-training-interval resource ceiling summary files.
    #[serde(default)]
    pub max_training_cpu_file: Option<String>,
    #[serde(default)]
    pub max_training_mem_file: Option<String>,
    #[serde(default)]
    pub max_training_gpu_file: Option<String>,

    /// Derate GPU reservations by their peak utilization.
    #[serde(default)]
    pub adjust_gpu_reservations: bool,

    /// JSON workload template; when set, trace files are ignored and the
    /// template sequencer produces the events.
    #[serde(default)]
    pub template_file: Option<String>,
}

fn default_trace_step() -> i64 {
    60
}

impl SynthConfig {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("SYNTH"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
