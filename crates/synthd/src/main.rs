//! Workload synthesizer daemon
//!
//! Wires configuration, logging and the synthesis engine together: trace
//! drivers (or the template sequencer) feed the event-merging synthesizer,
//! and the resulting session lifecycle events are written to stdout as JSON
//! lines for a downstream scheduler or simulator to consume.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use synth_lib::{
    parse_downtimes, ChannelConsumer, DriverConfig, Event, EventConsumer, ExecutionMode,
    MaxUtilizationProvider, ResourceKind, SessionMaxTracker, SessionTemplate, Synthesizer,
    TemplateEventSequencer, TraceDriver,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::SynthConfig;

/// Writes each synthesized event to stdout as one JSON line.
struct JsonLineConsumer;

#[async_trait]
impl EventConsumer for JsonLineConsumer {
    async fn submit_event(&self, event: Event) {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(error) => warn!(%error, "failed to serialize event"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("starting workload-synthd");

    let config = SynthConfig::load()?;

    let (shutdown_tx, _) = broadcast::channel(1);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("SIGINT received, cancelling drive");
                let _ = shutdown_tx.send(());
            }
        });
    }

    if let Some(template_file) = &config.template_file {
        return run_template_workload(template_file).await;
    }

    let provider = if config.pre_run {
        info!("running pre-run pass to compute resource ceilings");
        pre_run_provider(&config, &shutdown_tx).await?
    } else {
        load_provider(&config)?
    };

    run_trace_workload(&config, provider, &shutdown_tx).await
}

async fn run_template_workload(template_file: &str) -> Result<()> {
    let raw = std::fs::read_to_string(template_file)
        .with_context(|| format!("failed to read template file {template_file:?}"))?;
    let templates: Vec<SessionTemplate> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse template file {template_file:?}"))?;

    let sequencer = TemplateEventSequencer::sequence_templates(&templates, 0, 60)?;
    info!(
        sessions = templates.len(),
        events = sequencer.len(),
        final_tick = sequencer.approximate_final_tick(),
        "sequenced template workload"
    );

    sequencer.submit_all(&JsonLineConsumer).await;
    info!("finished generating template workload");
    Ok(())
}

/// Builds the resource-ceiling provider from the configured summary files.
fn load_provider(config: &SynthConfig) -> Result<MaxUtilizationProvider> {
    let mut provider = MaxUtilizationProvider::new();
    let adjust = config.adjust_gpu_reservations;

    if let Some(path) = &config.max_session_cpu_file {
        provider.load_session_cpus(path.as_ref())?;
    }
    if let Some(path) = &config.max_session_mem_file {
        provider.load_session_memory(path.as_ref())?;
    }
    if let Some(path) = &config.max_session_gpu_file {
        provider.load_session_gpus(path.as_ref(), adjust)?;
    }
    if let Some(path) = &config.max_training_cpu_file {
        provider.load_training_cpus(path.as_ref())?;
    }
    if let Some(path) = &config.max_training_mem_file {
        provider.load_training_memory(path.as_ref())?;
    }
    if let Some(path) = &config.max_training_gpu_file {
        provider.load_training_gpus(path.as_ref(), adjust)?;
    }
    Ok(provider)
}

struct DriverSpec {
    kind: ResourceKind,
    trace: PathBuf,
    mapping: Option<PathBuf>,
    downtimes: Vec<i64>,
}

fn driver_specs(config: &SynthConfig) -> Result<Vec<DriverSpec>> {
    let mut specs = Vec::new();

    if let Some(trace) = &config.cpu_trace {
        specs.push(DriverSpec {
            kind: ResourceKind::Cpu,
            trace: trace.into(),
            mapping: config.cpu_mapping.as_ref().map(PathBuf::from),
            downtimes: match &config.cpu_downtime {
                Some(spec) => parse_downtimes(spec)?,
                None => Vec::new(),
            },
        });
    }
    if let Some(trace) = &config.gpu_trace {
        specs.push(DriverSpec {
            kind: ResourceKind::Gpu,
            trace: trace.into(),
            mapping: config.gpu_mapping.as_ref().map(PathBuf::from),
            downtimes: Vec::new(),
        });
    }
    if let Some(trace) = &config.mem_trace {
        specs.push(DriverSpec {
            kind: ResourceKind::Memory,
            trace: trace.into(),
            mapping: config.mem_mapping.as_ref().map(PathBuf::from),
            downtimes: match &config.mem_downtime {
                Some(spec) => parse_downtimes(spec)?,
                None => Vec::new(),
            },
        });
    }

    if specs.is_empty() {
        anyhow::bail!("no trace files configured; set SYNTH_CPU_TRACE, SYNTH_GPU_TRACE or SYNTH_MEM_TRACE");
    }
    Ok(specs)
}

fn driver_config(config: &SynthConfig, spec: &DriverSpec, mode: ExecutionMode) -> DriverConfig {
    let mut driver_config = DriverConfig::new(spec.kind);
    driver_config.reading_interval = chrono::Duration::seconds(config.trace_step_secs);
    driver_config.downtimes = spec.downtimes.clone();
    driver_config.mapper_path = spec.mapping.clone();
    driver_config.seed = config.seed;
    driver_config.mode = mode;
    driver_config.last_timestamp = config
        .last_timestamp
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0));
    driver_config
}

/// Spawns one driver per configured trace, wired into the synthesizer, and
/// returns the drive task handles plus the drivers' maxima trackers.
fn spawn_drivers(
    config: &SynthConfig,
    synth: &mut Synthesizer,
    mode: ExecutionMode,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<Vec<(ResourceKind, Arc<SessionMaxTracker>, JoinHandle<()>)>> {
    let mut handles = Vec::new();

    for spec in driver_specs(config)? {
        let (id, tx) = synth.add_source();
        let driver = TraceDriver::new(id, driver_config(config, &spec, mode), tx);
        let tracker = driver.max_tracker();
        synth.set_source_tracker(id, driver.max_tracker());

        let kind = spec.kind;
        let trace = spec.trace.clone();
        let shutdown = shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            if let Err(error) = driver.drive(&[trace], shutdown).await {
                error!(%kind, %error, "trace driver failed");
            }
        });
        info!(%kind, trace = %spec.trace.display(), "driving trace");
        handles.push((kind, tracker, handle));
    }

    Ok(handles)
}

/// Runs a pre-run pass over the traces and assembles the provider from the
/// recorded maxima.
async fn pre_run_provider(
    config: &SynthConfig,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<MaxUtilizationProvider> {
    let mut synth = Synthesizer::new(MaxUtilizationProvider::new(), ExecutionMode::PreRun);
    let drivers = spawn_drivers(config, &mut synth, ExecutionMode::PreRun, shutdown_tx)?;

    // Pre-run discards the session events; only the maxima matter.
    let (sink_tx, mut sink_rx) = tokio::sync::mpsc::channel(64);
    let sink = tokio::spawn(async move { while sink_rx.recv().await.is_some() {} });
    synth.synthesize(&ChannelConsumer::new(sink_tx)).await;
    sink.await.ok();

    let mut cpu = None;
    let mut gpu = None;
    let mut memory = None;
    for (kind, tracker, handle) in drivers {
        handle.await.ok();
        match kind {
            ResourceKind::Cpu => cpu = Some(tracker),
            ResourceKind::Gpu => gpu = Some(tracker),
            ResourceKind::Memory => memory = Some(tracker),
        }
    }

    Ok(MaxUtilizationProvider::from_pre_run(
        cpu.as_deref(),
        gpu.as_deref(),
        memory.as_deref(),
    ))
}

async fn run_trace_workload(
    config: &SynthConfig,
    provider: MaxUtilizationProvider,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<()> {
    let mut synth = Synthesizer::new(provider, ExecutionMode::Standard);
    let drivers = spawn_drivers(config, &mut synth, ExecutionMode::Standard, shutdown_tx)?;

    synth.synthesize(&JsonLineConsumer).await;

    for (kind, _, handle) in drivers {
        if handle.await.is_err() {
            error!(%kind, "trace driver task panicked");
        }
    }

    info!("finished generating workload");
    Ok(())
}
