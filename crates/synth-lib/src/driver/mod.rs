//! Trace-driving
//!
//! A [`TraceDriver`] turns one resource type's ordered reading sequence
//! into a time-sorted event stream for all pods. Each driver runs as its
//! own task and hands events to the synthesizer through a single-item
//! channel, so a driver can never run more than one event ahead of the
//! merge.
//!
//! Gaps in the trace are closed by garbage collection: every pod that did
//! not report at a tick is driven through a synthetic zero-value reading,
//! which is what produces debounced `Deactivated`/`Stopped` events for
//! silent pods. Known trace-server outages (the downtime list) suppress
//! this so an outage does not read as every pod stopping at once.

mod maxes;
mod reader;

pub use maxes::SessionMaxTracker;
pub use reader::{load_pod_map, parse_downtimes, Reading};

use crate::error::SynthesisError;
use crate::events::{
    ts_nanos, Event, EventIndexAllocator, EventName, EventPayload, ResourceEventKind,
    ResourceKind, SourceId, SourceMessage,
};
use crate::resource::{DebounceConfig, GpuAggregator, StateMachine, UtilState, UtilStatus};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Whether a drive records maxima (pre-run) or synthesizes events for a
/// consumer (standard).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    PreRun,
    Standard,
}

/// Configuration for one trace driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub kind: ResourceKind,
    pub debounce: DebounceConfig,
    /// Expected sampling interval of the trace; bounds the stochastic
    /// sub-tick jitter.
    pub reading_interval: Duration,
    /// Constant offset applied to record timestamps. CPU traces need a
    /// negative offset to compensate for the exporter's rate()
    /// extrapolation window.
    pub timestamp_offset: Duration,
    /// Alternating "became down" / "became up" UNIX timestamps.
    pub downtimes: Vec<i64>,
    /// Records beyond this bound are not read.
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Pod map file resolving numeric indices to session ids. Without one,
    /// the index itself is the id.
    pub mapper_path: Option<PathBuf>,
    pub mode: ExecutionMode,
    /// Seed for the jitter RNG; fixed seeds give reproducible orderings.
    pub seed: u64,
}

impl DriverConfig {
    pub fn new(kind: ResourceKind) -> Self {
        let timestamp_offset = match kind {
            ResourceKind::Cpu => Duration::seconds(-120),
            _ => Duration::zero(),
        };
        Self {
            kind,
            debounce: DebounceConfig::for_kind(kind),
            reading_interval: Duration::seconds(60),
            timestamp_offset,
            downtimes: Vec::new(),
            last_timestamp: None,
            mapper_path: None,
            mode: ExecutionMode::Standard,
            seed: 0,
        }
    }
}

/// Per-pod tracking: GPU pods aggregate multi-device readings, everything
/// else commits directly.
#[derive(Debug)]
enum PodMachine {
    Direct(StateMachine),
    Aggregated(GpuAggregator),
}

/// Sent on the driver's channel when the synthesizer has gone away; the
/// drive winds down as if cancelled.
struct ChannelClosed;

#[derive(Debug, PartialEq, Eq)]
enum DriveOutcome {
    Completed,
    Cancelled,
}

/// Drives one resource type's trace through per-pod state machines.
pub struct TraceDriver {
    id: SourceId,
    config: DriverConfig,
    pod_map: Option<Vec<String>>,
    pods: Vec<Option<PodMachine>>,
    /// UNIX seconds of the newest reading seen.
    last_read: Option<i64>,
    /// Smallest tick interval observed while driving.
    detected_interval: Option<Duration>,
    /// Position in the downtime list; odd means the source is down.
    down: usize,
    rng: StdRng,
    buffer: Vec<Event>,
    indices: EventIndexAllocator,
    maxes: Arc<SessionMaxTracker>,
    tx: mpsc::Sender<SourceMessage>,
}

impl TraceDriver {
    pub fn new(id: SourceId, config: DriverConfig, tx: mpsc::Sender<SourceMessage>) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            id,
            config,
            pod_map: None,
            pods: Vec::new(),
            last_read: None,
            detected_interval: None,
            down: 0,
            rng,
            buffer: Vec::new(),
            indices: EventIndexAllocator::new(),
            maxes: Arc::new(SessionMaxTracker::new()),
            tx,
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.config.kind
    }

    /// The pre-run maxima recorded by this driver; shared with the
    /// synthesizer, which notifies training boundaries through it.
    pub fn max_tracker(&self) -> Arc<SessionMaxTracker> {
        Arc::clone(&self.maxes)
    }

    /// Installs a pod map directly instead of loading one from a file.
    pub fn set_pod_map(&mut self, pod_map: Vec<String>) {
        self.pod_map = Some(pod_map);
    }

    /// Reads the given trace files in order, emitting events until the
    /// traces are exhausted, the drive is cancelled, or an I/O error
    /// occurs. I/O errors are reported downstream as a failure sentinel
    /// and returned to the caller, which decides whether to abort the
    /// whole synthesis.
    pub async fn drive(
        mut self,
        paths: &[PathBuf],
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), SynthesisError> {
        match self.run(paths, &mut shutdown).await {
            Ok(outcome) => {
                if outcome == DriveOutcome::Cancelled {
                    debug!(kind = %self.config.kind, "drive cancelled");
                }
                self.finish().await;
                Ok(())
            }
            Err(error) => {
                let _ = self.flush().await;
                let _ = self
                    .tx
                    .send(SourceMessage::Failed(error.to_string()))
                    .await;
                Err(error)
            }
        }
    }

    /// Drives a pre-built reading sequence instead of trace files.
    pub async fn drive_readings(
        mut self,
        readings: Vec<Reading>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), SynthesisError> {
        self.setup()?;
        for reading in readings {
            if cancelled(&mut shutdown) {
                break;
            }
            if self.handle_reading(reading).await.is_err() {
                break;
            }
        }
        self.finish().await;
        Ok(())
    }

    async fn run(
        &mut self,
        paths: &[PathBuf],
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<DriveOutcome, SynthesisError> {
        if paths.is_empty() {
            return Err(SynthesisError::InvalidConfiguration(
                "no trace paths specified".to_string(),
            ));
        }
        self.setup()?;

        for path in paths {
            debug!(kind = %self.config.kind, path = %path.display(), "driving trace file");
            let records = reader::open_trace(self.config.kind, path)?;
            let mut line = 1usize;

            for record in records {
                line += 1;
                if cancelled(shutdown) {
                    return Ok(DriveOutcome::Cancelled);
                }
                let reading = match record {
                    Ok(reading) => reading,
                    Err(error) => {
                        warn!(path = %path.display(), line, %error, "skipping unparseable trace row");
                        continue;
                    }
                };
                if let Some(bound) = self.config.last_timestamp {
                    if reading.timestamp > bound {
                        warn!(
                            kind = %self.config.kind,
                            timestamp = %reading.timestamp,
                            bound = %bound,
                            "reading beyond the configured bound, finishing file"
                        );
                        break;
                    }
                }
                if self.handle_reading(reading).await.is_err() {
                    return Ok(DriveOutcome::Cancelled);
                }
            }
        }

        Ok(DriveOutcome::Completed)
    }

    /// Flushes pending debounce states and signals exhaustion.
    async fn finish(&mut self) {
        if self.teardown().await.is_err() {
            return;
        }
        let _ = self.tx.send(SourceMessage::Exhausted).await;
    }

    fn setup(&mut self) -> Result<(), SynthesisError> {
        if self.pod_map.is_some() {
            return Ok(());
        }
        if let Some(path) = self.config.mapper_path.clone() {
            let map = reader::load_pod_map(&path)?;
            info!(kind = %self.config.kind, entries = map.len(), "pod map loaded");
            self.pod_map = Some(map);
        } else {
            debug!(kind = %self.config.kind, "no pod map configured, using indices as ids");
        }
        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), ChannelClosed> {
        let Some(last) = self.last_read else {
            return self.flush().await;
        };
        let Some(ts) = DateTime::from_timestamp(last, 0) else {
            return self.flush().await;
        };
        debug!(kind = %self.config.kind, last_read = last, "tearing down");

        // Two passes: first close out pods that went silent before the end
        // of the trace, then force everything still alive through its stop.
        self.garbage_collect(ts, false).await?;
        let mut interval = self
            .detected_interval
            .unwrap_or_else(|| Duration::seconds(1));
        if interval <= Duration::zero() {
            interval = Duration::seconds(1);
        }
        self.garbage_collect(ts + interval, true).await?;
        self.flush().await
    }

    async fn handle_reading(&mut self, reading: Reading) -> Result<(), ChannelClosed> {
        let ts = reading.timestamp + self.config.timestamp_offset;
        let Some(pod_id) = self.resolve_pod(reading.pod_idx) else {
            warn!(
                kind = %self.config.kind,
                pod_idx = reading.pod_idx,
                "pod index missing from pod map, skipping reading"
            );
            return Ok(());
        };

        // A timestamp advance closes the previous tick: garbage-collect
        // every pod that did not report, unless the source was down.
        if let Some(last) = self.last_read {
            if last < ts.timestamp() {
                if let Some(gap_start) = DateTime::from_timestamp(last, 0) {
                    let interval = ts - gap_start;
                    let was_down = self.is_down();
                    if self.validate_tick(ts, interval) {
                        if was_down {
                            warn!(
                                kind = %self.config.kind,
                                resumed_at = %ts,
                                "trace source resumed, resuming garbage collection"
                            );
                        }
                        self.garbage_collect(gap_start, false).await?;
                        self.flush().await?;
                    } else if !was_down {
                        warn!(
                            kind = %self.config.kind,
                            down_since = %ts,
                            "trace source down, suspending garbage collection"
                        );
                    }
                }
            }
        }
        self.last_read = Some(ts.timestamp());

        let prerun = self.config.mode == ExecutionMode::PreRun;
        if prerun {
            self.maxes.ensure_session(&pod_id);
            if self.config.kind == ResourceKind::Gpu {
                self.maxes
                    .record_device_value(&pod_id, reading.device as usize, reading.value);
            }
        }

        let maxes = Arc::clone(&self.maxes);
        let mut batches: Vec<(Vec<ResourceEventKind>, UtilState)> = Vec::new();
        {
            let kind = self.config.kind;
            let machine = self.ensure_pod(reading.pod_idx, &pod_id);
            match machine {
                PodMachine::Direct(machine) => {
                    machine.commit(ts, reading.value);
                    if prerun {
                        maxes.record_value(&pod_id, machine.current().value, 0);
                    }
                    let mut events = Vec::new();
                    if let Err(error) = machine.transit(&mut events, false) {
                        warn!(%error, %kind, "error handling trace record");
                    }
                    batches.push((events, machine.current().clone()));
                }
                PodMachine::Aggregated(aggregator) => {
                    if let Some(tick) = aggregator.observe(ts, reading.value, reading.vram_gb) {
                        if prerun {
                            maxes.record_value(&pod_id, tick.snapshot.value, tick.snapshot.devices);
                        }
                        if let Some(error) = &tick.error {
                            warn!(%error, %kind, "error handling trace record");
                        }
                        batches.push((tick.events, tick.snapshot));
                    }
                }
            }
        }

        for (events, snapshot) in batches {
            self.trigger_batch(&events, snapshot).await?;
        }
        Ok(())
    }

    /// Drives a synthetic zero-value reading through every pod that did
    /// not report at `ts`.
    async fn garbage_collect(
        &mut self,
        ts: DateTime<Utc>,
        force: bool,
    ) -> Result<(), ChannelClosed> {
        let mut targets = Vec::new();
        for (idx, slot) in self.pods.iter().enumerate() {
            let Some(machine) = slot else { continue };
            // Ignore pods that reported at this tick or already stopped.
            let skip = match machine {
                PodMachine::Direct(machine) => {
                    machine.current().timestamp == ts
                        || machine.current().status == UtilStatus::Stopped
                }
                PodMachine::Aggregated(aggregator) => {
                    aggregator.pending_timestamp() == Some(ts)
                        || aggregator.current().status == UtilStatus::Stopped
                }
            };
            if !skip {
                targets.push(idx);
            }
        }

        let kind = self.config.kind;
        let mut batches: Vec<(Vec<ResourceEventKind>, UtilState)> = Vec::new();

        // Conclude buffered GPU ticks first so their events precede the
        // synthetic resets.
        for &idx in &targets {
            if let Some(PodMachine::Aggregated(aggregator)) = self.pods[idx].as_mut() {
                if let Some(tick) = aggregator.conclude(force) {
                    if let Some(error) = &tick.error {
                        warn!(%error, %kind, "error committing last readings during garbage collection");
                    }
                    batches.push((tick.events, tick.snapshot));
                }
            }
        }

        for &idx in &targets {
            match self.pods[idx].as_mut() {
                Some(PodMachine::Direct(machine)) => {
                    machine.reset(ts);
                    let mut events = Vec::new();
                    if let Err(error) = machine.transit(&mut events, force) {
                        warn!(%error, %kind, "error committing last readings during garbage collection");
                    }
                    batches.push((events, machine.current().clone()));
                }
                Some(PodMachine::Aggregated(aggregator)) => {
                    let tick = aggregator.reset(ts, force);
                    if let Some(error) = &tick.error {
                        warn!(%error, %kind, "error committing last readings during garbage collection");
                    }
                    batches.push((tick.events, tick.snapshot));
                }
                None => {}
            }
        }

        for (events, snapshot) in batches {
            self.trigger_batch(&events, snapshot).await?;
        }
        Ok(())
    }

    fn ensure_pod(&mut self, idx: usize, pod_id: &str) -> &mut PodMachine {
        if self.pods.len() <= idx {
            self.pods.resize_with(idx + 1, || None);
        }
        let kind = self.config.kind;
        let debounce = self.config.debounce;
        self.pods[idx].get_or_insert_with(|| match kind {
            ResourceKind::Gpu => PodMachine::Aggregated(GpuAggregator::new(pod_id, debounce)),
            _ => PodMachine::Direct(StateMachine::new(kind, pod_id, debounce)),
        })
    }

    fn resolve_pod(&self, idx: usize) -> Option<String> {
        match &self.pod_map {
            Some(map) => map.get(idx).cloned(),
            None => Some(idx.to_string()),
        }
    }

    fn is_down(&self) -> bool {
        self.down % 2 == 1
    }

    /// Calibrates the downtime cursor and the detected sampling interval;
    /// returns false while the source is down.
    fn validate_tick(&mut self, ts: DateTime<Utc>, interval: Duration) -> bool {
        let unix = ts.timestamp();
        while self.down < self.config.downtimes.len() && unix >= self.config.downtimes[self.down] {
            self.down += 1;
        }
        if self.is_down() {
            return false;
        }
        if self
            .detected_interval
            .map_or(true, |current| interval <= current)
        {
            self.detected_interval = Some(interval);
        }
        true
    }

    /// Buffers the events of one committed reading. The first event of the
    /// batch gets a jittered sub-tick ordering key; the rest follow it
    /// directly so events from the same reading keep their strict order.
    async fn trigger_batch(
        &mut self,
        events: &[ResourceEventKind],
        snapshot: UtilState,
    ) -> Result<(), ChannelClosed> {
        if events.is_empty() {
            return Ok(());
        }

        for (i, event) in events.iter().enumerate() {
            if let Some(tail) = self.buffer.last() {
                if tail.timestamp != snapshot.timestamp {
                    self.flush().await?;
                }
            }
            let tail_key = self.buffer.last().map(|tail| tail.adjusted_ns);
            let adjusted_ns = match (i, tail_key) {
                (0, _) | (_, None) => ts_nanos(&snapshot.timestamp) - self.jitter_ns(),
                (_, Some(tail_adjusted)) => tail_adjusted + 1,
            };

            let (local_index, global_index) = self.indices.next(&snapshot.pod);
            self.buffer.push(Event {
                name: EventName::Resource {
                    kind: self.config.kind,
                    event: *event,
                },
                session_id: snapshot.pod.clone(),
                timestamp: snapshot.timestamp,
                adjusted_ns,
                local_index,
                global_index,
                source: self.id,
                payload: EventPayload::Resource(snapshot.clone()),
            });
        }
        Ok(())
    }

    /// Sends the buffered events downstream in adjusted-timestamp order.
    async fn flush(&mut self) -> Result<(), ChannelClosed> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut events: Vec<Event> = std::mem::take(&mut self.buffer);
        events.sort_by_key(|event| event.order_key());
        for event in events {
            self.tx
                .send(SourceMessage::Event(event))
                .await
                .map_err(|_| ChannelClosed)?;
        }
        Ok(())
    }

    /// Random offset within one sampling interval, leaving a one-second
    /// guard so a jittered event never sorts a full tick early.
    fn jitter_ns(&mut self) -> i64 {
        let second = 1_000_000_000i64;
        let interval = self
            .config
            .reading_interval
            .num_nanoseconds()
            .unwrap_or(second);
        if interval <= second {
            return 0;
        }
        self.rng.gen_range(0..interval - second)
    }
}

fn cancelled(shutdown: &mut broadcast::Receiver<()>) -> bool {
    use broadcast::error::TryRecvError;
    match shutdown.try_recv() {
        Ok(()) => true,
        Err(TryRecvError::Lagged(_)) => true,
        Err(TryRecvError::Closed) => true,
        Err(TryRecvError::Empty) => false,
    }
}

/// Convenience for wiring a driver: a single-item handoff channel, so a
/// driver blocks producing until the synthesizer consumes.
pub fn handoff_channel() -> (mpsc::Sender<SourceMessage>, mpsc::Receiver<SourceMessage>) {
    mpsc::channel(1)
}
