//! Event-merging synthesizer
//!
//! Merges the event streams of N trace drivers into one globally ordered
//! stream using a binary min-heap keyed by adjusted timestamp. The heap
//! always holds exactly one event per live source: popping the minimum pulls
//! one replacement from the same source, so no source ever runs more than
//! one event ahead of the merge.
//!
//! Each merged resource event is dispatched through the owning session's
//! lifecycle machine; resulting session-level events are snapshotted,
//! annotated with the session's resource ceilings, and submitted to the
//! consumer.

use crate::driver::{ExecutionMode, SessionMaxTracker};
use crate::events::{
    ts_nanos, Event, EventConsumer, EventIndexAllocator, EventName, EventPayload, OrderedEvent,
    SessionEventKind, SourceId, SourceMessage,
};
use crate::models::MaxUtilizationProvider;
use crate::session::{ReadinessConfig, SessionEnvelope, SessionLifecycle};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

struct Source {
    rx: mpsc::Receiver<SourceMessage>,
    /// Pre-run maxima tracker of the driver behind this source, notified
    /// of training boundaries during a pre-run pass.
    tracker: Option<Arc<SessionMaxTracker>>,
}

/// Merges driver event streams and aggregates per-session lifecycles.
pub struct Synthesizer {
    sources: Vec<Source>,
    sessions: HashMap<String, SessionLifecycle>,
    provider: MaxUtilizationProvider,
    /// Index of the next training interval per session.
    training_cursor: HashMap<String, usize>,
    readiness: ReadinessConfig,
    mode: ExecutionMode,
    indices: EventIndexAllocator,
}

impl Synthesizer {
    pub fn new(provider: MaxUtilizationProvider, mode: ExecutionMode) -> Self {
        Self {
            sources: Vec::new(),
            sessions: HashMap::new(),
            provider,
            training_cursor: HashMap::new(),
            readiness: ReadinessConfig::default(),
            mode,
            indices: EventIndexAllocator::new(),
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessConfig) -> Self {
        self.readiness = readiness;
        self
    }

    /// Registers an event source and returns its id together with the
    /// sender half of its single-item handoff channel. The driver built on
    /// top must use the same id.
    pub fn add_source(&mut self) -> (SourceId, mpsc::Sender<SourceMessage>) {
        let (tx, rx) = mpsc::channel(1);
        let id = self.sources.len();
        self.sources.push(Source { rx, tracker: None });
        (id, tx)
    }

    /// Attaches a driver's maxima tracker to a source, for training-boundary
    /// notifications during a pre-run pass.
    pub fn set_source_tracker(&mut self, id: SourceId, tracker: Arc<SessionMaxTracker>) {
        if let Some(source) = self.sources.get_mut(id) {
            source.tracker = Some(tracker);
        }
    }

    /// Runs the merge until every source reports exhaustion or failure.
    /// Session events are delivered to `consumer`; in pre-run mode they are
    /// routed to the maxima trackers instead.
    pub async fn synthesize(&mut self, consumer: &dyn EventConsumer) {
        let mut heap: BinaryHeap<Reverse<OrderedEvent>> = BinaryHeap::with_capacity(
            self.sources.len(),
        );

        info!(num_sources = self.sources.len(), "synthesizing workload");

        // Seed the heap with one event per source; sources that are
        // already exhausted (or failed before producing) drop out here.
        for id in 0..self.sources.len() {
            match self.sources[id].rx.recv().await {
                Some(SourceMessage::Event(event)) => heap.push(Reverse(OrderedEvent(event))),
                Some(SourceMessage::Exhausted) | None => {
                    warn!(source = id, "removed empty event source");
                }
                Some(SourceMessage::Failed(reason)) => {
                    error!(source = id, %reason, "event source failed before producing");
                }
            }
        }

        while let Some(Reverse(OrderedEvent(event))) = heap.pop() {
            let source = event.source;
            self.dispatch(&event, consumer).await;

            // Refill from the source that produced the popped event.
            match self.sources[source].rx.recv().await {
                Some(SourceMessage::Event(next)) => heap.push(Reverse(OrderedEvent(next))),
                Some(SourceMessage::Exhausted) | None => {
                    info!(source, sources_left = heap.len(), "event source drained");
                }
                Some(SourceMessage::Failed(reason)) => {
                    error!(source, %reason, sources_left = heap.len(), "event source failed");
                }
            }
        }

        info!("finished consuming events from all sources");
    }

    async fn dispatch(&mut self, event: &Event, consumer: &dyn EventConsumer) {
        let EventPayload::Resource(_) = &event.payload else {
            return;
        };
        let pod = event.session_id.clone();

        if !self.sessions.contains_key(&pod) {
            let Some(session) = self.init_session(&pod) else {
                return;
            };
            debug!(session_id = %pod, event_name = %event.name, "initialized session");
            self.sessions.insert(pod.clone(), session);
        }

        let Some(session) = self.sessions.get_mut(&pod) else {
            return;
        };
        let triggered = match session.apply(event) {
            Ok(triggered) => triggered,
            Err(err) => {
                // Recoverable: the event is dropped and the session state
                // is left unchanged.
                error!(
                    session_id = %pod,
                    event_name = %event.name,
                    error = %err,
                    "error while transitioning session, dropping event"
                );
                return;
            }
        };

        for kind in triggered {
            match self.mode {
                ExecutionMode::Standard => self.submit_session_event(&pod, kind, consumer).await,
                ExecutionMode::PreRun => self.notify_trackers(&pod, kind),
            }
        }
    }

    /// Builds the session from the provider's ceilings. In standard mode a
    /// session absent from every map cannot be simulated and is skipped.
    fn init_session(&self, pod: &str) -> Option<SessionLifecycle> {
        let envelope = match self.mode {
            ExecutionMode::Standard => {
                if self.provider.is_unknown_session(pod) {
                    warn!(
                        session_id = %pod,
                        "session missing from every max-utilization map, skipping"
                    );
                    return None;
                }
                let lookup = |name: &str, value: Option<f64>| -> f64 {
                    match value {
                        Some(value) => value,
                        None => {
                            warn!(session_id = %pod, map = name, "no max-utilization entry for session");
                            0.0
                        }
                    }
                };
                SessionEnvelope {
                    max_cpus: lookup("cpu", self.provider.session_cpus.get(pod).copied()),
                    max_memory_gb: lookup(
                        "memory",
                        self.provider.session_memory_gb.get(pod).copied(),
                    ),
                    max_gpus: self.provider.session_gpus.get(pod).copied().unwrap_or_else(|| {
                        warn!(session_id = %pod, map = "gpu", "no max-utilization entry for session");
                        0
                    }),
                    max_vram_gb: self.provider.session_vram_gb.get(pod).copied().unwrap_or(0.0),
                }
            }
            // Pre-run knows no ceilings yet; placeholders keep the
            // lifecycle machinery uniform.
            ExecutionMode::PreRun => SessionEnvelope {
                max_cpus: 1.0,
                max_memory_gb: 128.0,
                max_gpus: 1,
                max_vram_gb: 0.128,
            },
        };

        Some(SessionLifecycle::new(pod, envelope, self.readiness))
    }

    async fn submit_session_event(
        &mut self,
        pod: &str,
        kind: SessionEventKind,
        consumer: &dyn EventConsumer,
    ) {
        let Some(session) = self.sessions.get(pod) else {
            return;
        };
        let mut snapshot = session.snapshot();

        // Attach the ceilings of the training interval the session is in.
        let cursor = self.training_cursor.get(pod).copied().unwrap_or(0);
        snapshot.current_training_max_cpus = per_training(&self.provider.training_cpus, pod, cursor);
        snapshot.current_training_max_memory_gb =
            per_training(&self.provider.training_memory_gb, pod, cursor);
        snapshot.current_training_max_gpus =
            per_training(&self.provider.training_gpus, pod, cursor);
        snapshot.current_training_max_vram_gb = snapshot.vram_gb;

        if kind == SessionEventKind::TrainingStarted {
            self.advance_training_cursor(pod, cursor);
        }

        let (local_index, global_index) = self.indices.next(pod);
        let event = Event {
            name: EventName::Session(kind),
            session_id: pod.to_string(),
            timestamp: snapshot.timestamp,
            adjusted_ns: ts_nanos(&snapshot.timestamp),
            local_index,
            global_index,
            source: 0,
            payload: EventPayload::Session(snapshot),
        };
        consumer.submit_event(event).await;
    }

    fn advance_training_cursor(&mut self, pod: &str, cursor: usize) {
        let next = cursor + 1;
        let lengths = [
            ("cpu", self.provider.training_cpus.get(pod).map_or(0, Vec::len)),
            (
                "memory",
                self.provider.training_memory_gb.get(pod).map_or(0, Vec::len),
            ),
            ("gpu", self.provider.training_gpus.get(pod).map_or(0, Vec::len)),
        ];
        for (map, len) in lengths {
            if len <= next {
                warn!(
                    session_id = %pod,
                    map,
                    entries = len,
                    training_index = cursor,
                    "cannot advance training index, map has no further entries"
                );
                return;
            }
        }
        self.training_cursor.insert(pod.to_string(), next);
    }

    fn notify_trackers(&self, pod: &str, kind: SessionEventKind) {
        match kind {
            SessionEventKind::TrainingStarted => {
                for source in &self.sources {
                    if let Some(tracker) = &source.tracker {
                        tracker.training_started(pod);
                    }
                }
            }
            SessionEventKind::TrainingEnded => {
                for source in &self.sources {
                    if let Some(tracker) = &source.tracker {
                        tracker.training_ended(pod);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Looks up the per-training ceiling at the given index, defaulting rather
/// than failing: malformed summary data must not abort a synthesis.
fn per_training<T: Copy + Default>(
    map: &HashMap<String, Vec<T>>,
    pod: &str,
    index: usize,
) -> T {
    map.get(pod)
        .and_then(|values| values.get(index))
        .copied()
        .unwrap_or_default()
}
