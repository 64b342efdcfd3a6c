//! Event model shared by the trace drivers, the synthesizer, and the
//! template sequencer.
//!
//! Every event carries two timestamps: the wall-clock timestamp of the
//! reading that produced it, and an adjusted nanosecond key used only for
//! ordering. The adjusted key is perturbed by bounded random jitter so that
//! events from independently-sampled traces sharing a wall-clock tick do not
//! arrive in artificial lock-step.

use crate::resource::UtilState;
use crate::session::SessionSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::warn;

/// Identifies the event source that produced an event within one
/// synthesizer instance.
pub type SourceId = usize;

/// The resource dimension a trace or event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceKind {
    Cpu,
    Gpu,
    Memory,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => write!(f, "CPU"),
            ResourceKind::Gpu => write!(f, "GPU"),
            ResourceKind::Memory => write!(f, "memory"),
        }
    }
}

/// Resource-level lifecycle transitions emitted by the state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResourceEventKind {
    Started,
    Activated,
    Deactivated,
    Stopped,
}

/// Session-level lifecycle transitions emitted by the aggregator and the
/// template sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionEventKind {
    SessionStarted,
    SessionReady,
    TrainingStarted,
    TrainingEnded,
    SessionStopped,
}

/// The name of an event: a resource transition tagged with its resource
/// kind, or a session-level transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventName {
    Resource {
        kind: ResourceKind,
        event: ResourceEventKind,
    },
    Session(SessionEventKind),
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventName::Resource { kind, event } => {
                let prefix = match kind {
                    ResourceKind::Cpu => "cpu",
                    ResourceKind::Gpu => "gpu",
                    ResourceKind::Memory => "memory",
                };
                let suffix = match event {
                    ResourceEventKind::Started => "started",
                    ResourceEventKind::Activated => "activated",
                    ResourceEventKind::Deactivated => "deactivated",
                    ResourceEventKind::Stopped => "stopped",
                };
                write!(f, "{prefix}-{suffix}")
            }
            EventName::Session(kind) => {
                let name = match kind {
                    SessionEventKind::SessionStarted => "session-started",
                    SessionEventKind::SessionReady => "session-ready",
                    SessionEventKind::TrainingStarted => "training-started",
                    SessionEventKind::TrainingEnded => "training-ended",
                    SessionEventKind::SessionStopped => "session-stopped",
                };
                write!(f, "{name}")
            }
        }
    }
}

/// Snapshot payload attached to an event at emission time.
///
/// Payloads are value copies taken when the event is created, so downstream
/// consumers never observe later in-place mutation of the originating state
/// machine.
#[derive(Debug, Clone, Serialize)]
pub enum EventPayload {
    Resource(UtilState),
    Session(SessionSnapshot),
}

impl EventPayload {
    /// The session/pod identifier the payload refers to.
    pub fn pod(&self) -> &str {
        match self {
            EventPayload::Resource(util) => &util.pod,
            EventPayload::Session(snapshot) => &snapshot.pod,
        }
    }
}

/// One synthesized workload event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub name: EventName,
    pub session_id: String,
    /// Wall-clock timestamp of the reading or tick that produced the event.
    pub timestamp: DateTime<Utc>,
    /// Nanosecond ordering key: the timestamp perturbed by bounded jitter.
    /// Used only for total ordering, never exposed as a time of day.
    pub adjusted_ns: i64,
    /// Order of this event relative to other events of the same session.
    pub local_index: u64,
    /// Monotonically increasing sequence number for deterministic replay.
    pub global_index: u64,
    #[serde(skip)]
    pub source: SourceId,
    pub payload: EventPayload,
}

impl Event {
    fn tie_rank(&self) -> u8 {
        // Training-ended must sort ahead of session-stopped at equal
        // adjusted timestamps so the aggregator sees training completion
        // before termination.
        match self.name {
            EventName::Session(SessionEventKind::TrainingEnded) => 0,
            EventName::Session(SessionEventKind::SessionStopped) => 2,
            _ => 1,
        }
    }

    pub(crate) fn order_key(&self) -> (i64, u8, u64, SourceId) {
        (self.adjusted_ns, self.tie_rank(), self.global_index, self.source)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event[name={}, session={}, ts={}, local={}, global={}]",
            self.name, self.session_id, self.timestamp, self.local_index, self.global_index
        )
    }
}

/// Min-ordering wrapper used with `BinaryHeap<Reverse<OrderedEvent>>` and
/// when sorting driver-side event buffers.
#[derive(Debug, Clone)]
pub struct OrderedEvent(pub Event);

impl PartialEq for OrderedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.0.order_key() == other.0.order_key()
    }
}

impl Eq for OrderedEvent {}

impl PartialOrd for OrderedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.order_key().cmp(&other.0.order_key())
    }
}

/// What an event source hands to the synthesizer.
///
/// `Exhausted` covers both natural end-of-trace and cancellation; `Failed`
/// carries a description of an upstream error. The synthesizer treats every
/// sentinel the same way: the source is removed from the merge.
#[derive(Debug)]
pub enum SourceMessage {
    Event(Event),
    Exhausted,
    Failed(String),
}

/// Consumer of synthesized events, e.g. a cluster simulator frontend.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    async fn submit_event(&self, event: Event);
}

/// An [`EventConsumer`] that forwards events into an mpsc channel.
pub struct ChannelConsumer {
    tx: mpsc::Sender<Event>,
}

impl ChannelConsumer {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventConsumer for ChannelConsumer {
    async fn submit_event(&self, event: Event) {
        if self.tx.send(event).await.is_err() {
            warn!("event consumer channel closed, dropping event");
        }
    }
}

/// Allocates the session-scoped and global sequence numbers carried by
/// events. Owned by the component that emits consumer-facing events, so
/// replay order is reproducible without process-wide state.
#[derive(Debug, Default)]
pub struct EventIndexAllocator {
    global: u64,
    local: HashMap<String, u64>,
}

impl EventIndexAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `(local_index, global_index)` for the next event of the
    /// given session.
    pub fn next(&mut self, session_id: &str) -> (u64, u64) {
        let local = self.local.entry(session_id.to_string()).or_insert(0);
        let local_index = *local;
        *local += 1;
        self.global += 1;
        (local_index, self.global)
    }

    /// Allocates a global index without a session association.
    pub fn next_global(&mut self) -> u64 {
        self.global += 1;
        self.global
    }
}

/// Nanosecond representation of a timestamp for ordering keys.
pub(crate) fn ts_nanos(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_event(name: EventName, adjusted_ns: i64, global_index: u64) -> Event {
        Event {
            name,
            session_id: "session-1".to_string(),
            timestamp: Utc.timestamp_opt(0, 0).unwrap(),
            adjusted_ns,
            local_index: 0,
            global_index,
            source: 0,
            payload: EventPayload::Session(SessionSnapshot::empty("session-1")),
        }
    }

    #[test]
    fn test_ordering_by_adjusted_timestamp() {
        let early = make_event(
            EventName::Session(SessionEventKind::SessionReady),
            100,
            2,
        );
        let late = make_event(EventName::Session(SessionEventKind::SessionReady), 200, 1);

        assert!(OrderedEvent(early) < OrderedEvent(late));
    }

    #[test]
    fn test_training_ended_sorts_before_session_stopped() {
        let stopped = make_event(
            EventName::Session(SessionEventKind::SessionStopped),
            100,
            1,
        );
        let ended = make_event(EventName::Session(SessionEventKind::TrainingEnded), 100, 2);

        assert!(OrderedEvent(ended) < OrderedEvent(stopped));
    }

    #[test]
    fn test_index_allocator_is_per_session_and_global() {
        let mut allocator = EventIndexAllocator::new();

        let (local_a0, global_1) = allocator.next("a");
        let (local_b0, global_2) = allocator.next("b");
        let (local_a1, global_3) = allocator.next("a");

        assert_eq!((local_a0, local_b0, local_a1), (0, 0, 1));
        assert_eq!((global_1, global_2, global_3), (1, 2, 3));
    }

    #[test]
    fn test_event_serializes_to_json() {
        let event = make_event(EventName::Session(SessionEventKind::SessionReady), 100, 1);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["session_id"], "session-1");
        assert_eq!(json["global_index"], 1);
        // The source id is internal wiring and must not leak into output.
        assert!(json.get("source").is_none());
    }

    #[test]
    fn test_event_name_display() {
        let name = EventName::Resource {
            kind: ResourceKind::Cpu,
            event: ResourceEventKind::Deactivated,
        };
        assert_eq!(name.to_string(), "cpu-deactivated");
        assert_eq!(
            EventName::Session(SessionEventKind::TrainingStarted).to_string(),
            "training-started"
        );
    }
}
