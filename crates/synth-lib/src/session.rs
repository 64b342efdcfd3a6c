//! Session lifecycle aggregation
//!
//! One state machine per session, fed the CPU/GPU/memory transition events
//! produced by the trace drivers. A session becomes ready only once every
//! readiness dimension has started, and stopped only once every stop
//! dimension has stopped. Events that arrive early relative to the current
//! state are deferred and re-evaluated, not rejected.

use crate::error::SynthesisError;
use crate::events::{
    Event, EventName, EventPayload, ResourceEventKind, ResourceKind, SessionEventKind,
};
use crate::resource::{UtilState, UtilStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Resource dimension bits for readiness and stop tracking.
pub const DIM_CPU: u8 = 0x01;
pub const DIM_GPU: u8 = 0x02;
pub const DIM_MEMORY: u8 = 0x04;

fn dim_bit(kind: ResourceKind) -> u8 {
    match kind {
        ResourceKind::Cpu => DIM_CPU,
        ResourceKind::Gpu => DIM_GPU,
        ResourceKind::Memory => DIM_MEMORY,
    }
}

/// Which resource dimensions gate session readiness and session stop.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessConfig {
    pub ready_dims: u8,
    pub stop_dims: u8,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            ready_dims: DIM_CPU | DIM_GPU,
            stop_dims: DIM_CPU | DIM_GPU,
        }
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Init,
    Initializing,
    Idle,
    Training,
    Stopping,
    Stopped,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Init => "Init",
            SessionStatus::Initializing => "Initializing",
            SessionStatus::Idle => "Idle",
            SessionStatus::Training => "Training",
            SessionStatus::Stopping => "Stopping",
            SessionStatus::Stopped => "Stopped",
        };
        write!(f, "{name}")
    }
}

/// Maximum resource envelope for a session over its whole lifetime,
/// supplied by the max-utilization provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionEnvelope {
    pub max_cpus: f64,
    pub max_memory_gb: f64,
    pub max_gpus: u32,
    pub max_vram_gb: f64,
}

/// Value snapshot of a session, attached to session-level events. Copied
/// at emission time so consumers never observe later mutation.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub pod: String,
    pub timestamp: DateTime<Utc>,
    pub status: SessionStatus,
    pub cpu: Option<UtilState>,
    pub gpu: Option<UtilState>,
    pub memory: Option<UtilState>,
    pub vram_gb: f64,
    pub max_session_cpus: f64,
    pub max_session_memory_gb: f64,
    pub max_session_gpus: u32,
    pub max_session_vram_gb: f64,
    pub current_training_max_cpus: f64,
    pub current_training_max_memory_gb: f64,
    pub current_training_max_gpus: u32,
    pub current_training_max_vram_gb: f64,
    pub init_delay_ms: i64,
}

impl SessionSnapshot {
    pub fn empty(pod: &str) -> Self {
        Self {
            pod: pod.to_string(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            status: SessionStatus::Init,
            cpu: None,
            gpu: None,
            memory: None,
            vram_gb: 0.0,
            max_session_cpus: 0.0,
            max_session_memory_gb: 0.0,
            max_session_gpus: 0,
            max_session_vram_gb: 0.0,
            current_training_max_cpus: 0.0,
            current_training_max_memory_gb: 0.0,
            current_training_max_gpus: 0,
            current_training_max_vram_gb: 0.0,
            init_delay_ms: 0,
        }
    }
}

enum StepError {
    /// The event cannot be applied yet; it has been deferred.
    Pending,
    Transition(SynthesisError),
}

/// Per-session lifecycle state machine.
pub struct SessionLifecycle {
    pod: String,
    config: ReadinessConfig,
    envelope: SessionEnvelope,
    status: SessionStatus,
    /// Bitmask of dimensions that have reported the condition currently
    /// being waited for (readiness while initializing, stop while
    /// stopping).
    flags: u8,
    timestamp: DateTime<Utc>,
    inited_at: Option<DateTime<Utc>>,
    init_delay_ms: i64,
    cpu: Option<UtilState>,
    gpu: Option<UtilState>,
    memory: Option<UtilState>,
    vram_gb: f64,
    pending: VecDeque<Event>,
}

impl SessionLifecycle {
    pub fn new(pod: &str, envelope: SessionEnvelope, config: ReadinessConfig) -> Self {
        Self {
            pod: pod.to_string(),
            config,
            envelope,
            status: SessionStatus::Init,
            flags: 0,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            inited_at: None,
            init_delay_ms: 0,
            cpu: None,
            gpu: None,
            memory: None,
            vram_gb: 0.0,
            pending: VecDeque::new(),
        }
    }

    pub fn pod(&self) -> &str {
        &self.pod
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Applies one resource event, returning the session-level events it
    /// triggered. Deferred events are re-evaluated in their original order
    /// after every applied event, until a full pass makes no progress.
    pub fn apply(&mut self, event: &Event) -> Result<Vec<SessionEventKind>, SynthesisError> {
        self.timestamp = event.timestamp;

        let mut emitted = match self.step(event) {
            Ok(events) => events,
            Err(StepError::Pending) => return Ok(Vec::new()),
            Err(StepError::Transition(error)) => return Err(error),
        };

        while !self.pending.is_empty() {
            let batch: Vec<Event> = self.pending.drain(..).collect();
            let before = batch.len();
            for pending_event in &batch {
                match self.step(pending_event) {
                    Ok(more) => emitted.extend(more),
                    Err(StepError::Pending) => {} // re-deferred by step
                    Err(StepError::Transition(error)) => return Err(error),
                }
            }
            if self.pending.len() == before {
                break;
            }
        }

        Ok(emitted)
    }

    fn step(&mut self, event: &Event) -> Result<Vec<SessionEventKind>, StepError> {
        let EventName::Resource {
            kind,
            event: resource_event,
        } = event.name
        else {
            return Err(self.unexpected(event));
        };
        let EventPayload::Resource(util) = &event.payload else {
            return Err(self.unexpected(event));
        };
        let util = util.clone();

        use ResourceEventKind::*;
        use ResourceKind::*;

        match self.status {
            SessionStatus::Init => match resource_event {
                Started => {
                    self.store_util(kind, util);
                    self.status = SessionStatus::Initializing;
                    self.inited_at = Some(event.timestamp);
                    self.flags = dim_bit(kind) & self.config.ready_dims;
                    let mut emitted = vec![SessionEventKind::SessionStarted];
                    if self.flags == self.config.ready_dims {
                        self.status = SessionStatus::Idle;
                        emitted.push(SessionEventKind::SessionReady);
                    }
                    Ok(emitted)
                }
                _ => Err(self.unexpected(event)),
            },
            SessionStatus::Initializing => match resource_event {
                Started => {
                    self.store_util(kind, util);
                    self.flags |= dim_bit(kind) & self.config.ready_dims;
                    if let Some(inited_at) = self.inited_at {
                        self.init_delay_ms = (event.timestamp - inited_at).num_milliseconds();
                    }
                    if self.flags == self.config.ready_dims {
                        self.status = SessionStatus::Idle;
                        return Ok(vec![SessionEventKind::SessionReady]);
                    }
                    Ok(Vec::new())
                }
                _ => {
                    // Activity before all dimensions have started; apply it
                    // once the session is ready.
                    self.defer(event);
                    Err(StepError::Pending)
                }
            },
            SessionStatus::Idle => match (kind, resource_event) {
                (Cpu, Activated) | (Cpu, Deactivated) => Ok(Vec::new()),
                (Gpu, Activated) => {
                    self.store_util(kind, util);
                    self.status = SessionStatus::Training;
                    Ok(vec![SessionEventKind::TrainingStarted])
                }
                (Cpu, Stopped) | (Gpu, Stopped) => {
                    self.store_util(kind, util);
                    self.status = SessionStatus::Stopping;
                    self.flags = dim_bit(kind) & self.config.stop_dims;
                    if self.flags == self.config.stop_dims {
                        self.status = SessionStatus::Stopped;
                        return Ok(vec![SessionEventKind::SessionStopped]);
                    }
                    Ok(Vec::new())
                }
                (Memory, Stopped) => {
                    self.store_util(kind, util);
                    Ok(Vec::new())
                }
                _ => Err(self.unexpected(event)),
            },
            SessionStatus::Training => match (kind, resource_event) {
                (Gpu, Deactivated) => {
                    self.store_util(kind, util);
                    self.status = SessionStatus::Idle;
                    Ok(vec![SessionEventKind::TrainingEnded])
                }
                (Cpu, Activated) | (Cpu, Deactivated) => Ok(Vec::new()),
                (Cpu, Stopped) => {
                    // A pod can outlive its trace: the CPU stops while the
                    // GPU only deactivates a tick later. Hold the stop
                    // until training completes.
                    self.cpu = Some(util);
                    self.defer(event);
                    Err(StepError::Pending)
                }
                (Memory, Stopped) => {
                    self.store_util(kind, util);
                    Ok(Vec::new())
                }
                _ => Err(self.unexpected(event)),
            },
            SessionStatus::Stopping => {
                match (kind, resource_event) {
                    (Cpu, Stopped) | (Gpu, Stopped) => {
                        self.store_util(kind, util);
                        self.flags |= dim_bit(kind) & self.config.stop_dims;
                    }
                    (Gpu, Started)
                        if self
                            .gpu
                            .as_ref()
                            .is_some_and(|gpu| gpu.status == UtilStatus::Stopped) =>
                    {
                        // Readings regained after a trace gap.
                        self.store_util(kind, util);
                        self.status = SessionStatus::Idle;
                        return Ok(Vec::new());
                    }
                    (Cpu, Deactivated) | (Memory, Stopped) => return Ok(Vec::new()),
                    _ => return Err(self.unexpected(event)),
                }
                if self.flags == self.config.stop_dims {
                    self.status = SessionStatus::Stopped;
                    return Ok(vec![SessionEventKind::SessionStopped]);
                }
                Ok(Vec::new())
            }
            SessionStatus::Stopped => match (kind, resource_event) {
                (Memory, Stopped) => Ok(Vec::new()),
                _ => Err(self.unexpected(event)),
            },
        }
    }

    fn defer(&mut self, event: &Event) {
        self.pending.push_back(event.clone());
    }

    fn store_util(&mut self, kind: ResourceKind, util: UtilState) {
        match kind {
            ResourceKind::Cpu => self.cpu = Some(util),
            ResourceKind::Gpu => {
                self.vram_gb = util.vram_gb;
                self.gpu = Some(util);
            }
            ResourceKind::Memory => self.memory = Some(util),
        }
    }

    fn unexpected(&self, event: &Event) -> StepError {
        StepError::Transition(SynthesisError::UnexpectedSessionTransition {
            session: self.pod.clone(),
            status: self.status,
            event: event.name.to_string(),
        })
    }

    /// Value snapshot for event payloads. The current-training ceilings are
    /// zero here; the synthesizer fills them in from the max-utilization
    /// provider.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            pod: self.pod.clone(),
            timestamp: self.timestamp,
            status: self.status,
            cpu: self.cpu.clone(),
            gpu: self.gpu.clone(),
            memory: self.memory.clone(),
            vram_gb: self.vram_gb,
            max_session_cpus: self.envelope.max_cpus,
            max_session_memory_gb: self.envelope.max_memory_gb,
            max_session_gpus: self.envelope.max_gpus,
            max_session_vram_gb: self.envelope.max_vram_gb,
            current_training_max_cpus: 0.0,
            current_training_max_memory_gb: 0.0,
            current_training_max_gpus: 0,
            current_training_max_vram_gb: 0.0,
            init_delay_ms: self.init_delay_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tick(n: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(n * 60, 0).unwrap()
    }

    fn resource_event(
        kind: ResourceKind,
        event: ResourceEventKind,
        ts: DateTime<Utc>,
        status: UtilStatus,
    ) -> Event {
        let util = UtilState {
            pod: "session-1".to_string(),
            timestamp: ts,
            value: 10.0,
            max: 10.0,
            status,
            repeat: 0,
            devices: 1,
            vram_gb: 0.0,
            raw_timestamp: ts,
        };
        Event {
            name: EventName::Resource { kind, event },
            session_id: "session-1".to_string(),
            timestamp: ts,
            adjusted_ns: 0,
            local_index: 0,
            global_index: 0,
            source: 0,
            payload: EventPayload::Resource(util),
        }
    }

    fn new_session() -> SessionLifecycle {
        SessionLifecycle::new("session-1", SessionEnvelope::default(), ReadinessConfig::default())
    }

    #[test]
    fn test_ready_requires_cpu_and_gpu_in_any_order() {
        for (first, second) in [
            (ResourceKind::Cpu, ResourceKind::Gpu),
            (ResourceKind::Gpu, ResourceKind::Cpu),
        ] {
            let mut session = new_session();

            let events = session
                .apply(&resource_event(
                    first,
                    ResourceEventKind::Started,
                    tick(0),
                    UtilStatus::Idle,
                ))
                .unwrap();
            assert_eq!(events, vec![SessionEventKind::SessionStarted]);
            assert_eq!(session.status(), SessionStatus::Initializing);

            let events = session
                .apply(&resource_event(
                    second,
                    ResourceEventKind::Started,
                    tick(1),
                    UtilStatus::Idle,
                ))
                .unwrap();
            assert_eq!(events, vec![SessionEventKind::SessionReady]);
            assert_eq!(session.status(), SessionStatus::Idle);
        }
    }

    #[test]
    fn test_memory_does_not_gate_readiness() {
        let mut session = new_session();

        session
            .apply(&resource_event(
                ResourceKind::Memory,
                ResourceEventKind::Started,
                tick(0),
                UtilStatus::Idle,
            ))
            .unwrap();
        session
            .apply(&resource_event(
                ResourceKind::Cpu,
                ResourceEventKind::Started,
                tick(0),
                UtilStatus::Idle,
            ))
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Initializing);

        let events = session
            .apply(&resource_event(
                ResourceKind::Gpu,
                ResourceEventKind::Started,
                tick(1),
                UtilStatus::Idle,
            ))
            .unwrap();
        assert_eq!(events, vec![SessionEventKind::SessionReady]);
    }

    fn ready_session() -> SessionLifecycle {
        let mut session = new_session();
        session
            .apply(&resource_event(
                ResourceKind::Cpu,
                ResourceEventKind::Started,
                tick(0),
                UtilStatus::Idle,
            ))
            .unwrap();
        session
            .apply(&resource_event(
                ResourceKind::Gpu,
                ResourceEventKind::Started,
                tick(0),
                UtilStatus::Idle,
            ))
            .unwrap();
        session
    }

    #[test]
    fn test_training_cycle() {
        let mut session = ready_session();

        let events = session
            .apply(&resource_event(
                ResourceKind::Gpu,
                ResourceEventKind::Activated,
                tick(1),
                UtilStatus::Busy,
            ))
            .unwrap();
        assert_eq!(events, vec![SessionEventKind::TrainingStarted]);
        assert_eq!(session.status(), SessionStatus::Training);

        let events = session
            .apply(&resource_event(
                ResourceKind::Gpu,
                ResourceEventKind::Deactivated,
                tick(4),
                UtilStatus::Idle,
            ))
            .unwrap();
        assert_eq!(events, vec![SessionEventKind::TrainingEnded]);
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[test]
    fn test_cpu_stop_during_training_is_deferred() {
        let mut session = ready_session();
        session
            .apply(&resource_event(
                ResourceKind::Gpu,
                ResourceEventKind::Activated,
                tick(1),
                UtilStatus::Busy,
            ))
            .unwrap();

        // CPU stops while the session is still training: no state change.
        let events = session
            .apply(&resource_event(
                ResourceKind::Cpu,
                ResourceEventKind::Stopped,
                tick(2),
                UtilStatus::Stopped,
            ))
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(session.status(), SessionStatus::Training);

        // Training ends; the deferred CPU stop is applied right after.
        let events = session
            .apply(&resource_event(
                ResourceKind::Gpu,
                ResourceEventKind::Deactivated,
                tick(3),
                UtilStatus::Idle,
            ))
            .unwrap();
        assert_eq!(events, vec![SessionEventKind::TrainingEnded]);
        assert_eq!(session.status(), SessionStatus::Stopping);

        let events = session
            .apply(&resource_event(
                ResourceKind::Gpu,
                ResourceEventKind::Stopped,
                tick(4),
                UtilStatus::Stopped,
            ))
            .unwrap();
        assert_eq!(events, vec![SessionEventKind::SessionStopped]);
        assert_eq!(session.status(), SessionStatus::Stopped);
    }

    #[test]
    fn test_stop_requires_all_stop_dimensions() {
        let mut session = ready_session();

        let events = session
            .apply(&resource_event(
                ResourceKind::Cpu,
                ResourceEventKind::Stopped,
                tick(5),
                UtilStatus::Stopped,
            ))
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(session.status(), SessionStatus::Stopping);

        let events = session
            .apply(&resource_event(
                ResourceKind::Gpu,
                ResourceEventKind::Stopped,
                tick(6),
                UtilStatus::Stopped,
            ))
            .unwrap();
        assert_eq!(events, vec![SessionEventKind::SessionStopped]);
    }

    #[test]
    fn test_gpu_restart_during_stopping_returns_to_idle() {
        let mut session = ready_session();

        session
            .apply(&resource_event(
                ResourceKind::Gpu,
                ResourceEventKind::Stopped,
                tick(5),
                UtilStatus::Stopped,
            ))
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Stopping);

        let events = session
            .apply(&resource_event(
                ResourceKind::Gpu,
                ResourceEventKind::Started,
                tick(6),
                UtilStatus::Idle,
            ))
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[test]
    fn test_unexpected_event_leaves_state_unchanged() {
        let mut session = ready_session();

        let result = session.apply(&resource_event(
            ResourceKind::Gpu,
            ResourceEventKind::Deactivated,
            tick(1),
            UtilStatus::Idle,
        ));
        assert!(result.is_err());
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[test]
    fn test_activity_before_ready_is_deferred_until_ready() {
        let mut session = new_session();
        session
            .apply(&resource_event(
                ResourceKind::Gpu,
                ResourceEventKind::Started,
                tick(0),
                UtilStatus::Idle,
            ))
            .unwrap();

        // GPU activates before the CPU trace has started the session.
        let events = session
            .apply(&resource_event(
                ResourceKind::Gpu,
                ResourceEventKind::Activated,
                tick(1),
                UtilStatus::Busy,
            ))
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(session.status(), SessionStatus::Initializing);

        // Once ready, the deferred activation fires a training start.
        let events = session
            .apply(&resource_event(
                ResourceKind::Cpu,
                ResourceEventKind::Started,
                tick(2),
                UtilStatus::Idle,
            ))
            .unwrap();
        assert_eq!(
            events,
            vec![SessionEventKind::SessionReady, SessionEventKind::TrainingStarted]
        );
        assert_eq!(session.status(), SessionStatus::Training);
    }
}
