//! Template-driven event sequencing
//!
//! Builds session lifecycle events directly from an explicit workload
//! template, without trace files or gap detection. Each session's private
//! CPU/GPU/memory state machines are stepped exactly twice per training
//! interval (into the interval's utilization and back to zero), and the
//! resulting events are staged in a min-heap keyed by timestamp.
//!
//! Templates are validated in full before any event is produced: a
//! structural violation fails the whole synthesis with
//! [`SynthesisError::InvalidConfiguration`] and no partial output.

use crate::error::SynthesisError;
use crate::events::{
    ts_nanos, Event, EventConsumer, EventIndexAllocator, EventName, EventPayload, OrderedEvent,
    ResourceKind, SessionEventKind,
};
use crate::models::{SessionTemplate, TrainingTemplate};
use crate::resource::{DebounceConfig, GpuAggregator, StateMachine};
use crate::session::{SessionSnapshot, SessionStatus};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

/// One registered session: its resource ceilings, private state machines,
/// and the ceilings of the training interval currently in effect.
struct SequencedSession {
    pod: String,
    status: SessionStatus,
    max_cpus: f64,
    max_memory_gb: f64,
    max_gpus: u32,
    max_vram_gb: f64,
    current_training_max_cpus: f64,
    current_training_max_memory_gb: f64,
    current_training_max_gpus: u32,
    current_training_max_vram_gb: f64,
    cpu: StateMachine,
    gpu: GpuAggregator,
    memory: StateMachine,
}

impl SequencedSession {
    fn new(template: &SessionTemplate) -> Self {
        Self {
            pod: template.id.clone(),
            status: SessionStatus::Init,
            max_cpus: template.max_cpus,
            max_memory_gb: template.max_memory_gb,
            max_gpus: template.max_gpus,
            max_vram_gb: template.max_vram_gb,
            current_training_max_cpus: 0.0,
            current_training_max_memory_gb: 0.0,
            current_training_max_gpus: 0,
            current_training_max_vram_gb: 0.0,
            cpu: StateMachine::new(ResourceKind::Cpu, &template.id, DebounceConfig::cpu()),
            gpu: GpuAggregator::new(&template.id, DebounceConfig::gpu()),
            memory: StateMachine::new(
                ResourceKind::Memory,
                &template.id,
                DebounceConfig::memory(),
            ),
        }
    }

    fn step_cpu(&mut self, ts: DateTime<Utc>, util: f64) {
        self.cpu.commit(ts, util);
    }

    fn step_gpu(&mut self, ts: DateTime<Utc>, utils: &[f64], vram_gb: f64) {
        if utils.is_empty() {
            return;
        }
        // Conclude whatever tick is buffered, then buffer this one with
        // every device folded in.
        let _ = self.gpu.conclude(false);
        self.gpu.seed(ts, utils[0], vram_gb);
        for util in &utils[1..] {
            self.gpu.accumulate(*util, vram_gb);
        }
    }

    fn step_memory(&mut self, ts: DateTime<Utc>, util: f64) {
        self.memory.commit(ts, util);
    }

    fn snapshot(&self, ts: DateTime<Utc>) -> SessionSnapshot {
        SessionSnapshot {
            pod: self.pod.clone(),
            timestamp: ts,
            status: self.status,
            cpu: Some(self.cpu.current().clone()),
            gpu: Some(self.gpu.current().clone()),
            memory: Some(self.memory.current().clone()),
            vram_gb: self.gpu.current().vram_gb,
            max_session_cpus: self.max_cpus,
            max_session_memory_gb: self.max_memory_gb,
            max_session_gpus: self.max_gpus,
            max_session_vram_gb: self.max_vram_gb,
            current_training_max_cpus: self.current_training_max_cpus,
            current_training_max_memory_gb: self.current_training_max_memory_gb,
            current_training_max_gpus: self.current_training_max_gpus,
            current_training_max_vram_gb: self.current_training_max_vram_gb,
            init_delay_ms: 0,
        }
    }
}

/// Synthesizes session lifecycle events from a workload template.
pub struct TemplateEventSequencer {
    sessions: HashMap<String, SequencedSession>,
    heap: BinaryHeap<Reverse<OrderedEvent>>,
    /// Events staged until the next machine step, so their payload
    /// reflects the state at that later moment.
    waiting: HashMap<String, Event>,
    indices: EventIndexAllocator,
    start_seconds: i64,
    tick_seconds: i64,
    approximate_final_tick: i64,
}

impl TemplateEventSequencer {
    pub fn new(start_seconds: i64, tick_seconds: i64) -> Self {
        debug!(
            start_seconds,
            tick_seconds, "created template event sequencer"
        );
        Self {
            sessions: HashMap::new(),
            heap: BinaryHeap::new(),
            waiting: HashMap::new(),
            indices: EventIndexAllocator::new(),
            start_seconds,
            tick_seconds,
            approximate_final_tick: 0,
        }
    }

    /// Validates every session of the template and sequences their events.
    /// Nothing is produced if any session is invalid.
    pub fn sequence_templates(
        templates: &[SessionTemplate],
        start_seconds: i64,
        tick_seconds: i64,
    ) -> Result<Self, SynthesisError> {
        if templates.is_empty() {
            return Err(SynthesisError::InvalidConfiguration(
                "workload template contains no sessions".to_string(),
            ));
        }

        for template in templates {
            validate_session(template)?;
            validate_trainings_against_session(template)?;
        }

        let mut sequencer = Self::new(start_seconds, tick_seconds);
        for template in templates {
            sequencer.register_session(template)?;
            sequencer.add_session_started(&template.id, template.start_tick)?;
            for training in &template.trainings {
                sequencer.add_training(&template.id, training)?;
            }
            sequencer.add_session_terminated(&template.id, template.stop_tick)?;

            sequencer.approximate_final_tick = sequencer.approximate_final_tick.max(
                template
                    .trainings
                    .iter()
                    .map(TrainingTemplate::end_tick)
                    .max()
                    .unwrap_or(0)
                    .max(template.stop_tick),
            );
        }

        Ok(sequencer)
    }

    /// The last tick any sequenced session is active, for consumers that
    /// size their simulation up front.
    pub fn approximate_final_tick(&self) -> i64 {
        self.approximate_final_tick
    }

    /// Number of staged events.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drains the staged events into the consumer in timestamp order.
    pub async fn submit_all(mut self, consumer: &dyn EventConsumer) {
        while let Some(Reverse(OrderedEvent(event))) = self.heap.pop() {
            debug!(
                event_name = %event.name,
                session_id = %event.session_id,
                timestamp = %event.timestamp,
                local_index = event.local_index,
                "submitting sequenced event"
            );
            consumer.submit_event(event).await;
        }
    }

    fn tick_time(&self, tick: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(self.start_seconds + tick * self.tick_seconds, 0)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    fn register_session(&mut self, template: &SessionTemplate) -> Result<(), SynthesisError> {
        if self.sessions.contains_key(&template.id) {
            return Err(SynthesisError::InvalidConfiguration(format!(
                "session {:?} is declared more than once",
                template.id
            )));
        }
        self.sessions
            .insert(template.id.clone(), SequencedSession::new(template));
        debug!(
            session_id = %template.id,
            max_cpus = template.max_cpus,
            max_memory_gb = template.max_memory_gb,
            max_gpus = template.max_gpus,
            "registered session"
        );
        Ok(())
    }

    fn session_mut(&mut self, session_id: &str) -> Result<&mut SequencedSession, SynthesisError> {
        self.sessions.get_mut(session_id).ok_or_else(|| {
            SynthesisError::InvalidConfiguration(format!(
                "session {session_id:?} has not been registered"
            ))
        })
    }

    /// Establishes the session's idle baseline at its start tick and stages
    /// the ready event; its payload is attached at the next step so it
    /// reflects the committed baseline.
    fn add_session_started(
        &mut self,
        session_id: &str,
        tick: i64,
    ) -> Result<(), SynthesisError> {
        let ts = self.tick_time(tick);
        let session = self.session_mut(session_id)?;

        session.step_cpu(ts, 0.0);
        session.gpu.prime(ts, 1);
        session.step_memory(ts, 0.0);
        session.status = SessionStatus::Idle;

        let (local_index, global_index) = self.indices.next(session_id);
        let event = Event {
            name: EventName::Session(SessionEventKind::SessionReady),
            session_id: session_id.to_string(),
            timestamp: ts,
            adjusted_ns: ts_nanos(&ts),
            local_index,
            global_index,
            source: 0,
            payload: EventPayload::Session(SessionSnapshot::empty(session_id)),
        };
        self.waiting.insert(session_id.to_string(), event);
        Ok(())
    }

    /// Steps the machines into the interval's utilization and back to zero,
    /// staging the training-started event and holding training-ended until
    /// the next step.
    fn add_training(
        &mut self,
        session_id: &str,
        training: &TrainingTemplate,
    ) -> Result<(), SynthesisError> {
        let start = self.tick_time(training.start_tick);
        let end = self.tick_time(training.end_tick());

        {
            let session = self.session_mut(session_id)?;
            session.step_cpu(start, training.cpu_util);
            session.step_gpu(start, &training.gpu_util, training.vram_gb);
            session.step_memory(start, training.memory_gb);

            session.status = SessionStatus::Training;
            session.current_training_max_cpus = training.cpu_util;
            session.current_training_max_memory_gb = training.memory_gb;
            session.current_training_max_gpus = training.active_gpus();
            session.current_training_max_vram_gb = training.vram_gb;
        }

        self.submit_waiting_event(session_id)?;

        let snapshot = self.session_mut(session_id)?.snapshot(start);
        let (local_index, global_index) = self.indices.next(session_id);
        self.heap.push(Reverse(OrderedEvent(Event {
            name: EventName::Session(SessionEventKind::TrainingStarted),
            session_id: session_id.to_string(),
            timestamp: start,
            adjusted_ns: ts_nanos(&start),
            local_index,
            global_index,
            source: 0,
            payload: EventPayload::Session(snapshot),
        })));

        {
            let session = self.session_mut(session_id)?;
            session.step_cpu(end, 0.0);
            session.step_gpu(end, &training.gpu_util, training.vram_gb);
            session.step_memory(end, 0.0);
            session.status = SessionStatus::Idle;
        }

        let (local_index, global_index) = self.indices.next(session_id);
        let ended = Event {
            name: EventName::Session(SessionEventKind::TrainingEnded),
            session_id: session_id.to_string(),
            timestamp: end,
            adjusted_ns: ts_nanos(&end),
            local_index,
            global_index,
            source: 0,
            payload: EventPayload::Session(SessionSnapshot::empty(session_id)),
        };
        self.waiting.insert(session_id.to_string(), ended);
        Ok(())
    }

    /// Steps the machines to zero at the stop tick, flushes the held event,
    /// and stages the stopped event.
    fn add_session_terminated(
        &mut self,
        session_id: &str,
        tick: i64,
    ) -> Result<(), SynthesisError> {
        let ts = self.tick_time(tick);

        {
            let session = self.session_mut(session_id)?;
            session.step_cpu(ts, 0.0);
            session.step_gpu(ts, &[0.0], 0.0);
            session.step_memory(ts, 0.0);
        }

        self.submit_waiting_event(session_id)?;

        // Step once more to commit the zero-utilization entries, so the
        // stop payload carries them.
        let session = self.session_mut(session_id)?;
        session.step_cpu(ts, 0.0);
        session.step_gpu(ts, &[0.0], 0.0);
        session.step_memory(ts, 0.0);
        session.status = SessionStatus::Stopped;
        let snapshot = session.snapshot(ts);

        let (local_index, global_index) = self.indices.next(session_id);
        self.heap.push(Reverse(OrderedEvent(Event {
            name: EventName::Session(SessionEventKind::SessionStopped),
            session_id: session_id.to_string(),
            timestamp: ts,
            adjusted_ns: ts_nanos(&ts),
            local_index,
            global_index,
            source: 0,
            payload: EventPayload::Session(snapshot),
        })));
        Ok(())
    }

    /// Attaches the current session snapshot to the held event and moves it
    /// onto the heap.
    fn submit_waiting_event(&mut self, session_id: &str) -> Result<(), SynthesisError> {
        let Some(mut event) = self.waiting.remove(session_id) else {
            return Ok(());
        };
        let ts = event.timestamp;
        let snapshot = self.session_mut(session_id)?.snapshot(ts);
        event.payload = EventPayload::Session(snapshot);
        self.heap.push(Reverse(OrderedEvent(event)));
        Ok(())
    }
}

fn invalid(message: String) -> SynthesisError {
    SynthesisError::InvalidConfiguration(message)
}

fn validate_session(session: &SessionTemplate) -> Result<(), SynthesisError> {
    if session.id.is_empty() {
        return Err(invalid("session id cannot be empty".to_string()));
    }
    if session.max_cpus < 0.0 {
        return Err(invalid(format!(
            "session {:?}: max CPUs ({}) must be greater than or equal to 0",
            session.id, session.max_cpus
        )));
    }
    if session.max_memory_gb < 0.0 {
        return Err(invalid(format!(
            "session {:?}: max memory ({} GB) must be greater than or equal to 0",
            session.id, session.max_memory_gb
        )));
    }
    if session.start_tick < 0 {
        return Err(invalid(format!(
            "session {:?}: start tick ({}) must be greater than or equal to 0",
            session.id, session.start_tick
        )));
    }
    if session.start_tick > session.stop_tick {
        return Err(invalid(format!(
            "session {:?}: start tick ({}) occurs after stop tick ({}); the session must \
             start before it can be terminated",
            session.id, session.start_tick, session.stop_tick
        )));
    }

    for (index, training) in session.trainings.iter().enumerate() {
        if training.duration_ticks <= 0 {
            return Err(invalid(format!(
                "session {:?}, training #{index}: duration ({} ticks) must be strictly \
                 greater than 0",
                session.id, training.duration_ticks
            )));
        }
        if session.start_tick > training.start_tick {
            return Err(invalid(format!(
                "session {:?}, training #{index}: session start tick ({}) occurs after the \
                 training start tick ({}); the session must start before it can train",
                session.id, session.start_tick, training.start_tick
            )));
        }
        if training.start_tick > session.stop_tick {
            return Err(invalid(format!(
                "session {:?}, training #{index}: training start tick ({}) occurs after the \
                 session stop tick ({}); a session cannot start training after termination",
                session.id, training.start_tick, session.stop_tick
            )));
        }
        if training.end_tick() > session.stop_tick {
            return Err(invalid(format!(
                "session {:?}, training #{index}: training would conclude at tick {} after \
                 the session terminates at tick {}",
                session.id,
                training.end_tick(),
                session.stop_tick
            )));
        }
    }

    Ok(())
}

fn validate_trainings_against_session(session: &SessionTemplate) -> Result<(), SynthesisError> {
    for (index, training) in session.trainings.iter().enumerate() {
        if training.cpu_util > session.max_cpus {
            return Err(invalid(format!(
                "session {:?}, training #{index}: training CPU utilization ({}) cannot exceed \
                 the session maximum ({})",
                session.id, training.cpu_util, session.max_cpus
            )));
        }
        if training.memory_gb > session.max_memory_gb {
            return Err(invalid(format!(
                "session {:?}, training #{index}: training memory usage ({} GB) cannot exceed \
                 the session maximum ({} GB)",
                session.id, training.memory_gb, session.max_memory_gb
            )));
        }
        if training.num_gpus() as u32 > session.max_gpus {
            return Err(invalid(format!(
                "session {:?}, training #{index}: training device count ({}) cannot exceed \
                 the session maximum ({})",
                session.id,
                training.num_gpus(),
                session.max_gpus
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct Collector {
        events: Mutex<Vec<Event>>,
    }

    #[async_trait::async_trait]
    impl EventConsumer for Collector {
        async fn submit_event(&self, event: Event) {
            self.events.lock().await.push(event);
        }
    }

    fn training(start_tick: i64, duration_ticks: i64, cpu_util: f64) -> TrainingTemplate {
        TrainingTemplate {
            start_tick,
            duration_ticks,
            cpu_util,
            memory_gb: 2.0,
            gpu_util: vec![75.0],
            vram_gb: 4.0,
        }
    }

    fn template(id: &str, start_tick: i64, stop_tick: i64) -> SessionTemplate {
        SessionTemplate {
            id: id.to_string(),
            max_cpus: 100.0,
            max_memory_gb: 8.0,
            max_gpus: 2,
            max_vram_gb: 8.0,
            start_tick,
            stop_tick,
            trainings: Vec::new(),
        }
    }

    async fn sequence_and_collect(templates: &[SessionTemplate]) -> Vec<Event> {
        let sequencer = TemplateEventSequencer::sequence_templates(templates, 0, 1).unwrap();
        let collector = Collector {
            events: Mutex::new(Vec::new()),
        };
        sequencer.submit_all(&collector).await;
        collector.events.into_inner()
    }

    #[tokio::test]
    async fn test_single_session_single_training_sequence() {
        let mut session = template("session-1", 0, 10);
        session.trainings.push(training(2, 3, 50.0));

        let events = sequence_and_collect(&[session]).await;

        let names: Vec<String> = events.iter().map(|e| e.name.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "session-ready",
                "training-started",
                "training-ended",
                "session-stopped"
            ]
        );
        let seconds: Vec<i64> = events.iter().map(|e| e.timestamp.timestamp()).collect();
        assert_eq!(seconds, vec![0, 2, 5, 10]);

        match &events[1].payload {
            EventPayload::Session(snapshot) => {
                assert_eq!(snapshot.current_training_max_cpus, 50.0);
                assert_eq!(snapshot.current_training_max_gpus, 1);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        // Local indices reconstruct the per-session order.
        let locals: Vec<u64> = events.iter().map(|e| e.local_index).collect();
        assert_eq!(locals, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_training_ending_at_stop_tick_sorts_before_stop() {
        let mut session = template("session-1", 0, 5);
        session.trainings.push(training(2, 3, 50.0));

        let events = sequence_and_collect(&[session]).await;
        let names: Vec<String> = events.iter().map(|e| e.name.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "session-ready",
                "training-started",
                "training-ended",
                "session-stopped"
            ]
        );
        assert_eq!(events[2].timestamp, events[3].timestamp);
    }

    #[tokio::test]
    async fn test_sessions_interleave_by_timestamp() {
        let mut first = template("session-1", 0, 10);
        first.trainings.push(training(4, 2, 10.0));
        let second = template("session-2", 3, 6);

        let events = sequence_and_collect(&[first, second]).await;
        let summary: Vec<(String, i64)> = events
            .iter()
            .map(|e| (e.name.to_string(), e.timestamp.timestamp()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("session-ready".to_string(), 0),
                ("session-ready".to_string(), 3),
                ("training-started".to_string(), 4),
                ("training-ended".to_string(), 6),
                ("session-stopped".to_string(), 6),
                ("session-stopped".to_string(), 10),
            ]
        );
    }

    #[test]
    fn test_training_before_session_start_is_rejected() {
        let mut session = template("session-1", 5, 10);
        session.trainings.push(training(2, 2, 10.0));

        let result = TemplateEventSequencer::sequence_templates(&[session], 0, 1);
        assert!(matches!(
            result,
            Err(SynthesisError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_training_exceeding_session_maxima_is_rejected() {
        let mut session = template("session-1", 0, 10);
        session.trainings.push(training(2, 3, 500.0));

        let result = TemplateEventSequencer::sequence_templates(&[session], 0, 1);
        assert!(matches!(
            result,
            Err(SynthesisError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_training_overrunning_stop_tick_is_rejected() {
        let mut session = template("session-1", 0, 4);
        session.trainings.push(training(2, 3, 10.0));

        let result = TemplateEventSequencer::sequence_templates(&[session], 0, 1);
        assert!(matches!(
            result,
            Err(SynthesisError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_duplicate_session_ids_are_rejected() {
        let sessions = vec![template("session-1", 0, 10), template("session-1", 0, 8)];

        let result = TemplateEventSequencer::sequence_templates(&sessions, 0, 1);
        assert!(matches!(
            result,
            Err(SynthesisError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_empty_template_is_rejected() {
        let result = TemplateEventSequencer::sequence_templates(&[], 0, 1);
        assert!(matches!(
            result,
            Err(SynthesisError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_approximate_final_tick() {
        let mut first = template("session-1", 0, 10);
        first.trainings.push(training(2, 3, 10.0));
        let second = template("session-2", 0, 25);

        let sequencer =
            TemplateEventSequencer::sequence_templates(&[first, second], 0, 1).unwrap();
        assert_eq!(sequencer.approximate_final_tick(), 25);
    }
}
