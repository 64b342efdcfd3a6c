//! Per-resource utilization state machines
//!
//! Each machine turns a stream of numeric readings for one pod into
//! discrete lifecycle transitions (`Started`, `Activated`, `Deactivated`,
//! `Stopped`), debouncing the deactivation and stop edges so transient dips
//! and short trace gaps do not produce event churn.

mod gpu;

pub use gpu::{ConcludedTick, GpuAggregator};

use crate::error::SynthesisError;
use crate::events::{ResourceEventKind, ResourceKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Discrete utilization status of one resource dimension for one pod.
///
/// `IdleDelay` and `Stopping` are debounce states: the machine holds there
/// until the underlying condition has persisted for the configured number of
/// consecutive ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UtilStatus {
    Stopped,
    Idle,
    IdleDelay,
    Busy,
    Stopping,
}

impl UtilStatus {
    /// Collapses the debounce states onto the status they are holding for,
    /// used when counting consecutive equivalent ticks.
    fn equivalent(self) -> UtilStatus {
        match self {
            UtilStatus::IdleDelay => UtilStatus::Idle,
            UtilStatus::Stopping => UtilStatus::Stopped,
            other => other,
        }
    }
}

impl fmt::Display for UtilStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UtilStatus::Stopped => "Stopped",
            UtilStatus::Idle => "Idle",
            UtilStatus::IdleDelay => "IdleDelay",
            UtilStatus::Busy => "Busy",
            UtilStatus::Stopping => "Stopping",
        };
        write!(f, "{name}")
    }
}

/// Debounce thresholds for one resource kind.
#[derive(Debug, Clone, Copy)]
pub struct DebounceConfig {
    /// Readings above this value classify as `Busy`; `None` disables
    /// activation entirely (the resource only ever starts and stops).
    pub activation_threshold: Option<f64>,
    /// Consecutive idle ticks required before `Deactivated` is emitted.
    pub deactivation_delay: u32,
    /// Consecutive missing ticks required before `Stopped` is emitted.
    pub stop_delay: u32,
}

impl DebounceConfig {
    /// CPU defaults: deactivate after 3 consecutive idles, stop after 10
    /// consecutive missing readings.
    pub fn cpu() -> Self {
        Self {
            activation_threshold: Some(1.0),
            deactivation_delay: 2,
            stop_delay: 9,
        }
    }

    /// GPU defaults: the stop delay is much shorter than the CPU one; both
    /// values come from the trace data this engine was tuned against.
    pub fn gpu() -> Self {
        Self {
            activation_threshold: Some(0.0),
            deactivation_delay: 2,
            stop_delay: 2,
        }
    }

    /// Memory defaults: activation disabled, memory only starts and stops.
    pub fn memory() -> Self {
        Self {
            activation_threshold: None,
            deactivation_delay: 2,
            stop_delay: 9,
        }
    }

    pub fn for_kind(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Cpu => Self::cpu(),
            ResourceKind::Gpu => Self::gpu(),
            ResourceKind::Memory => Self::memory(),
        }
    }
}

/// Utilization of one resource dimension at one committed tick.
///
/// This is the value type carried as event payload: a copy is taken at
/// emission time, so consumers never observe later in-place mutation.
#[derive(Debug, Clone, Serialize)]
pub struct UtilState {
    pub pod: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// Running lifetime maximum of `value` for this pod.
    pub max: f64,
    pub status: UtilStatus,
    /// Consecutive ticks the (equivalent) status has held.
    pub repeat: u32,
    /// Number of physical devices aggregated into this reading (GPU only).
    pub devices: u32,
    /// Maximum VRAM in GB across the aggregated devices (GPU only).
    pub vram_gb: f64,
    /// Timestamp of the first tick of the current status run.
    pub raw_timestamp: DateTime<Utc>,
}

impl UtilState {
    fn initial(pod: &str) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            pod: pod.to_string(),
            timestamp: epoch,
            value: 0.0,
            max: 0.0,
            status: UtilStatus::Stopped,
            repeat: 0,
            devices: 0,
            vram_gb: 0.0,
            raw_timestamp: epoch,
        }
    }
}

/// State machine tracking one resource dimension for one pod.
///
/// Holds exactly two states: the current one and the previously committed
/// one. Every commit rotates current into previous, so the transition
/// function can always compare "last vs. current" without an unbounded
/// history chain.
#[derive(Debug, Clone)]
pub struct StateMachine {
    kind: ResourceKind,
    config: DebounceConfig,
    current: UtilState,
    previous: Option<UtilState>,
}

impl StateMachine {
    pub fn new(kind: ResourceKind, pod: &str, config: DebounceConfig) -> Self {
        Self {
            kind,
            config,
            current: UtilState::initial(pod),
            previous: None,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn current(&self) -> &UtilState {
        &self.current
    }

    pub fn previous(&self) -> Option<&UtilState> {
        self.previous.as_ref()
    }

    fn classify(&self, value: f64) -> UtilStatus {
        match self.config.activation_threshold {
            Some(threshold) if value > threshold => UtilStatus::Busy,
            _ => UtilStatus::Idle,
        }
    }

    /// Builds an uncommitted state for the given reading, classified but
    /// with no repeat accounting. Used by the GPU aggregation buffer.
    pub(crate) fn seed_state(&self, timestamp: DateTime<Utc>, value: f64, vram_gb: f64) -> UtilState {
        UtilState {
            pod: self.current.pod.clone(),
            timestamp,
            value,
            max: 0.0,
            status: self.classify(value),
            repeat: 0,
            devices: 1,
            vram_gb,
            raw_timestamp: timestamp,
        }
    }

    /// Commits a reading: the current state is archived and the new reading
    /// becomes current, with the repeat counter carried forward when the
    /// (equivalent) status holds.
    pub fn commit(&mut self, timestamp: DateTime<Utc>, value: f64) -> &UtilState {
        let state = self.seed_state(timestamp, value, 0.0);
        self.commit_state(state)
    }

    /// Commits a pre-built state (e.g. a concluded GPU aggregate).
    pub fn commit_state(&mut self, mut state: UtilState) -> &UtilState {
        let prev = std::mem::replace(&mut self.current, UtilState::initial(&state.pod));

        state.max = prev.max.max(state.value);
        if prev.status.equivalent() == state.status.equivalent() {
            state.repeat = prev.repeat + 1;
            state.raw_timestamp = prev.raw_timestamp;
        }

        self.current = state;
        self.previous = Some(prev);
        &self.current
    }

    /// Commits a synthetic zero-value reading for a tick with no
    /// observation, driving the stop debounce forward.
    pub fn reset(&mut self, timestamp: DateTime<Utc>) -> &UtilState {
        let pod = self.current.pod.clone();
        let prev = std::mem::replace(&mut self.current, UtilState::initial(&pod));

        let repeat = match prev.status {
            UtilStatus::Stopping | UtilStatus::Stopped => prev.repeat + 1,
            _ => 0,
        };

        self.current = UtilState {
            pod: prev.pod.clone(),
            timestamp,
            value: 0.0,
            max: prev.max,
            status: UtilStatus::Stopped,
            repeat,
            devices: prev.devices,
            vram_gb: 0.0,
            raw_timestamp: timestamp,
        };
        self.previous = Some(prev);
        &self.current
    }

    /// Walks the transition rules from the previously committed status to
    /// the current one, appending emitted events to `events`.
    ///
    /// Chains of transitions are resolved in one call (e.g. a busy pod that
    /// vanished yields `Deactivated` followed by the stop debounce). Events
    /// appended before an error are still valid and should be delivered.
    /// `force` bypasses both debounces; used at teardown.
    pub fn transit(
        &mut self,
        events: &mut Vec<ResourceEventKind>,
        force: bool,
    ) -> Result<(), SynthesisError> {
        let mut last = self
            .previous
            .as_ref()
            .map(|p| p.status)
            .unwrap_or(UtilStatus::Stopped);

        loop {
            let status = self.current.status;
            let repeat = self.current.repeat;
            if last == status {
                return Ok(());
            }

            match last {
                UtilStatus::Stopped => {
                    if status == UtilStatus::Idle || status == UtilStatus::Busy {
                        last = UtilStatus::Idle;
                        events.push(ResourceEventKind::Started);
                        continue;
                    }
                    return Err(self.unexpected(last));
                }
                UtilStatus::Idle => {
                    if status == UtilStatus::Busy {
                        last = UtilStatus::Busy;
                        events.push(ResourceEventKind::Activated);
                        continue;
                    } else if status == UtilStatus::Stopped
                        && (force || repeat >= self.config.stop_delay)
                    {
                        last = UtilStatus::Stopped;
                        events.push(ResourceEventKind::Stopped);
                        continue;
                    } else if status == UtilStatus::Stopped {
                        self.current.status = UtilStatus::Stopping;
                        return Ok(());
                    }
                    return Err(self.unexpected(last));
                }
                UtilStatus::IdleDelay => {
                    if status == UtilStatus::Idle && repeat < self.config.deactivation_delay {
                        self.current.status = UtilStatus::IdleDelay;
                        return Ok(());
                    } else if status == UtilStatus::Idle || status == UtilStatus::Stopped {
                        last = UtilStatus::Idle;
                        events.push(ResourceEventKind::Deactivated);
                        continue;
                    } else if status == UtilStatus::Busy {
                        // The dip ended before the delay elapsed; the
                        // pending deactivation is silently cancelled.
                        last = UtilStatus::Busy;
                        continue;
                    }
                    return Err(self.unexpected(last));
                }
                UtilStatus::Busy => {
                    if (status == UtilStatus::Idle && repeat >= self.config.deactivation_delay)
                        || status == UtilStatus::Stopped
                    {
                        last = UtilStatus::Idle;
                        events.push(ResourceEventKind::Deactivated);
                        continue;
                    } else if status == UtilStatus::Idle {
                        self.current.status = UtilStatus::IdleDelay;
                        return Ok(());
                    }
                    return Err(self.unexpected(last));
                }
                UtilStatus::Stopping => {
                    if status == UtilStatus::Stopped && !force && repeat < self.config.stop_delay {
                        self.current.status = UtilStatus::Stopping;
                        return Ok(());
                    } else if status == UtilStatus::Stopped {
                        last = UtilStatus::Stopped;
                        events.push(ResourceEventKind::Stopped);
                        continue;
                    } else {
                        // A reading is available again; the pending stop is
                        // cancelled.
                        last = UtilStatus::Idle;
                        continue;
                    }
                }
            }
        }
    }

    fn unexpected(&self, from: UtilStatus) -> SynthesisError {
        SynthesisError::UnexpectedResourceTransition {
            kind: self.kind,
            pod: self.current.pod.clone(),
            from,
            to: self.current.status,
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

    fn transit(machine: &mut StateMachine, force: bool) -> Vec<ResourceEventKind> {
        let mut events = Vec::new();
        machine.transit(&mut events, force).unwrap();
        events
    }

    #[test]
    fn test_first_busy_reading_emits_started_and_activated() {
        let mut machine = StateMachine::new(ResourceKind::Cpu, "pod-1", DebounceConfig::cpu());

        machine.commit(tick(0), 50.0);
        let events = transit(&mut machine, false);

        assert_eq!(
            events,
            vec![ResourceEventKind::Started, ResourceEventKind::Activated]
        );
    }

    #[test]
    fn test_first_idle_reading_emits_started_only() {
        let mut machine = StateMachine::new(ResourceKind::Cpu, "pod-1", DebounceConfig::cpu());

        machine.commit(tick(0), 0.5);
        let events = transit(&mut machine, false);

        assert_eq!(events, vec![ResourceEventKind::Started]);
    }

    #[test]
    fn test_short_dip_emits_no_events() {
        let mut machine = StateMachine::new(ResourceKind::Cpu, "pod-1", DebounceConfig::cpu());

        machine.commit(tick(0), 50.0);
        transit(&mut machine, false);

        // Busy -> Idle -> Busy within fewer ticks than the delay.
        machine.commit(tick(1), 0.0);
        assert!(transit(&mut machine, false).is_empty());
        machine.commit(tick(2), 80.0);
        assert!(transit(&mut machine, false).is_empty());
    }

    #[test]
    fn test_sustained_idle_emits_exactly_one_deactivated() {
        let mut machine = StateMachine::new(ResourceKind::Cpu, "pod-1", DebounceConfig::cpu());

        machine.commit(tick(0), 50.0);
        transit(&mut machine, false);

        let mut all_events = Vec::new();
        for n in 1..=10 {
            machine.commit(tick(n), 0.0);
            all_events.extend(transit(&mut machine, false));
        }

        assert_eq!(all_events, vec![ResourceEventKind::Deactivated]);
    }

    #[test]
    fn test_stop_debounce_via_synthetic_resets() {
        let mut machine = StateMachine::new(ResourceKind::Cpu, "pod-1", DebounceConfig::cpu());

        machine.commit(tick(0), 0.5);
        transit(&mut machine, false);

        let delay = DebounceConfig::cpu().stop_delay;
        let mut stopped_at = None;
        for n in 1..=20 {
            machine.reset(tick(n));
            let events = transit(&mut machine, false);
            if events.contains(&ResourceEventKind::Stopped) {
                stopped_at = Some(n);
                break;
            }
        }

        // The first reset holds the machine in Stopping with repeat 0, so
        // the stop fires once `repeat` reaches the delay.
        assert_eq!(stopped_at, Some(i64::from(delay) + 1));
    }

    #[test]
    fn test_force_bypasses_stop_debounce() {
        let mut machine = StateMachine::new(ResourceKind::Cpu, "pod-1", DebounceConfig::cpu());

        machine.commit(tick(0), 50.0);
        transit(&mut machine, false);

        machine.reset(tick(1));
        let events = transit(&mut machine, true);

        assert_eq!(
            events,
            vec![ResourceEventKind::Deactivated, ResourceEventKind::Stopped]
        );
    }

    #[test]
    fn test_reading_during_stopping_cancels_pending_stop() {
        let mut machine = StateMachine::new(ResourceKind::Cpu, "pod-1", DebounceConfig::cpu());

        machine.commit(tick(0), 0.5);
        transit(&mut machine, false);

        machine.reset(tick(1));
        assert!(transit(&mut machine, false).is_empty());

        // A real reading arrives before the stop delay elapses.
        machine.commit(tick(2), 0.5);
        assert!(transit(&mut machine, false).is_empty());
        assert_eq!(machine.current().status, UtilStatus::Idle);
    }

    #[test]
    fn test_memory_never_reports_busy() {
        let mut machine =
            StateMachine::new(ResourceKind::Memory, "pod-1", DebounceConfig::memory());

        machine.commit(tick(0), 4.0e9);
        let events = transit(&mut machine, false);
        assert_eq!(events, vec![ResourceEventKind::Started]);
        assert_eq!(machine.current().status, UtilStatus::Idle);

        machine.commit(tick(1), 9.0e9);
        assert!(transit(&mut machine, false).is_empty());
    }

    #[test]
    fn test_running_max_carries_across_commits() {
        let mut machine = StateMachine::new(ResourceKind::Cpu, "pod-1", DebounceConfig::cpu());

        machine.commit(tick(0), 30.0);
        machine.commit(tick(1), 80.0);
        machine.commit(tick(2), 10.0);

        assert_eq!(machine.current().max, 80.0);
    }

    #[test]
    fn test_repeat_counts_equivalent_statuses() {
        let mut machine = StateMachine::new(ResourceKind::Cpu, "pod-1", DebounceConfig::cpu());

        machine.commit(tick(0), 50.0);
        transit(&mut machine, false);

        machine.commit(tick(1), 0.0);
        transit(&mut machine, false);
        assert_eq!(machine.current().status, UtilStatus::IdleDelay);

        // IdleDelay counts as Idle, so the next idle reading continues the run.
        machine.commit(tick(2), 0.0);
        assert_eq!(machine.current().repeat, 1);
    }
}
