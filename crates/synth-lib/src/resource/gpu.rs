//! Multi-device GPU aggregation
//!
//! GPU traces report one row per physical device. All rows sharing a
//! timestamp are folded into one logical utilization (summed value, device
//! count, max VRAM) before the tick is committed, so the state machine and
//! everything downstream see one reading per pod per tick. The aggregate is
//! concluded only when a later timestamp (or garbage collection) arrives.

use super::{DebounceConfig, StateMachine, UtilState, UtilStatus};
use crate::error::SynthesisError;
use crate::events::{ResourceEventKind, ResourceKind};
use chrono::{DateTime, Utc};

/// Outcome of concluding one buffered GPU tick: the transition events, a
/// snapshot of the committed state, and the transition error if the
/// observed sequence was inexplicable (events collected before the error
/// are still valid).
#[derive(Debug)]
pub struct ConcludedTick {
    pub events: Vec<ResourceEventKind>,
    pub snapshot: UtilState,
    pub error: Option<SynthesisError>,
}

/// Aggregates per-device GPU readings into per-tick commits on top of the
/// shared state machine.
#[derive(Debug, Clone)]
pub struct GpuAggregator {
    machine: StateMachine,
    pending: Option<UtilState>,
}

impl GpuAggregator {
    pub fn new(pod: &str, config: DebounceConfig) -> Self {
        Self {
            machine: StateMachine::new(ResourceKind::Gpu, pod, config),
            pending: None,
        }
    }

    /// The last concluded (committed) state.
    pub fn current(&self) -> &UtilState {
        self.machine.current()
    }

    /// Timestamp of the tick currently being accumulated, if any.
    pub fn pending_timestamp(&self) -> Option<DateTime<Utc>> {
        self.pending.as_ref().map(|p| p.timestamp)
    }

    /// Feeds one device reading. Readings sharing the buffered timestamp
    /// accumulate; a newer timestamp concludes the buffered tick first and
    /// returns its outcome.
    pub fn observe(
        &mut self,
        timestamp: DateTime<Utc>,
        value: f64,
        vram_gb: f64,
    ) -> Option<ConcludedTick> {
        if let Some(pending) = &mut self.pending {
            if pending.timestamp == timestamp {
                Self::accumulate_into(pending, value, vram_gb);
                return None;
            }
        }
        let concluded = self.conclude(false);
        self.seed(timestamp, value, vram_gb);
        concluded
    }

    /// Starts buffering a new tick, discarding nothing: callers that need
    /// the previous tick must conclude it first.
    pub fn seed(&mut self, timestamp: DateTime<Utc>, value: f64, vram_gb: f64) {
        self.pending = Some(self.machine.seed_state(timestamp, value, vram_gb));
    }

    /// Folds another device's reading into the buffered tick.
    pub fn accumulate(&mut self, value: f64, vram_gb: f64) {
        if let Some(pending) = &mut self.pending {
            Self::accumulate_into(pending, value, vram_gb);
        }
    }

    fn accumulate_into(pending: &mut UtilState, value: f64, vram_gb: f64) {
        pending.devices += 1;
        pending.value += value;
        if vram_gb > pending.vram_gb {
            pending.vram_gb = vram_gb;
        }
        // Accumulation only ever promotes towards Busy.
        if pending.value > 0.0 {
            pending.status = UtilStatus::Busy;
        }
    }

    /// Commits the buffered tick (if any) and runs the transition function.
    pub fn conclude(&mut self, force: bool) -> Option<ConcludedTick> {
        let pending = self.pending.take()?;
        self.machine.commit_state(pending);

        let mut events = Vec::new();
        let error = self.machine.transit(&mut events, force).err();
        Some(ConcludedTick {
            events,
            snapshot: self.machine.current().clone(),
            error,
        })
    }

    /// Establishes an idle baseline at `timestamp` with the given device
    /// count, committed immediately. Used by the template sequencer, which
    /// fabricates session-start states instead of reading a trace.
    pub fn prime(&mut self, timestamp: DateTime<Utc>, devices: u32) {
        let mut state = self.machine.seed_state(timestamp, 0.0, 0.0);
        state.devices = devices.max(1);
        self.machine.commit_state(state.clone());
        self.pending = Some(state);
    }

    /// Commits a synthetic zero-value tick, driving the stop debounce.
    pub fn reset(&mut self, timestamp: DateTime<Utc>, force: bool) -> ConcludedTick {
        self.machine.reset(timestamp);
        let mut events = Vec::new();
        let error = self.machine.transit(&mut events, force).err();
        ConcludedTick {
            events,
            snapshot: self.machine.current().clone(),
            error,
        }
    }

    /// Garbage-collects a pod with no reading at `timestamp`: the buffered
    /// tick (if any) is concluded, then a synthetic zero-value tick drives
    /// the stop debounce. Outcomes are returned in delivery order.
    pub fn collect_garbage(&mut self, timestamp: DateTime<Utc>, force: bool) -> Vec<ConcludedTick> {
        let mut outcomes = Vec::new();

        if let Some(tick) = self.conclude(force) {
            outcomes.push(tick);
        }
        outcomes.push(self.reset(timestamp, force));

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tick(n: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(n * 60, 0).unwrap()
    }

    #[test]
    fn test_same_timestamp_readings_aggregate() {
        let mut agg = GpuAggregator::new("pod-1", DebounceConfig::gpu());

        assert!(agg.observe(tick(0), 30.0, 8.0).is_none());
        assert!(agg.observe(tick(0), 50.0, 16.0).is_none());
        assert!(agg.observe(tick(0), 20.0, 4.0).is_none());

        // The aggregate concludes when the next tick arrives.
        let concluded = agg.observe(tick(1), 10.0, 8.0).unwrap();
        assert_eq!(concluded.snapshot.devices, 3);
        assert_eq!(concluded.snapshot.value, 100.0);
        assert_eq!(concluded.snapshot.vram_gb, 16.0);
        assert!(concluded.error.is_none());
        assert_eq!(
            concluded.events,
            vec![ResourceEventKind::Started, ResourceEventKind::Activated]
        );
    }

    #[test]
    fn test_zero_utilization_tick_is_idle() {
        let mut agg = GpuAggregator::new("pod-1", DebounceConfig::gpu());

        agg.observe(tick(0), 0.0, 0.0);
        let concluded = agg.observe(tick(1), 0.0, 0.0).unwrap();

        assert_eq!(concluded.snapshot.status, UtilStatus::Idle);
        assert_eq!(concluded.events, vec![ResourceEventKind::Started]);
    }

    #[test]
    fn test_garbage_collection_concludes_then_resets() {
        let mut agg = GpuAggregator::new("pod-1", DebounceConfig::gpu());

        agg.observe(tick(0), 40.0, 8.0);
        let outcomes = agg.collect_garbage(tick(1), false);

        // First outcome concludes the buffered busy tick, second commits
        // the synthetic zero reading (held in the stop debounce).
        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            outcomes[0].events,
            vec![ResourceEventKind::Started, ResourceEventKind::Activated]
        );
        assert_eq!(outcomes[1].events, vec![ResourceEventKind::Deactivated]);
        assert_eq!(outcomes[1].snapshot.status, UtilStatus::Stopping);
    }

    #[test]
    fn test_forced_garbage_collection_stops_immediately() {
        let mut agg = GpuAggregator::new("pod-1", DebounceConfig::gpu());

        agg.observe(tick(0), 40.0, 8.0);
        let outcomes = agg.collect_garbage(tick(1), true);

        let last = outcomes.last().unwrap();
        assert!(last.events.contains(&ResourceEventKind::Stopped));
        assert_eq!(last.snapshot.status, UtilStatus::Stopped);
    }

    #[test]
    fn test_device_count_survives_reset() {
        let mut agg = GpuAggregator::new("pod-1", DebounceConfig::gpu());

        agg.observe(tick(0), 10.0, 8.0);
        agg.observe(tick(0), 10.0, 8.0);
        agg.observe(tick(1), 10.0, 8.0);
        agg.observe(tick(1), 10.0, 8.0);

        let outcomes = agg.collect_garbage(tick(2), false);
        assert_eq!(outcomes.last().unwrap().snapshot.devices, 2);
    }
}
