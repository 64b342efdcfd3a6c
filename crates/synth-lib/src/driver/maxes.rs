//! Pre-run maxima tracking
//!
//! During a pre-run pass each driver records, per session, the lifetime
//! maximum utilization and the maximum within each training interval (plus
//! per-physical-device maxima for GPU traces). The maps are written from
//! the driver's own task and read by the synthesizer task, so they sit
//! behind a read/write lock. Updates take the shared lock first and only
//! upgrade to the exclusive lock when there is actually something to write,
//! re-verifying after the upgrade.

use std::collections::HashMap;
use std::sync::RwLock;
use tracing::warn;

/// Device slots tracked per pod for GPU traces.
const GPU_SLOTS: usize = 8;

#[derive(Debug, Default)]
struct MaxMaps {
    /// Lifetime maximum utilization per session.
    session_maxes: HashMap<String, f64>,
    /// Device count observed at the lifetime maximum (GPU only).
    session_devices: HashMap<String, u32>,
    /// Maximum utilization within each training interval, in order.
    training_maxes: HashMap<String, Vec<f64>>,
    /// Device count at the maximum of each training interval (GPU only).
    training_devices: HashMap<String, Vec<u32>>,
    /// Lifetime per-device maxima (GPU only).
    per_device_session: HashMap<String, [f64; GPU_SLOTS]>,
    /// Per-device maxima within each training interval (GPU only).
    per_device_training: HashMap<String, Vec<[f64; GPU_SLOTS]>>,
    /// Whether the session is currently inside a training interval.
    currently_training: HashMap<String, bool>,
}

/// Thread-safe recorder for pre-run utilization maxima.
#[derive(Debug, Default)]
pub struct SessionMaxTracker {
    inner: RwLock<MaxMaps>,
}

impl SessionMaxTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sure the session has a first training slot, so recording
    /// never has to special-case an unseen session.
    pub fn ensure_session(&self, session_id: &str) {
        {
            let maps = self.inner.read().expect("maxes lock poisoned");
            if maps.training_maxes.contains_key(session_id) {
                return;
            }
        }
        let mut maps = self.inner.write().expect("maxes lock poisoned");
        maps.training_maxes
            .entry(session_id.to_string())
            .or_insert_with(|| vec![0.0]);
        maps.training_devices
            .entry(session_id.to_string())
            .or_insert_with(|| vec![0]);
    }

    /// Records a committed utilization value. `devices` is only meaningful
    /// for GPU traces and rides along with the utilization maxima.
    pub fn record_value(&self, session_id: &str, value: f64, devices: u32) {
        // Optimistic read: most readings are below both running maxima and
        // need no write lock at all.
        {
            let maps = self.inner.read().expect("maxes lock poisoned");
            let below_session = maps
                .session_maxes
                .get(session_id)
                .is_some_and(|max| value <= *max);
            let training = maps
                .currently_training
                .get(session_id)
                .copied()
                .unwrap_or(false);
            let below_training = !training
                || maps
                    .training_maxes
                    .get(session_id)
                    .and_then(|maxes| maxes.last())
                    .is_some_and(|max| value <= *max);
            if below_session && below_training {
                return;
            }
        }

        let mut guard = self.inner.write().expect("maxes lock poisoned");
        let maps = &mut *guard;

        let session_max = maps.session_maxes.entry(session_id.to_string()).or_insert(0.0);
        if value > *session_max || *session_max == 0.0 {
            *session_max = value;
            maps.session_devices.insert(session_id.to_string(), devices);
        }

        let training = maps
            .currently_training
            .get(session_id)
            .copied()
            .unwrap_or(false);
        if training {
            let maxes = maps
                .training_maxes
                .entry(session_id.to_string())
                .or_insert_with(|| vec![0.0]);
            let slot = maxes.len() - 1;
            if value > maxes[slot] {
                maxes[slot] = value;
                let device_slots = maps
                    .training_devices
                    .entry(session_id.to_string())
                    .or_insert_with(|| vec![0]);
                if let Some(last) = device_slots.last_mut() {
                    *last = devices;
                }
            }
        }
    }

    /// Records one physical device's reading (GPU traces only).
    pub fn record_device_value(&self, session_id: &str, device: usize, value: f64) {
        if device >= GPU_SLOTS {
            warn!(session_id, device, "device index beyond tracked slots");
            return;
        }

        {
            let maps = self.inner.read().expect("maxes lock poisoned");
            let below_session = maps
                .per_device_session
                .get(session_id)
                .is_some_and(|slots| value <= slots[device]);
            let training = maps
                .currently_training
                .get(session_id)
                .copied()
                .unwrap_or(false);
            let below_training = !training
                || maps
                    .per_device_training
                    .get(session_id)
                    .and_then(|runs| runs.last())
                    .is_some_and(|slots| value <= slots[device]);
            if below_session && below_training {
                return;
            }
        }

        let mut guard = self.inner.write().expect("maxes lock poisoned");
        let maps = &mut *guard;

        let slots = maps
            .per_device_session
            .entry(session_id.to_string())
            .or_insert([0.0; GPU_SLOTS]);
        if value > slots[device] {
            slots[device] = value;
        }

        let training = maps
            .currently_training
            .get(session_id)
            .copied()
            .unwrap_or(false);
        if training {
            let runs = maps
                .per_device_training
                .entry(session_id.to_string())
                .or_insert_with(|| vec![[0.0; GPU_SLOTS]]);
            if let Some(current) = runs.last_mut() {
                if value > current[device] {
                    current[device] = value;
                }
            }
        }
    }

    /// Called by the synthesizer when a training-started event is observed
    /// during a pre-run pass: readings start filling the current slot.
    pub fn training_started(&self, session_id: &str) {
        let mut maps = self.inner.write().expect("maxes lock poisoned");
        if maps
            .currently_training
            .insert(session_id.to_string(), true)
            .unwrap_or(false)
        {
            warn!(session_id, "training started for an already-training session");
        }
        maps.per_device_training
            .entry(session_id.to_string())
            .or_default()
            .push([0.0; GPU_SLOTS]);
    }

    /// Called when a training-ended event is observed: the current slot is
    /// sealed and an empty one appended for the next interval.
    pub fn training_ended(&self, session_id: &str) {
        let mut maps = self.inner.write().expect("maxes lock poisoned");
        maps.currently_training
            .insert(session_id.to_string(), false);
        maps.training_maxes
            .entry(session_id.to_string())
            .or_default()
            .push(0.0);
        maps.training_devices
            .entry(session_id.to_string())
            .or_default()
            .push(0);
    }

    pub fn session_maxes(&self) -> HashMap<String, f64> {
        self.inner
            .read()
            .expect("maxes lock poisoned")
            .session_maxes
            .clone()
    }

    pub fn session_devices(&self) -> HashMap<String, u32> {
        self.inner
            .read()
            .expect("maxes lock poisoned")
            .session_devices
            .clone()
    }

    /// Per-training maxima, with the trailing not-yet-started slot trimmed.
    pub fn training_maxes(&self) -> HashMap<String, Vec<f64>> {
        let maps = self.inner.read().expect("maxes lock poisoned");
        maps.training_maxes
            .iter()
            .map(|(session, maxes)| {
                let mut maxes = maxes.clone();
                if maxes.len() > 1 && maxes.last() == Some(&0.0) {
                    maxes.pop();
                }
                (session.clone(), maxes)
            })
            .collect()
    }

    pub fn training_devices(&self) -> HashMap<String, Vec<u32>> {
        let maps = self.inner.read().expect("maxes lock poisoned");
        maps.training_devices
            .iter()
            .map(|(session, devices)| {
                let mut devices = devices.clone();
                if devices.len() > 1 && devices.last() == Some(&0) {
                    devices.pop();
                }
                (session.clone(), devices)
            })
            .collect()
    }

    pub fn per_device_session_maxes(&self) -> HashMap<String, [f64; GPU_SLOTS]> {
        self.inner
            .read()
            .expect("maxes lock poisoned")
            .per_device_session
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifetime_max_tracks_largest_value() {
        let tracker = SessionMaxTracker::new();
        tracker.ensure_session("s1");

        tracker.record_value("s1", 10.0, 0);
        tracker.record_value("s1", 80.0, 0);
        tracker.record_value("s1", 40.0, 0);

        assert_eq!(tracker.session_maxes()["s1"], 80.0);
    }

    #[test]
    fn test_training_slots_fill_only_while_training() {
        let tracker = SessionMaxTracker::new();
        tracker.ensure_session("s1");

        tracker.record_value("s1", 30.0, 0);
        tracker.training_started("s1");
        tracker.record_value("s1", 50.0, 0);
        tracker.record_value("s1", 70.0, 0);
        tracker.training_ended("s1");
        tracker.record_value("s1", 90.0, 0);

        assert_eq!(tracker.training_maxes()["s1"], vec![70.0]);
        assert_eq!(tracker.session_maxes()["s1"], 90.0);
    }

    #[test]
    fn test_multiple_training_intervals_get_separate_slots() {
        let tracker = SessionMaxTracker::new();
        tracker.ensure_session("s1");

        tracker.training_started("s1");
        tracker.record_value("s1", 50.0, 2);
        tracker.training_ended("s1");
        tracker.training_started("s1");
        tracker.record_value("s1", 25.0, 1);
        tracker.training_ended("s1");

        assert_eq!(tracker.training_maxes()["s1"], vec![50.0, 25.0]);
        assert_eq!(tracker.training_devices()["s1"], vec![2, 1]);
    }

    #[test]
    fn test_per_device_maxima() {
        let tracker = SessionMaxTracker::new();
        tracker.ensure_session("s1");

        tracker.record_device_value("s1", 0, 30.0);
        tracker.record_device_value("s1", 1, 60.0);
        tracker.record_device_value("s1", 0, 10.0);

        let slots = tracker.per_device_session_maxes();
        assert_eq!(slots["s1"][0], 30.0);
        assert_eq!(slots["s1"][1], 60.0);
    }

    #[test]
    fn test_out_of_range_device_is_ignored() {
        let tracker = SessionMaxTracker::new();
        tracker.record_device_value("s1", 99, 30.0);
        assert!(tracker.per_device_session_maxes().is_empty());
    }
}
