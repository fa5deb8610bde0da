use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::WindowConfig;
use crate::types::{Packet, RuleVerdict};

/// An anomalous packet retained in the window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowEntry {
    pub vehicle_id: String,
    pub observed_at: DateTime<Utc>,
    pub packet: Packet,
    pub verdict: RuleVerdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerState {
    Idle,
    Triggered,
}

/// Emitted once per upward crossing of the trigger threshold
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    /// Vehicle of the entry that crossed the threshold
    pub vehicle_id: String,
    /// Window contents at the crossing, oldest first
    pub entries: Vec<WindowEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub len: usize,
    pub capacity: usize,
    pub trigger_threshold: usize,
    pub state: TriggerState,
    pub total_appended: u64,
    pub total_evicted: u64,
    pub total_expired: u64,
    pub triggers_fired: u64,
}

/// Bounded FIFO of recent anomalies with one-shot trigger semantics.
///
/// The trigger re-arms only once the length falls strictly below the
/// threshold.
pub struct RollingWindow {
    entries: VecDeque<WindowEntry>,
    capacity: usize,
    threshold: usize,
    max_age: Option<Duration>,
    state: TriggerState,
    total_appended: u64,
    total_evicted: u64,
    total_expired: u64,
    triggers_fired: u64,
}

impl RollingWindow {
    pub fn new(capacity: usize, threshold: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            threshold: threshold.clamp(1, capacity),
            max_age: None,
            state: TriggerState::Idle,
            total_appended: 0,
            total_evicted: 0,
            total_expired: 0,
            triggers_fired: 0,
        }
    }

    pub fn from_config(config: &WindowConfig) -> Self {
        let window = Self::new(config.capacity, config.trigger_threshold);
        match config.max_age_secs {
            0 => window,
            secs => window.with_max_age(Duration::seconds(secs as i64)),
        }
    }

    /// Entries older than `max_age` relative to the newest entry are dropped
    /// on append.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Append, evict overflow and expired entries, then evaluate the trigger.
    pub fn append(&mut self, entry: WindowEntry) -> Option<TriggerEvent> {
        let newest = entry.observed_at;
        self.entries.push_back(entry);
        self.total_appended += 1;

        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.total_evicted += 1;
        }

        if let Some(max_age) = self.max_age {
            self.drop_older_than(newest - max_age);
        }

        self.evaluate_trigger()
    }

    /// Drop entries observed before `cutoff`. Can re-arm the trigger but never fires it.
    pub fn expire(&mut self, cutoff: DateTime<Utc>) -> usize {
        let dropped = self.drop_older_than(cutoff);
        if self.entries.len() < self.threshold {
            self.state = TriggerState::Idle;
        }
        dropped
    }

    fn drop_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut dropped = 0;
        while self.entries.front().is_some_and(|e| e.observed_at < cutoff) {
            self.entries.pop_front();
            dropped += 1;
        }
        self.total_expired += dropped as u64;
        dropped
    }

    fn evaluate_trigger(&mut self) -> Option<TriggerEvent> {
        if self.entries.len() < self.threshold {
            self.state = TriggerState::Idle;
            return None;
        }

        match self.state {
            TriggerState::Triggered => None,
            TriggerState::Idle => {
                self.state = TriggerState::Triggered;
                self.triggers_fired += 1;
                let vehicle_id = self
                    .entries
                    .back()
                    .map(|e| e.vehicle_id.clone())
                    .unwrap_or_default();
                Some(TriggerEvent {
                    vehicle_id,
                    entries: self.entries.iter().cloned().collect(),
                })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn snapshot(&self) -> Vec<WindowEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn stats(&self) -> WindowStats {
        WindowStats {
            len: self.entries.len(),
            capacity: self.capacity,
            trigger_threshold: self.threshold,
            state: self.state,
            total_appended: self.total_appended,
            total_evicted: self.total_evicted,
            total_expired: self.total_expired,
            triggers_fired: self.triggers_fired,
        }
    }
}

/// Thread-safe handle; every operation runs inside one critical section.
#[derive(Clone)]
pub struct SharedWindow {
    inner: Arc<Mutex<RollingWindow>>,
}

impl SharedWindow {
    pub fn new(window: RollingWindow) -> Self {
        Self {
            inner: Arc::new(Mutex::new(window)),
        }
    }

    // A panic elsewhere cannot leave the window half-updated, so a poisoned
    // lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, RollingWindow> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, entry: WindowEntry) -> Option<TriggerEvent> {
        self.lock().append(entry)
    }

    pub fn expire(&self, cutoff: DateTime<Utc>) -> usize {
        self.lock().expire(cutoff)
    }

    pub fn snapshot(&self) -> Vec<WindowEntry> {
        self.lock().snapshot()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn state(&self) -> TriggerState {
        self.lock().state()
    }

    pub fn stats(&self) -> WindowStats {
        self.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u64, at: DateTime<Utc>) -> WindowEntry {
        let mut packet = Packet::default();
        packet.sequence = seq;
        WindowEntry {
            vehicle_id: "VH001".into(),
            observed_at: at,
            packet,
            verdict: RuleVerdict::default(),
        }
    }

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-15T10:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn fires_once_on_upward_crossing() {
        let mut w = RollingWindow::new(300, 20);
        let mut fired_at = Vec::new();
        for i in 0..21u64 {
            if w.append(entry(i, base())).is_some() {
                fired_at.push(w.len());
            }
        }
        // lengths 18, 19, 20, 21 fire once, at 20
        assert_eq!(fired_at, vec![20]);
        assert_eq!(w.state(), TriggerState::Triggered);
    }

    #[test]
    fn fires_again_after_dropping_below_threshold() {
        let mut w = RollingWindow::new(300, 20);
        let mut fired = 0;
        for i in 0..20u64 {
            let at = base() + Duration::seconds(i as i64);
            fired += w.append(entry(i, at)).map_or(0, |_| 1);
        }
        assert_eq!(fired, 1);

        // 20 -> 19
        w.expire(base() + Duration::milliseconds(500));
        assert_eq!(w.len(), 19);
        assert_eq!(w.state(), TriggerState::Idle);

        // 19 -> 20
        let event = w.append(entry(20, base() + Duration::seconds(20)));
        assert!(event.is_some());
        assert_eq!(w.stats().triggers_fired, 2);
    }

    #[test]
    fn oscillating_at_threshold_without_dropping_below_does_not_refire() {
        // capacity == threshold: every append at the limit evicts one and stays at T
        let mut w = RollingWindow::new(20, 20);
        let fired: usize = (0..60u64)
            .filter_map(|i| w.append(entry(i, base())))
            .count();
        assert_eq!(fired, 1);
        assert_eq!(w.len(), 20);
    }

    #[test]
    fn capacity_is_never_exceeded_and_eviction_is_fifo() {
        let mut w = RollingWindow::new(300, 20);
        for i in 0..350u64 {
            w.append(entry(i, base()));
            assert!(w.len() <= 300);
        }
        let snapshot = w.snapshot();
        assert_eq!(snapshot.first().unwrap().packet.sequence, 50);
        assert_eq!(snapshot.last().unwrap().packet.sequence, 349);
        assert_eq!(w.stats().total_evicted, 50);
    }

    #[test]
    fn trigger_event_carries_window_contents() {
        let mut w = RollingWindow::new(10, 3);
        w.append(entry(1, base()));
        w.append(entry(2, base()));
        let event = w.append(entry(3, base())).unwrap();
        assert_eq!(event.vehicle_id, "VH001");
        let seqs: Vec<u64> = event.entries.iter().map(|e| e.packet.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn max_age_expiry_runs_before_trigger_check() {
        let mut w = RollingWindow::new(10, 3).with_max_age(Duration::seconds(60));
        w.append(entry(1, base()));
        w.append(entry(2, base() + Duration::seconds(30)));
        // first entry is 90s older than this one and drops, leaving 2 < 3
        let event = w.append(entry(3, base() + Duration::seconds(90)));
        assert!(event.is_none());
        assert_eq!(w.len(), 2);
        assert_eq!(w.stats().total_expired, 1);
    }

    #[test]
    fn shared_window_serializes_concurrent_appends() {
        let shared = SharedWindow::new(RollingWindow::new(300, 20));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let w = shared.clone();
                std::thread::spawn(move || {
                    (0..50u64)
                        .filter_map(|i| w.append(entry(t * 100 + i, base())))
                        .count()
                })
            })
            .collect();
        let fired: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(fired, 1);
        assert_eq!(shared.len(), 200);
    }
}
