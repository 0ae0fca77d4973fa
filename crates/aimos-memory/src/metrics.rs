//! Process-wide counters for the memory store.
//!
//! The registry is explicit: call [`init`] once at startup and reach it with
//! [`global`]. Stores can also be handed a private registry, which is what
//! the tests do.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Upper bounds (seconds) of the snapshot-duration histogram buckets.
pub const DURATION_BUCKETS: [f64; 8] = [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

/// How many recent snapshot durations are kept verbatim.
pub const RECENT_DURATIONS: usize = 10;

static GLOBAL: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();

/// Initialise the process-wide registry. Later calls return the same one.
pub fn init() -> Arc<MetricsRegistry> {
    GLOBAL.get_or_init(|| Arc::new(MetricsRegistry::new())).clone()
}

/// The process-wide registry, initialising it on first use.
pub fn global() -> Arc<MetricsRegistry> {
    init()
}

/// Counter set for atoms, snapshots and write failures.
pub struct MetricsRegistry {
    atoms_created: AtomicU64,
    snapshots_created: AtomicU64,
    write_errors: AtomicU64,
    atoms_by_modality: DashMap<String, u64>,
    /// One slot per bucket plus the overflow slot.
    histogram: [AtomicU64; DURATION_BUCKETS.len() + 1],
    recent: Mutex<VecDeque<f64>>,
}

/// Serializable copy of the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub atoms_created: u64,
    pub snapshots_created: u64,
    pub write_errors: u64,
    pub atoms_by_modality: BTreeMap<String, u64>,
    /// `(upper bound label, count)`; the last entry is `+Inf`.
    pub snapshot_duration_buckets: Vec<(String, u64)>,
    pub recent_snapshot_durations: Vec<f64>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            atoms_created: AtomicU64::new(0),
            snapshots_created: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            atoms_by_modality: DashMap::new(),
            histogram: Default::default(),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_DURATIONS)),
        }
    }

    /// Count a created atom; returns the running total.
    pub fn record_atom(&self, modality: &str) -> u64 {
        *self
            .atoms_by_modality
            .entry(modality.to_string())
            .or_insert(0) += 1;
        self.atoms_created.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count a snapshot and its duration in seconds; returns the running total.
    pub fn record_snapshot(&self, seconds: f64) -> u64 {
        let bucket = DURATION_BUCKETS
            .iter()
            .position(|upper| seconds <= *upper)
            .unwrap_or(DURATION_BUCKETS.len());
        self.histogram[bucket].fetch_add(1, Ordering::Relaxed);

        let mut recent = self.recent.lock();
        if recent.len() == RECENT_DURATIONS {
            recent.pop_front();
        }
        recent.push_back(seconds);
        drop(recent);

        self.snapshots_created.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn atoms_created(&self) -> u64 {
        self.atoms_created.load(Ordering::Relaxed)
    }

    pub fn snapshots_created(&self) -> u64 {
        self.snapshots_created.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    /// Most recent snapshot durations, oldest first.
    pub fn recent_snapshot_durations(&self) -> Vec<f64> {
        self.recent.lock().iter().copied().collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let labels = DURATION_BUCKETS
            .iter()
            .map(|b| b.to_string())
            .chain(std::iter::once("+Inf".to_string()));
        MetricsSnapshot {
            atoms_created: self.atoms_created(),
            snapshots_created: self.snapshots_created(),
            write_errors: self.write_errors(),
            atoms_by_modality: self
                .atoms_by_modality
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            snapshot_duration_buckets: labels
                .zip(self.histogram.iter().map(|c| c.load(Ordering::Relaxed)))
                .collect(),
            recent_snapshot_durations: self.recent_snapshot_durations(),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.atoms_created.store(0, Ordering::Relaxed);
        self.snapshots_created.store(0, Ordering::Relaxed);
        self.write_errors.store(0, Ordering::Relaxed);
        self.atoms_by_modality.clear();
        for slot in &self.histogram {
            slot.store(0, Ordering::Relaxed);
        }
        self.recent.lock().clear();
    }
}
