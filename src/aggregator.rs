//! Bounded per-route sample windows and the statistics computed over them.
//!
//! Every ingested sample lands in two windows: the one for its route and the
//! all-routes window. Windows evict strictly first-in first-out. Snapshots copy
//! the window under the lock and do the sorting and arithmetic after releasing
//! it, so producers are only ever held up for the duration of a copy.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::models::{RouteKey, Sample};

pub const DEFAULT_WINDOW_CAPACITY: usize = 600;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WindowKey {
    All,
    Route(RouteKey),
}

#[derive(Debug, Clone)]
struct Entry {
    sample: Arc<Sample>,
    received: Instant,
}

/// Fixed-capacity FIFO of recent samples.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    entries: VecDeque<Entry>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, entries: VecDeque::with_capacity(capacity) }
    }

    fn push(&mut self, entry: Entry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples oldest first.
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.entries.iter().map(|e| e.sample.as_ref())
    }

    pub fn stats(&self) -> WindowStats {
        let last_received = self.entries.back().map(|e| e.received);
        WindowStats::compute(self.samples(), last_received.map(|at| at.elapsed()))
    }
}

/// Statistics over one window. Latency figures cover successful samples only
/// and are `None` when the window holds no successful sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub count: usize,
    pub failures: usize,
    pub success_pct: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub mean_ms: Option<f64>,
    pub last_ms: Option<f64>,
    #[serde(serialize_with = "ser_age_secs")]
    pub age: Option<Duration>,
}

impl WindowStats {
    pub fn compute<'a, I>(samples: I, age: Option<Duration>) -> Self
    where
        I: IntoIterator<Item = &'a Sample>,
    {
        let mut count = 0usize;
        let mut successes = 0usize;
        let mut latencies = Vec::new();

        for sample in samples {
            count += 1;
            if sample.success {
                successes += 1;
                if let Some(ms) = sample.latency_ms {
                    latencies.push(ms);
                }
            }
        }

        let last_ms = latencies.last().copied();
        let mean_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };
        // Stable sort: equal latencies keep arrival order.
        latencies.sort_by(|a, b| a.total_cmp(b));

        Self {
            count,
            failures: count - successes,
            success_pct: (count > 0).then(|| successes as f64 * 100.0 / count as f64),
            p50_ms: nearest_rank(&latencies, 50),
            p95_ms: nearest_rank(&latencies, 95),
            mean_ms,
            last_ms,
            age,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Nearest-rank percentile: the value at 1-indexed rank ceil(p * n / 100).
pub fn nearest_rank(sorted: &[f64], percentile: u32) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = (percentile as usize * n).div_ceil(100).clamp(1, n);
    Some(sorted[rank - 1])
}

fn ser_age_secs<S: serde::Serializer>(age: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match age {
        Some(age) => s.serialize_some(&age.as_secs_f64()),
        None => s.serialize_none(),
    }
}

/// Whether samples are reaching disk. Carried alongside statistics so that an
/// empty window can be told apart from one the writer failed to persist.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PersistenceStatus {
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub stats: WindowStats,
    pub persistence: PersistenceStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteSnapshot {
    pub route: RouteKey,
    pub stats: WindowStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct FullSnapshot {
    pub all: WindowStats,
    pub routes: Vec<RouteSnapshot>,
    pub persistence: PersistenceStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesSnapshot {
    pub series: String,
    pub routes: usize,
    pub stats: WindowStats,
}

struct Windows {
    all: RollingWindow,
    routes: HashMap<RouteKey, RollingWindow>,
    persistence: PersistenceStatus,
}

pub struct Aggregator {
    capacity: usize,
    inner: Mutex<Windows>,
}

impl Aggregator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Windows {
                all: RollingWindow::new(capacity),
                routes: HashMap::new(),
                persistence: PersistenceStatus::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Windows> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ingest(&self, sample: Sample) {
        let route = sample.route();
        let entry = Entry { sample: Arc::new(sample), received: Instant::now() };

        let mut inner = self.lock();
        let capacity = self.capacity;
        inner
            .routes
            .entry(route)
            .or_insert_with(|| RollingWindow::new(capacity))
            .push(entry.clone());
        inner.all.push(entry);
    }

    /// Copy of the window for `key`, or `None` for a route never seen.
    pub fn window(&self, key: &WindowKey) -> Option<RollingWindow> {
        let inner = self.lock();
        match key {
            WindowKey::All => Some(inner.all.clone()),
            WindowKey::Route(route) => inner.routes.get(route).cloned(),
        }
    }

    /// Statistics for one key. An unknown route yields empty statistics.
    pub fn snapshot(&self, key: &WindowKey) -> Snapshot {
        let (window, persistence) = {
            let inner = self.lock();
            let window = match key {
                WindowKey::All => Some(inner.all.clone()),
                WindowKey::Route(route) => inner.routes.get(route).cloned(),
            };
            (window, inner.persistence.clone())
        };
        let stats = window
            .map(|w| w.stats())
            .unwrap_or_else(|| WindowStats::compute(std::iter::empty(), None));
        Snapshot { stats, persistence }
    }

    pub fn snapshot_all(&self) -> FullSnapshot {
        let (all, routes, persistence) = {
            let inner = self.lock();
            let routes: Vec<(RouteKey, RollingWindow)> =
                inner.routes.iter().map(|(k, w)| (k.clone(), w.clone())).collect();
            (inner.all.clone(), routes, inner.persistence.clone())
        };

        let mut routes: Vec<RouteSnapshot> = routes
            .into_iter()
            .map(|(route, window)| RouteSnapshot { route, stats: window.stats() })
            .collect();
        routes.sort_by(|a, b| a.route.to_string().cmp(&b.route.to_string()));

        FullSnapshot { all: all.stats(), routes, persistence }
    }

    pub fn routes(&self) -> Vec<RouteKey> {
        self.lock().routes.keys().cloned().collect()
    }

    pub fn set_persistence(&self, status: PersistenceStatus) {
        self.lock().persistence = status;
    }

    /// Route windows merged per endpoint and check, samples in arrival order.
    pub fn snapshot_series(&self) -> Vec<SeriesSnapshot> {
        let grouped: HashMap<String, Vec<RollingWindow>> = {
            let inner = self.lock();
            let mut grouped: HashMap<String, Vec<RollingWindow>> = HashMap::new();
            for (route, window) in &inner.routes {
                grouped.entry(route.series()).or_default().push(window.clone());
            }
            grouped
        };

        let mut series: Vec<SeriesSnapshot> = grouped
            .into_iter()
            .map(|(series, windows)| {
                let mut entries: Vec<&Entry> = windows.iter().flat_map(|w| w.entries.iter()).collect();
                entries.sort_by_key(|e| e.received);
                let age = entries.last().map(|e| e.received.elapsed());
                let stats = WindowStats::compute(entries.iter().map(|e| e.sample.as_ref()), age);
                SeriesSnapshot { series, routes: windows.len(), stats }
            })
            .collect();
        series.sort_by(|a, b| a.series.cmp(&b.series));
        series
    }
}
