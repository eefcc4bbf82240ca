//! Derived telemetry, bounded history and threshold alerts.
//!
//! The pool's raw aggregation produces counter sums; the functions here
//! turn them into the quality scores the external surface reports --
//! achievement, consistency, efficiency -- retain bounded history and fire
//! threshold alerts toward registered handlers.

use std::{collections::HashMap, sync::Arc, time::Duration, time::Instant};

use serde::Serialize;

use crate::worker;

/// Slots in the rolling aggregate-EPS ring.
pub const EPS_HISTORY_CAPACITY: usize = 300;
/// Snapshots retained: 30 minutes at 1 Hz.
pub const METRICS_HISTORY_CAPACITY: usize = 1_800;
/// Samples feeding the consistency score: the last minute at 1 Hz.
pub const CONSISTENCY_WINDOW: usize = 60;

/// Process-level resource readings sampled alongside each snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SystemMetrics {
    /// Process CPU usage as a percentage of one core.
    pub cpu_pct: f64,
    /// Resident set size in bytes.
    pub memory_bytes: u64,
    /// Total bytes written to sockets since start.
    pub tx_bytes_cumulative: u64,
    /// Total datagrams written since start.
    pub tx_packets_cumulative: u64,
    /// Current transmit rate in megabits per second.
    pub tx_mbps_current: f64,
}

/// Pool-wide point-in-time metrics, immutable once published.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    /// Sum of per-worker smoothed EPS.
    pub total_eps: i64,
    /// Records sent since start, summed across the fleet.
    pub total_sent: u64,
    /// Failed sends since start, summed across the fleet.
    pub total_errors: u64,
    /// Workers with non-zero smoothed EPS in the last interval.
    pub active_workers: u32,
    /// Fleet size configured by the profile.
    pub configured_workers: u32,
    /// `total_eps / active_workers`.
    pub average_eps: i64,
    /// Mean per-worker packet loss percentage.
    pub packet_loss_rate: f64,
    /// The aggregate goal.
    pub target_eps: u64,
    /// `100 * total_eps / target_eps`.
    pub achievement_pct: f64,
    /// EPS stability over the last minute, 0-100.
    pub consistency_score: f64,
    /// EPS delivered per unit CPU and memory, 0-100.
    pub efficiency_score: f64,
    /// Time since the pool started.
    pub uptime: Duration,
    /// Latest per-worker snapshots, keyed by worker id.
    pub per_worker: HashMap<u32, worker::Snapshot>,
    /// Process resource readings.
    pub system: SystemMetrics,
    /// Publication instant; strictly increases between snapshots.
    #[serde(skip)]
    pub generated_at: Instant,
}

impl PoolMetrics {
    /// A zero-valued snapshot for a pool that has not aggregated yet.
    #[must_use]
    pub fn empty(target_eps: u64, configured_workers: u32) -> Self {
        Self {
            total_eps: 0,
            total_sent: 0,
            total_errors: 0,
            active_workers: 0,
            configured_workers,
            average_eps: 0,
            packet_loss_rate: 0.0,
            target_eps,
            achievement_pct: 0.0,
            consistency_score: 100.0,
            efficiency_score: 0.0,
            uptime: Duration::ZERO,
            per_worker: HashMap::new(),
            system: SystemMetrics::default(),
            generated_at: Instant::now(),
        }
    }
}

/// `100 * current / target`, zero when the target is unset.
#[must_use]
pub fn achievement_pct(current_eps: i64, target_eps: u64) -> f64 {
    if target_eps == 0 {
        return 0.0;
    }
    current_eps.max(0) as f64 / target_eps as f64 * 100.0
}

/// Stability of EPS over the supplied window: `100 - CV * 100` where CV is
/// the coefficient of variation of the non-zero samples. Clamped to
/// `[0, 100]`; fewer than two live samples score a full 100.
#[must_use]
pub fn consistency_score(samples: &[u64]) -> f64 {
    let live: Vec<f64> = samples
        .iter()
        .copied()
        .filter(|&s| s > 0)
        .map(|s| s as f64)
        .collect();
    if live.len() < 2 {
        return 100.0;
    }

    let n = live.len() as f64;
    let mean = live.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 100.0;
    }
    let variance = live.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let cv = variance.sqrt() / mean;

    (100.0 - cv * 100.0).clamp(0.0, 100.0)
}

/// EPS delivered per unit of CPU and memory, weighted 60/40 and clamped to
/// `[0, 100]`. Zero-resource readings score the corresponding component at
/// full marks rather than dividing by zero.
#[must_use]
pub fn efficiency_score(current_eps: i64, cpu_pct: f64, memory_bytes: u64) -> f64 {
    let eps = current_eps.max(0) as f64;

    let cpu_efficiency = if cpu_pct > 0.0 {
        eps / (cpu_pct * 1_000.0)
    } else {
        100.0
    };

    let memory_mb = memory_bytes as f64 / (1024.0 * 1024.0);
    let memory_efficiency = if memory_mb > 0.0 {
        eps / (memory_mb * 10.0)
    } else {
        100.0
    };

    (cpu_efficiency * 0.6 + memory_efficiency * 0.4).clamp(0.0, 100.0)
}

/// Thresholds that, when crossed, emit an alert toward registered handlers.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AlertThresholds {
    /// Floor on aggregate EPS.
    pub min_eps: i64,
    /// Ceiling on packet loss percentage.
    pub max_packet_loss: f64,
    /// Ceiling on process CPU percentage.
    pub max_cpu_pct: f64,
    /// Ceiling on resident memory.
    pub max_memory_bytes: u64,
}

impl AlertThresholds {
    /// Default thresholds for a target: 95% of goal, 0.5% loss, 75% CPU,
    /// 12 GiB resident.
    #[must_use]
    pub fn for_target(target_eps: u64) -> Self {
        Self {
            min_eps: (target_eps as f64 * 0.95) as i64,
            max_packet_loss: 0.5,
            max_cpu_pct: 75.0,
            max_memory_bytes: 12 * 1024 * 1024 * 1024,
        }
    }
}

/// What threshold an [`Alert`] crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    /// Aggregate EPS fell below the floor.
    LowEps,
    /// Packet loss exceeded the ceiling.
    HighPacketLoss,
    /// CPU usage exceeded the ceiling.
    HighCpu,
    /// Resident memory exceeded the ceiling.
    HighMemory,
}

/// A threshold crossing, carrying the snapshot that triggered it.
#[derive(Debug, Clone)]
pub struct Alert {
    /// Which threshold was crossed.
    pub kind: AlertKind,
    /// Human-readable description.
    pub message: String,
    /// The snapshot that crossed the threshold.
    pub metrics: Arc<PoolMetrics>,
}

/// Receives threshold alerts. Handlers are invoked on detached tasks and
/// must not assume any ordering; a handler failure is swallowed.
pub trait AlertHandler: Send + Sync {
    /// React to one alert.
    fn handle(&self, alert: &Alert);
}

/// Evaluate a snapshot against thresholds. Pure so it can be tested
/// without an aggregator.
#[must_use]
pub fn check_thresholds(thresholds: &AlertThresholds, metrics: &Arc<PoolMetrics>) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if metrics.total_eps < thresholds.min_eps {
        alerts.push(Alert {
            kind: AlertKind::LowEps,
            message: format!(
                "aggregate EPS {eps} below floor {floor}",
                eps = metrics.total_eps,
                floor = thresholds.min_eps
            ),
            metrics: Arc::clone(metrics),
        });
    }
    if metrics.packet_loss_rate > thresholds.max_packet_loss {
        alerts.push(Alert {
            kind: AlertKind::HighPacketLoss,
            message: format!(
                "packet loss {loss:.2}% above ceiling {max:.2}%",
                loss = metrics.packet_loss_rate,
                max = thresholds.max_packet_loss
            ),
            metrics: Arc::clone(metrics),
        });
    }
    if metrics.system.cpu_pct > thresholds.max_cpu_pct {
        alerts.push(Alert {
            kind: AlertKind::HighCpu,
            message: format!(
                "CPU {cpu:.1}% above ceiling {max:.1}%",
                cpu = metrics.system.cpu_pct,
                max = thresholds.max_cpu_pct
            ),
            metrics: Arc::clone(metrics),
        });
    }
    if metrics.system.memory_bytes > thresholds.max_memory_bytes {
        alerts.push(Alert {
            kind: AlertKind::HighMemory,
            message: format!(
                "resident memory {mem} above ceiling {max}",
                mem = metrics.system.memory_bytes,
                max = thresholds.max_memory_bytes
            ),
            metrics: Arc::clone(metrics),
        });
    }

    alerts
}

/// A fixed-capacity ring that overwrites its oldest entry on overflow.
#[derive(Debug, Clone)]
pub(crate) struct Ring<T> {
    slots: Vec<T>,
    capacity: usize,
    /// Next write position, advancing modulo capacity once full.
    head: usize,
}

impl<T: Clone> Ring<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        }
    }

    pub(crate) fn push(&mut self, value: T) {
        if self.slots.len() < self.capacity {
            self.slots.push(value);
        } else {
            self.slots[self.head] = value;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Contents oldest-first.
    pub(crate) fn to_vec(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.slots.len());
        out.extend_from_slice(&self.slots[self.head..]);
        out.extend_from_slice(&self.slots[..self.head]);
        out
    }

    /// Up to `n` newest entries, oldest-first.
    pub(crate) fn tail(&self, n: usize) -> Vec<T> {
        let all = self.to_vec();
        let skip = all.len().saturating_sub(n);
        all[skip..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        achievement_pct, check_thresholds, consistency_score, efficiency_score, AlertKind,
        AlertThresholds, PoolMetrics, Ring,
    };

    #[test]
    fn ring_overwrites_oldest_on_overflow() {
        let mut ring = Ring::new(3);
        for i in 0..5_u64 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.to_vec(), vec![2, 3, 4]);
    }

    #[test]
    fn ring_tail_returns_newest() {
        let mut ring = Ring::new(4);
        for i in 0..10_u64 {
            ring.push(i);
        }
        assert_eq!(ring.tail(2), vec![8, 9]);
        assert_eq!(ring.tail(100), vec![6, 7, 8, 9]);
    }

    #[test]
    fn ring_before_capacity_keeps_order() {
        let mut ring = Ring::new(8);
        ring.push(1_u64);
        ring.push(2);
        assert_eq!(ring.to_vec(), vec![1, 2]);
    }

    #[test]
    fn consistency_is_full_marks_under_two_samples() {
        assert!((consistency_score(&[]) - 100.0).abs() < f64::EPSILON);
        assert!((consistency_score(&[5_000]) - 100.0).abs() < f64::EPSILON);
        // Zeros are not live samples.
        assert!((consistency_score(&[0, 0, 5_000]) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn consistency_of_a_steady_stream_is_high() {
        let samples = vec![100_000_u64; 60];
        assert!((consistency_score(&samples) - 100.0).abs() < f64::EPSILON);

        let jittered: Vec<u64> = (0..60).map(|i| 100_000 + (i % 2) * 500).collect();
        assert!(consistency_score(&jittered) > 99.0);
    }

    #[test]
    fn consistency_of_a_wild_stream_clamps_at_zero() {
        let samples = vec![1, 1_000_000, 1, 1_000_000, 1, 1_000_000];
        let score = consistency_score(&samples);
        assert!((0.0..=10.0).contains(&score));
    }

    #[test]
    fn achievement_is_a_plain_ratio() {
        assert!((achievement_pct(95_000, 100_000) - 95.0).abs() < 1e-9);
        assert!((achievement_pct(0, 100_000)).abs() < 1e-9);
        assert!((achievement_pct(-5, 100_000)).abs() < 1e-9);
        assert!((achievement_pct(100, 0)).abs() < 1e-9);
    }

    #[test]
    fn efficiency_clamps_and_survives_zero_resources() {
        // Zero readings mean full marks, not a division by zero.
        assert!((efficiency_score(1_000_000, 0.0, 0) - 100.0).abs() < f64::EPSILON);

        // Huge EPS on tiny resources clamps at 100.
        assert!((efficiency_score(4_000_000, 1.0, 1024) - 100.0).abs() < f64::EPSILON);

        // Modest EPS on heavy resources lands inside the range.
        let score = efficiency_score(50_000, 70.0, 8 * 1024 * 1024 * 1024);
        assert!((0.0..=100.0).contains(&score));
    }

    #[test]
    fn thresholds_fire_per_dimension() {
        let thresholds = AlertThresholds::for_target(4_000_000);
        assert_eq!(thresholds.min_eps, 3_800_000);

        let mut metrics = PoolMetrics::empty(4_000_000, 160);
        metrics.total_eps = 3_900_000;
        metrics.packet_loss_rate = 0.1;
        metrics.system.cpu_pct = 50.0;
        metrics.system.memory_bytes = 1024;
        let clean = Arc::new(metrics.clone());
        assert!(check_thresholds(&thresholds, &clean).is_empty());

        metrics.total_eps = 3_000_000;
        metrics.packet_loss_rate = 1.0;
        metrics.system.cpu_pct = 90.0;
        metrics.system.memory_bytes = 13 * 1024 * 1024 * 1024;
        let noisy = Arc::new(metrics);
        let alerts = check_thresholds(&thresholds, &noisy);
        let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AlertKind::LowEps,
                AlertKind::HighPacketLoss,
                AlertKind::HighCpu,
                AlertKind::HighMemory
            ]
        );
    }
}
