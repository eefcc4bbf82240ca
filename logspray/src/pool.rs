//! The worker pool.
//!
//! The pool owns the sender fleet: it constructs workers from the active
//! profile, fans out lifecycle, aggregates their counters into pool-wide
//! metrics once a second and publishes each snapshot through an atomic
//! slot. Readers never observe a partially written snapshot and never take
//! a lock the hot paths contend on.

use std::{
    collections::HashMap,
    net::{SocketAddr, ToSocketAddrs},
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime},
};

use arc_swap::ArcSwap;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use logspray_signal::{Broadcaster, Watcher};

use crate::{
    observer::{Sample, SystemSampler},
    profile::{self, Profile},
    telemetry::{
        achievement_pct, check_thresholds, consistency_score, efficiency_score, AlertHandler,
        AlertThresholds, PoolMetrics, Ring, SystemMetrics, CONSISTENCY_WINDOW,
        EPS_HISTORY_CAPACITY, METRICS_HISTORY_CAPACITY,
    },
    worker::{self, Counters, Settings, Snapshot, Worker},
};

/// Standard syslog destination port, hard-wired.
pub const SYSLOG_PORT: u16 = 514;
/// Base of the per-worker telemetry port labels.
pub const FIRST_PORT: u16 = 10_514;
/// Pause between worker launches, softening the socket-creation burst.
const LAUNCH_STAGGER: Duration = Duration::from_millis(2);
/// Cadence of the aggregation loop.
const AGGREGATE_INTERVAL: Duration = Duration::from_secs(1);
/// Cadence of the auto-tuner.
const TUNE_INTERVAL: Duration = Duration::from_secs(30);
/// Capacity of the snapshot stream toward external consumers; lagging
/// receivers lose the oldest entries first.
const STREAM_CAPACITY: usize = 8;

/// Errors produced by [`Pool`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Profile lookup or validation failed.
    #[error(transparent)]
    Profile(#[from] profile::Error),
    /// A worker failed to come up.
    #[error(transparent)]
    Worker(#[from] worker::Error),
    /// `start` or `initialize` was called while running.
    #[error("generator is already running")]
    AlreadyRunning,
    /// `stop` was called while stopped.
    #[error("generator is not running")]
    NotRunning,
    /// `set_profile` was called while running.
    #[error("profile cannot change while the generator is running")]
    GeneratorRunning,
    /// The target host did not resolve to a socket address.
    #[error("could not resolve target host `{host}`")]
    TargetResolve {
        /// The unresolvable host.
        host: String,
    },
    /// Generic IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration of the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Destination host; the port is the standard syslog 514.
    pub target_host: String,
    /// The active parameter bundle.
    pub profile: Profile,
    /// Base seed for the per-worker payload PRNGs. Defaults to wall-clock
    /// entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    /// One send syscall per record instead of newline-joined batches.
    #[serde(default)]
    pub datagram_per_event: bool,
    /// Run the 30 s advisory auto-tuner.
    #[serde(default)]
    pub auto_tune: bool,
}

/// The rate-controlled sender fleet.
pub struct Pool {
    config: Config,
    target_port: u16,
    workers: Vec<Worker>,
    snapshot_rx: Option<mpsc::Receiver<Snapshot>>,
    broadcaster: Option<Broadcaster>,
    sampler: Option<SystemSampler>,
    aggregator: Option<tokio::task::JoinHandle<()>>,
    tuner: Option<tokio::task::JoinHandle<()>>,
    slot: Arc<ArcSwap<PoolMetrics>>,
    eps_ring: Arc<Mutex<Ring<u64>>>,
    history: Arc<Mutex<Ring<Arc<PoolMetrics>>>>,
    stream: broadcast::Sender<Arc<PoolMetrics>>,
    thresholds: AlertThresholds,
    handlers: Vec<Arc<dyn AlertHandler>>,
    started_at: Option<Instant>,
    running: bool,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("profile", &self.config.profile.name)
            .field("target_host", &self.config.target_host)
            .field("workers", &self.workers.len())
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Create a new [`Pool`] instance. Nothing is validated or opened until
    /// [`Pool::initialize`].
    #[must_use]
    pub fn new(config: Config) -> Self {
        let thresholds = AlertThresholds::for_target(config.profile.target_eps);
        let slot = Arc::new(ArcSwap::from_pointee(PoolMetrics::empty(
            config.profile.target_eps,
            config.profile.worker_count,
        )));
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);

        Self {
            config,
            target_port: SYSLOG_PORT,
            workers: Vec::new(),
            snapshot_rx: None,
            broadcaster: None,
            sampler: None,
            aggregator: None,
            tuner: None,
            slot,
            eps_ring: Arc::new(Mutex::new(Ring::new(EPS_HISTORY_CAPACITY))),
            history: Arc::new(Mutex::new(Ring::new(METRICS_HISTORY_CAPACITY))),
            stream,
            thresholds,
            handlers: Vec::new(),
            started_at: None,
            running: false,
        }
    }

    /// Convenience constructor over [`Pool::new`].
    #[must_use]
    pub fn new_with_profile(target_host: &str, profile: Profile) -> Self {
        Self::new(Config {
            target_host: target_host.to_string(),
            profile,
            seed: None,
            datagram_per_event: false,
            auto_tune: false,
        })
    }

    /// Construct the worker fleet from the active profile.
    ///
    /// Every worker's socket is opened and sized here; no traffic flows
    /// until [`Pool::start`]. An invalid profile opens no sockets at all.
    ///
    /// # Errors
    ///
    /// Function will return an error if the pool is running, the profile
    /// fails validation, the target host does not resolve or any worker
    /// socket cannot be opened.
    pub fn initialize(&mut self) -> Result<(), Error> {
        if self.running {
            return Err(Error::AlreadyRunning);
        }
        self.config.profile.validate()?;

        let peer = self.resolve_target()?;
        let worker_count = self.config.profile.worker_count;
        let per_worker_eps = self.config.profile.eps_per_worker();
        let base_seed = self.config.seed.unwrap_or_else(entropy_seed);

        let (snapshot_tx, snapshot_rx) =
            mpsc::channel::<Snapshot>(worker_count as usize * 2);

        let mut workers = Vec::with_capacity(worker_count as usize);
        for i in 0..worker_count {
            let worker_id = i + 1;
            let settings = Settings {
                batch_size: self.config.profile.batch_size,
                tick_interval: self.config.profile.tick_interval,
                send_buf_bytes: self.config.profile.send_buf_bytes,
                recv_buf_bytes: self.config.profile.recv_buf_bytes,
                datagram_per_event: self.config.datagram_per_event,
                seed: base_seed.wrapping_add(u64::from(worker_id)),
            };
            let mut worker = Worker::new(
                worker_id,
                FIRST_PORT.wrapping_add(i as u16),
                peer,
                settings,
                snapshot_tx.clone(),
            )?;
            worker.set_target_eps(per_worker_eps);
            worker.set_precision_mode(self.config.profile.precision_mode);
            workers.push(worker);
        }

        self.workers = workers;
        self.snapshot_rx = Some(snapshot_rx);

        info!(
            profile = %self.config.profile.name,
            workers = worker_count,
            target_eps = self.config.profile.target_eps,
            per_worker_eps,
            "pool initialized"
        );
        Ok(())
    }

    /// Start the fleet, the aggregator and (if configured) the auto-tuner.
    ///
    /// Workers launch with a small stagger to soften the thread and socket
    /// burst. Re-initialises automatically after a previous `stop`.
    ///
    /// # Errors
    ///
    /// Function will return an error if the pool is already running or any
    /// worker fails to start; on worker failure the pool is shut back down
    /// before the error is returned.
    pub async fn start(&mut self) -> Result<(), Error> {
        if self.running {
            return Err(Error::AlreadyRunning);
        }
        if self.workers.is_empty() {
            self.initialize()?;
        }

        let sampler = SystemSampler::start()?;

        let (watcher, broadcaster) = logspray_signal::signal();
        self.broadcaster = Some(broadcaster);
        self.running = true;
        self.started_at = Some(Instant::now());

        let aggregator = Aggregator {
            counters: self
                .workers
                .iter()
                .map(|w| (w.id(), w.local_port(), w.counters()))
                .collect(),
            snapshot_rx: self
                .snapshot_rx
                .take()
                .expect("initialize populates the snapshot channel"),
            slot: Arc::clone(&self.slot),
            eps_ring: Arc::clone(&self.eps_ring),
            history: Arc::clone(&self.history),
            stream: self.stream.clone(),
            thresholds: self.thresholds,
            handlers: self.handlers.clone().into(),
            system: sampler.reader(),
            target_eps: self.config.profile.target_eps,
            configured_workers: self.config.profile.worker_count,
            started_at: Instant::now(),
        };
        self.sampler = Some(sampler);
        self.aggregator = Some(tokio::spawn(aggregator.run(watcher.clone())));

        if self.config.auto_tune {
            let tuner = Tuner {
                slot: Arc::clone(&self.slot),
                target_eps: self.config.profile.target_eps,
                memory_limit_bytes: self.config.profile.memory_limit_bytes,
            };
            self.tuner = Some(tokio::spawn(tuner.run(watcher.clone())));
        }

        for worker in &mut self.workers {
            if let Err(err) = worker.start(watcher.clone()) {
                warn!("worker {id} failed to start, aborting", id = worker.id());
                self.abort_start().await;
                return Err(err.into());
            }
            tokio::time::sleep(LAUNCH_STAGGER).await;
        }

        info!(
            workers = self.workers.len(),
            target_eps = self.config.profile.target_eps,
            "pool started"
        );
        Ok(())
    }

    /// Signal cancellation, wait for every task and thread, release the
    /// sockets.
    ///
    /// # Errors
    ///
    /// Function will return an error if the pool is not running. The first
    /// `stop` of a lifecycle succeeds; the second fails with
    /// [`Error::NotRunning`] and changes nothing.
    pub async fn stop(&mut self) -> Result<(), Error> {
        if !self.running {
            return Err(Error::NotRunning);
        }

        self.shutdown_tasks().await;
        self.running = false;

        let snapshot = self.snapshot();
        let uptime = self
            .started_at
            .take()
            .map_or(Duration::ZERO, |at| at.elapsed());
        info!(
            uptime_secs = uptime.as_secs(),
            total_sent = snapshot.total_sent,
            total_errors = snapshot.total_errors,
            achievement_pct = format!("{:.1}", snapshot.achievement_pct),
            "pool stopped"
        );
        Ok(())
    }

    /// The most recently published snapshot: a lock-free atomic load.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PoolMetrics> {
        self.slot.load_full()
    }

    /// Copy of the rolling aggregate-EPS ring, oldest first.
    ///
    /// # Panics
    ///
    /// Panics if the aggregator thread poisoned the ring lock, which
    /// indicates a prior panic inside the aggregator.
    #[must_use]
    pub fn eps_history(&self) -> Vec<u64> {
        self.eps_ring.lock().expect("eps ring poisoned").to_vec()
    }

    /// Copy of the retained snapshot history, oldest first.
    ///
    /// # Panics
    ///
    /// Panics if the aggregator thread poisoned the history lock.
    #[must_use]
    pub fn metrics_history(&self) -> Vec<Arc<PoolMetrics>> {
        self.history.lock().expect("history poisoned").to_vec()
    }

    /// Subscribe to the 1 Hz snapshot stream. Slow consumers lose the
    /// oldest snapshots first.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PoolMetrics>> {
        self.stream.subscribe()
    }

    /// Whether the fleet is live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The active profile.
    #[must_use]
    pub fn profile(&self) -> &Profile {
        &self.config.profile
    }

    /// Swap the active profile. Only legal while stopped; the next
    /// `initialize`/`start` builds the new fleet.
    ///
    /// # Errors
    ///
    /// Function will return an error if the pool is running.
    pub fn set_profile(&mut self, profile: Profile) -> Result<(), Error> {
        if self.running {
            return Err(Error::GeneratorRunning);
        }

        info!(profile = %profile.name, target_eps = profile.target_eps, "profile changed");
        self.thresholds = AlertThresholds::for_target(profile.target_eps);
        self.slot.store(Arc::new(PoolMetrics::empty(
            profile.target_eps,
            profile.worker_count,
        )));
        self.config.profile = profile;
        self.workers.clear();
        self.snapshot_rx = None;
        Ok(())
    }

    /// Replace the alert thresholds. Takes effect at the next `start`.
    pub fn set_alert_thresholds(&mut self, thresholds: AlertThresholds) {
        self.thresholds = thresholds;
    }

    /// Register an alert handler. Takes effect at the next `start`.
    pub fn add_alert_handler(&mut self, handler: Arc<dyn AlertHandler>) {
        self.handlers.push(handler);
    }

    #[cfg(test)]
    pub(crate) fn set_target_port(&mut self, port: u16) {
        self.target_port = port;
    }

    fn resolve_target(&self) -> Result<SocketAddr, Error> {
        (self.config.target_host.as_str(), self.target_port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| Error::TargetResolve {
                host: self.config.target_host.clone(),
            })
    }

    /// Tear down a partially started pool after a worker failure.
    async fn abort_start(&mut self) {
        self.shutdown_tasks().await;
        self.running = false;
        self.started_at = None;
    }

    async fn shutdown_tasks(&mut self) {
        if let Some(broadcaster) = self.broadcaster.take() {
            broadcaster.signal();
        }

        if let Some(handle) = self.aggregator.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.tuner.take() {
            let _ = handle.await;
        }
        if let Some(mut sampler) = self.sampler.take() {
            sampler.stop();
        }

        // Workers poll cancellation once per tick, so two tick intervals
        // (with a one-second floor) bound the join.
        let join_timeout = (self.config.profile.tick_interval * 2).max(Duration::from_secs(1));
        let mut workers = std::mem::take(&mut self.workers);
        let join = tokio::task::spawn_blocking(move || {
            for worker in &mut workers {
                match worker.stop() {
                    Ok(()) | Err(worker::Error::NotRunning(_)) => {}
                    Err(err) => warn!("worker stop failed: {err}"),
                }
            }
            drop(workers);
        });
        if tokio::time::timeout(join_timeout, join).await.is_err() {
            warn!("worker shutdown exceeded {join_timeout:?}; detaching");
        }
        self.snapshot_rx = None;
    }
}

fn entropy_seed() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0x6c6f_6773, |d| d.as_nanos() as u64)
}

/// The 1 Hz aggregation task.
struct Aggregator {
    counters: Vec<(u32, u16, Arc<Counters>)>,
    snapshot_rx: mpsc::Receiver<Snapshot>,
    slot: Arc<ArcSwap<PoolMetrics>>,
    eps_ring: Arc<Mutex<Ring<u64>>>,
    history: Arc<Mutex<Ring<Arc<PoolMetrics>>>>,
    stream: broadcast::Sender<Arc<PoolMetrics>>,
    thresholds: AlertThresholds,
    handlers: Arc<[Arc<dyn AlertHandler>]>,
    system: Arc<ArcSwap<Sample>>,
    target_eps: u64,
    configured_workers: u32,
    started_at: Instant,
}

impl Aggregator {
    async fn run(mut self, shutdown: Watcher) {
        debug!("aggregator running");
        let mut interval = tokio::time::interval(AGGREGATE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut emitted: HashMap<u32, Snapshot> = HashMap::new();
        let mut consistency = Ring::new(CONSISTENCY_WINDOW);
        let mut last_bytes = 0_u64;
        let mut last_tick = Instant::now();
        let mut passes = 0_u64;

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let metrics = self.aggregate_once(
                        &mut emitted,
                        &mut consistency,
                        &mut last_bytes,
                        &mut last_tick,
                    );
                    passes += 1;
                    if passes % 60 == 0 {
                        info!(
                            eps = metrics.total_eps,
                            target = metrics.target_eps,
                            achievement_pct = format!("{:.1}", metrics.achievement_pct),
                            active_workers = metrics.active_workers,
                            total_sent = metrics.total_sent,
                            packet_loss_pct = format!("{:.2}", metrics.packet_loss_rate),
                            cpu_pct = format!("{:.1}", metrics.system.cpu_pct),
                            memory_mb = metrics.system.memory_bytes / (1024 * 1024),
                            "performance report"
                        );
                    }
                }
                () = &mut shutdown_wait => {
                    debug!("aggregator shutting down");
                    return;
                }
            }
        }
    }

    fn aggregate_once(
        &mut self,
        emitted: &mut HashMap<u32, Snapshot>,
        consistency: &mut Ring<u64>,
        last_bytes: &mut u64,
        last_tick: &mut Instant,
    ) -> Arc<PoolMetrics> {
        // Drain whatever the workers published since the last pass. The
        // channel is bounded and workers drop on full; this loop never
        // blocks them.
        while let Ok(snapshot) = self.snapshot_rx.try_recv() {
            emitted.insert(snapshot.worker_id, snapshot);
        }

        let mut total_eps = 0_i64;
        let mut total_sent = 0_u64;
        let mut total_errors = 0_u64;
        let mut total_bytes = 0_u64;
        let mut total_packets = 0_u64;
        let mut active_workers = 0_u32;
        let mut loss_sum = 0.0_f64;
        let mut per_worker = HashMap::with_capacity(self.counters.len());

        for (worker_id, local_port, counters) in &self.counters {
            let current_eps = counters.current_eps();
            let sent = counters.total_sent();
            let errors = counters.error_count();
            total_sent += sent;
            total_errors += errors;
            total_bytes += counters.bytes_sent();
            total_packets += counters.packets_sent();

            let packet_loss = if sent > 0 {
                errors as f64 / sent as f64 * 100.0
            } else {
                0.0
            };
            if current_eps > 0 {
                active_workers += 1;
                total_eps += current_eps;
                loss_sum += packet_loss;
            }

            per_worker.insert(
                *worker_id,
                Snapshot {
                    worker_id: *worker_id,
                    local_port: *local_port,
                    current_eps,
                    average_eps: emitted
                        .get(worker_id)
                        .map_or(current_eps, |s| s.average_eps),
                    total_sent: sent,
                    error_count: errors,
                    packet_loss,
                    last_sent: counters.last_sent(),
                },
            );
        }

        let elapsed = last_tick.elapsed().as_secs_f64().max(1e-9);
        let tx_mbps = (total_bytes.saturating_sub(*last_bytes)) as f64 * 8.0 / 1e6 / elapsed;
        *last_bytes = total_bytes;
        *last_tick = Instant::now();

        let sample = **self.system.load();
        let system = SystemMetrics {
            cpu_pct: sample.cpu_pct,
            memory_bytes: sample.memory_bytes,
            tx_bytes_cumulative: total_bytes,
            tx_packets_cumulative: total_packets,
            tx_mbps_current: tx_mbps,
        };

        consistency.push(u64::try_from(total_eps).unwrap_or(0));

        let metrics = Arc::new(PoolMetrics {
            total_eps,
            total_sent,
            total_errors,
            active_workers,
            configured_workers: self.configured_workers,
            average_eps: if active_workers > 0 {
                total_eps / i64::from(active_workers)
            } else {
                0
            },
            packet_loss_rate: if active_workers > 0 {
                loss_sum / f64::from(active_workers)
            } else {
                0.0
            },
            target_eps: self.target_eps,
            achievement_pct: achievement_pct(total_eps, self.target_eps),
            consistency_score: consistency_score(&consistency.to_vec()),
            efficiency_score: efficiency_score(total_eps, sample.cpu_pct, sample.memory_bytes),
            uptime: self.started_at.elapsed(),
            per_worker,
            system,
            generated_at: Instant::now(),
        });

        if let Ok(mut ring) = self.eps_ring.lock() {
            ring.push(u64::try_from(total_eps).unwrap_or(0));
        }
        if let Ok(mut history) = self.history.lock() {
            history.push(Arc::clone(&metrics));
        }

        gauge!("pool_total_eps").set(total_eps as f64);
        gauge!("pool_achievement_pct").set(metrics.achievement_pct);
        gauge!("pool_active_workers").set(f64::from(active_workers));

        // Publication is a single pointer swap; readers take stable copies.
        self.slot.store(Arc::clone(&metrics));
        let _ = self.stream.send(Arc::clone(&metrics));

        for alert in check_thresholds(&self.thresholds, &metrics) {
            warn!(kind = ?alert.kind, "{msg}", msg = alert.message);
            let handlers = Arc::clone(&self.handlers);
            // Fire-and-forget: a slow or panicking handler burns its own
            // task, never this loop.
            tokio::spawn(async move {
                for handler in handlers.iter() {
                    handler.handle(&alert);
                }
            });
        }

        metrics
    }
}

/// The 30 s advisory auto-tuner. Observes, logs, never reconfigures.
struct Tuner {
    slot: Arc<ArcSwap<PoolMetrics>>,
    target_eps: u64,
    memory_limit_bytes: u64,
}

impl Tuner {
    async fn run(self, shutdown: Watcher) {
        debug!("auto-tuner running");
        let mut interval = tokio::time::interval(TUNE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would report on an empty snapshot.
        interval.tick().await;

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                _ = interval.tick() => self.advise(),
                () = &mut shutdown_wait => {
                    debug!("auto-tuner shutting down");
                    return;
                }
            }
        }
    }

    fn advise(&self) {
        let metrics = self.slot.load_full();
        let achieved = metrics.total_eps.max(0) as f64;
        if achieved >= self.target_eps as f64 * 0.95 {
            return;
        }

        info!(
            achieved,
            target = self.target_eps,
            "running below 95% of target"
        );
        if metrics.system.cpu_pct < 60.0 {
            info!(
                cpu_pct = metrics.system.cpu_pct,
                "CPU headroom available; the bottleneck is likely socket or scheduling latency"
            );
        }
        if metrics.system.memory_bytes > self.memory_limit_bytes {
            warn!(
                memory_bytes = metrics.system.memory_bytes,
                limit = self.memory_limit_bytes,
                "resident memory above the profile's advisory limit"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    use crate::profile::{self, PrecisionMode, Profile};
    use crate::telemetry::{Alert, AlertHandler, AlertThresholds};

    use super::{Config, Error, Pool};

    fn tiny_profile(target_eps: u64, workers: u32, mode: PrecisionMode) -> Profile {
        Profile {
            name: "custom".to_string(),
            target_eps,
            worker_count: workers,
            batch_size: 10,
            tick_interval: Duration::from_millis(10),
            send_buf_bytes: 256 * 1024,
            recv_buf_bytes: 128 * 1024,
            precision_mode: mode,
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
        }
    }

    fn sink_pool(profile: Profile) -> (UdpSocket, Pool) {
        let sink = UdpSocket::bind("127.0.0.1:0").expect("bind sink");
        let port = sink.local_addr().expect("sink addr").port();
        let mut pool = Pool::new(Config {
            target_host: "127.0.0.1".to_string(),
            profile,
            seed: Some(1),
            datagram_per_event: false,
            auto_tune: false,
        });
        pool.set_target_port(port);
        (sink, pool)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lifecycle_round_trip_with_aggregation() {
        let (_sink, mut pool) = sink_pool(tiny_profile(2_000, 2, PrecisionMode::Medium));

        pool.initialize().expect("initialize");
        pool.start().await.expect("start");
        assert!(pool.is_running());

        // Give the aggregator a couple of passes.
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let snapshot = pool.snapshot();
        assert!(snapshot.total_sent > 0);
        assert_eq!(snapshot.configured_workers, 2);
        assert_eq!(snapshot.per_worker.len(), 2);

        // The headline sum must equal the per-worker sum exactly.
        let sum: u64 = snapshot.per_worker.values().map(|w| w.total_sent).sum();
        assert_eq!(snapshot.total_sent, sum);
        assert!(snapshot.active_workers <= snapshot.configured_workers);

        // Every worker has sent by now, so its last-send stamp is live.
        for worker in snapshot.per_worker.values() {
            assert!(worker.last_sent > std::time::SystemTime::UNIX_EPOCH);
        }

        pool.stop().await.expect("stop");
        assert!(!pool.is_running());

        // total_sent froze at stop.
        let last = pool.snapshot();
        let history = pool.metrics_history();
        assert!(!history.is_empty());
        assert!(history.last().expect("entry").total_sent <= last.total_sent + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_is_first_success_then_not_running() {
        let (_sink, mut pool) = sink_pool(tiny_profile(500, 1, PrecisionMode::Medium));
        pool.start().await.expect("start");
        pool.stop().await.expect("first stop");
        assert!(matches!(pool.stop().await, Err(Error::NotRunning)));
        assert!(!pool.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_after_stop_is_clean() {
        let (_sink, mut pool) = sink_pool(tiny_profile(500, 2, PrecisionMode::Performance));

        pool.start().await.expect("first start");
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.stop().await.expect("first stop");

        pool.start().await.expect("second start");
        assert!(pool.is_running());
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.stop().await.expect("second stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn double_start_is_already_running() {
        let (_sink, mut pool) = sink_pool(tiny_profile(500, 1, PrecisionMode::Medium));
        pool.start().await.expect("start");
        assert!(matches!(pool.start().await, Err(Error::AlreadyRunning)));
        pool.stop().await.expect("stop");
    }

    #[test]
    fn invalid_profile_opens_no_sockets() {
        let mut bad = tiny_profile(0, 1, PrecisionMode::Medium);
        bad.target_eps = 0;
        let mut pool = Pool::new_with_profile("127.0.0.1", bad);
        assert!(matches!(
            pool.initialize(),
            Err(Error::Profile(profile::Error::TargetOutOfBounds(0)))
        ));
        assert!(pool.workers.is_empty());

        let mut over = tiny_profile(1_000, 1, PrecisionMode::Medium);
        over.worker_count = 500;
        let mut pool = Pool::new_with_profile("127.0.0.1", over);
        assert!(matches!(pool.initialize(), Err(Error::Profile(_))));
        assert!(pool.workers.is_empty());
    }

    #[test]
    fn unresolvable_target_is_an_error() {
        let mut pool = Pool::new_with_profile(
            "definitely-not-a-real-host.invalid.",
            tiny_profile(500, 1, PrecisionMode::Medium),
        );
        assert!(matches!(
            pool.initialize(),
            Err(Error::TargetResolve { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn set_profile_while_running_fails() {
        let (_sink, mut pool) = sink_pool(tiny_profile(500, 1, PrecisionMode::Medium));
        pool.start().await.expect("start");

        let next = tiny_profile(1_000, 1, PrecisionMode::Medium);
        assert!(matches!(
            pool.set_profile(next.clone()),
            Err(Error::GeneratorRunning)
        ));

        pool.stop().await.expect("stop");
        pool.set_profile(next).expect("profile swap while stopped");
        assert_eq!(pool.profile().target_eps, 1_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn eps_history_advances_and_stays_bounded() {
        let (_sink, mut pool) = sink_pool(tiny_profile(1_000, 1, PrecisionMode::Medium));
        pool.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        pool.stop().await.expect("stop");

        let history = pool.eps_history();
        assert!(!history.is_empty());
        assert!(history.len() <= crate::telemetry::EPS_HISTORY_CAPACITY);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn snapshot_stream_delivers() {
        let (_sink, mut pool) = sink_pool(tiny_profile(1_000, 1, PrecisionMode::Medium));
        let mut stream = pool.subscribe();
        pool.start().await.expect("start");

        let snapshot = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("stream produced within deadline")
            .expect("stream open");
        assert_eq!(snapshot.configured_workers, 1);

        pool.stop().await.expect("stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn alert_handlers_fire_on_shortfall() {
        struct CountingHandler(AtomicUsize);
        impl AlertHandler for CountingHandler {
            fn handle(&self, alert: &Alert) {
                assert!(!alert.message.is_empty());
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        // A 10M EPS floor cannot be met by one tiny worker; LowEps must
        // fire on every aggregation pass.
        let (_sink, mut pool) = sink_pool(tiny_profile(1_000, 1, PrecisionMode::Medium));
        pool.set_alert_thresholds(AlertThresholds {
            min_eps: 10_000_000,
            max_packet_loss: 100.0,
            max_cpu_pct: 1_000.0,
            max_memory_bytes: u64::MAX,
        });
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        pool.add_alert_handler(handler.clone());

        pool.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        pool.stop().await.expect("stop");

        assert!(handler.0.load(Ordering::SeqCst) > 0);
    }
}
