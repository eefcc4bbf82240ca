//! The UDP sender worker.
//!
//! One worker owns one connected UDP socket and one hot OS thread that
//! drives a per-worker EPS share toward the destination. The send loop
//! variant is selected by [`PrecisionMode`]; all variants share the same
//! skeleton -- generate, assemble, send, account, wait -- and differ only
//! in their pacing policy.
//!
//! ## Metrics
//!
//! `bytes_written`: Bytes written successfully
//! `packets_sent`: Datagrams written successfully
//! `write_failure`: Number of failed sends
//!
//! Counters are emitted at snapshot cadence (1 Hz) rather than per send so
//! the hot path stays label-free.

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant, SystemTime},
};

use metrics::{counter, gauge};
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use logspray_payload::SystemLog;
use logspray_signal::Watcher;

use crate::profile::PrecisionMode;

pub(crate) mod pacing;

use pacing::{apply_to_interval, sleep_remaining, wait_until, Ema, Pid, ScalarFeedback};

/// Largest UDP payload that fits a single datagram.
/// <https://stackoverflow.com/a/42610200>
const MAX_DATAGRAM_BYTES: usize = 65_507;

/// Cadence of EPS smoothing inside the hot loop.
const EPS_UPDATE_INTERVAL: Duration = Duration::from_millis(100);
/// Cadence of snapshot emission toward the pool aggregator.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);
/// Slots in the per-worker average-EPS window, one per snapshot.
const AVERAGE_WINDOW: usize = 60;

/// Errors produced by [`Worker`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The OS refused the UDP socket.
    #[error("worker {worker_id}: socket open failed: {source}")]
    SocketOpen {
        /// Worker that failed to come up.
        worker_id: u32,
        /// Underlying OS error.
        source: io::Error,
    },
    /// The OS refused the requested socket buffer sizing.
    #[error("worker {worker_id}: setsockopt failed: {source}")]
    Sockopt {
        /// Worker that failed to come up.
        worker_id: u32,
        /// Underlying OS error.
        source: io::Error,
    },
    /// Payload templater construction failed.
    #[error(transparent)]
    Payload(#[from] logspray_payload::Error),
    /// `start` was called on a running or spent worker.
    #[error("worker {0} is already running")]
    AlreadyRunning(u32),
    /// `stop` was called on a worker that is not running.
    #[error("worker {0} is not running")]
    NotRunning(u32),
    /// The OS refused the sender thread.
    #[error("worker {worker_id}: thread spawn failed: {source}")]
    Thread {
        /// Worker that failed to come up.
        worker_id: u32,
        /// Underlying OS error.
        source: io::Error,
    },
}

/// Construction-time knobs for one worker, drawn from the active profile.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Records per tick before feedback adjustment.
    pub batch_size: u32,
    /// Nominal send cadence.
    pub tick_interval: Duration,
    /// `SO_SNDBUF` request.
    pub send_buf_bytes: u32,
    /// `SO_RCVBUF` request.
    pub recv_buf_bytes: u32,
    /// One send syscall per record instead of newline-joined batches.
    pub datagram_per_event: bool,
    /// Seed for this worker's payload PRNG.
    pub seed: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            tick_interval: Duration::from_millis(10),
            send_buf_bytes: 2 * 1024 * 1024,
            recv_buf_bytes: 1024 * 1024,
            datagram_per_event: false,
            seed: 0,
        }
    }
}

/// Point-in-time view of one worker, published at 1 Hz.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Snapshot {
    /// Worker identity.
    pub worker_id: u32,
    /// Telemetry label; the socket's local port is OS-assigned.
    pub local_port: u16,
    /// Smoothed achieved EPS.
    pub current_eps: i64,
    /// Mean of the last minute of smoothed EPS samples.
    pub average_eps: i64,
    /// Records sent since start.
    pub total_sent: u64,
    /// Failed send syscalls since start.
    pub error_count: u64,
    /// `error_count / total_sent`, as a percentage.
    pub packet_loss: f64,
    /// Wall-clock time of the last successful send; `UNIX_EPOCH` before the
    /// first.
    pub last_sent: SystemTime,
}

/// Counters shared between the hot thread (single writer) and readers.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    total_sent: AtomicU64,
    error_count: AtomicU64,
    bytes_sent: AtomicU64,
    packets_sent: AtomicU64,
    current_eps: AtomicI64,
    /// Unix microseconds of the last successful send; zero before the first.
    last_sent_unix_micros: AtomicU64,
}

impl Counters {
    pub(crate) fn total_sent(&self) -> u64 {
        self.total_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn current_eps(&self) -> i64 {
        self.current_eps.load(Ordering::Relaxed)
    }

    pub(crate) fn last_sent(&self) -> SystemTime {
        let micros = self.last_sent_unix_micros.load(Ordering::Relaxed);
        SystemTime::UNIX_EPOCH + Duration::from_micros(micros)
    }

    fn stamp_last_sent(&self) {
        self.last_sent_unix_micros
            .store(unix_micros_now(), Ordering::Relaxed);
    }
}

fn unix_micros_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as u64)
}

#[derive(Debug)]
/// A single UDP sender.
///
/// The worker is single-owner: only the pool holds it, only its hot thread
/// writes its counters. It runs once; after `stop` a fresh worker must be
/// constructed.
pub struct Worker {
    id: u32,
    local_port: u16,
    target_eps: u64,
    precision_mode: PrecisionMode,
    settings: Settings,
    counters: Arc<Counters>,
    snapshot_tx: mpsc::Sender<Snapshot>,
    running: Arc<AtomicBool>,
    halt: Arc<AtomicBool>,
    /// Present between `new` and `start`; the hot thread takes ownership.
    socket: Option<UdpSocket>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Create a new [`Worker`] connected to `peer`.
    ///
    /// The socket is opened and its kernel buffers sized here so that
    /// initialisation failures surface before any traffic starts.
    /// `local_port` is a telemetry label only; the local bind is OS-chosen.
    ///
    /// # Errors
    ///
    /// Function will return an error if the socket cannot be opened,
    /// connected or its buffers sized.
    pub fn new(
        id: u32,
        local_port: u16,
        peer: SocketAddr,
        settings: Settings,
        snapshot_tx: mpsc::Sender<Snapshot>,
    ) -> Result<Self, Error> {
        let socket = open_socket(id, peer, &settings)?;

        Ok(Self {
            id,
            local_port,
            target_eps: 0,
            precision_mode: PrecisionMode::Medium,
            settings,
            counters: Arc::new(Counters::default()),
            snapshot_tx,
            running: Arc::new(AtomicBool::new(false)),
            halt: Arc::new(AtomicBool::new(false)),
            socket: Some(socket),
            handle: None,
        })
    }

    /// Set this worker's share of the aggregate target.
    pub fn set_target_eps(&mut self, target_eps: u64) {
        self.target_eps = target_eps;
    }

    /// Choose the send-loop variant.
    pub fn set_precision_mode(&mut self, mode: PrecisionMode) {
        self.precision_mode = mode;
    }

    /// Spawn the hot send thread. Not idempotent: a second call fails, as
    /// does a call after `stop`.
    ///
    /// The thread terminates when `shutdown` fires, [`Worker::stop`] is
    /// called, or the socket suffers a fatal error.
    ///
    /// # Errors
    ///
    /// Function will return an error if the worker is running or spent, or
    /// if the payload templater cannot be constructed.
    pub fn start(&mut self, shutdown: Watcher) -> Result<(), Error> {
        let Some(socket) = self.socket.take() else {
            return Err(Error::AlreadyRunning(self.id));
        };
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning(self.id));
        }

        let templater = SystemLog::new(self.settings.seed)?;
        let loop_state = SendLoop {
            id: self.id,
            local_port: self.local_port,
            socket,
            templater,
            scratch: Vec::with_capacity(MAX_DATAGRAM_BYTES),
            record_buf: Vec::with_capacity(512),
            target_eps: self.target_eps,
            batch_size: self.batch_size_or_derived(),
            tick_interval: self.settings.tick_interval,
            datagram_per_event: self.settings.datagram_per_event,
            counters: Arc::clone(&self.counters),
            snapshot_tx: self.snapshot_tx.clone(),
            shutdown,
            halt: Arc::clone(&self.halt),
            tracker: EpsTracker::new(),
            seed: self.settings.seed,
        };

        let mode = self.precision_mode;
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name(format!("logspray-worker-{id}", id = self.id))
            .spawn(move || {
                debug!(worker_id = loop_state.id, ?mode, "sender thread running");
                loop_state.run(mode);
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|source| Error::Thread {
                worker_id: self.id,
                source,
            })?;
        self.handle = Some(handle);

        Ok(())
    }

    /// Signal the hot thread and wait for it to terminate. The socket is
    /// released when the thread drops it.
    ///
    /// # Errors
    ///
    /// Function will return an error if the worker was never started or has
    /// already been stopped.
    pub fn stop(&mut self) -> Result<(), Error> {
        let Some(handle) = self.handle.take() else {
            return Err(Error::NotRunning(self.id));
        };

        self.halt.store(true, Ordering::SeqCst);
        if handle.join().is_err() {
            warn!(worker_id = self.id, "sender thread panicked");
        }
        self.running.store(false, Ordering::SeqCst);

        Ok(())
    }

    /// Smoothed achieved EPS.
    #[must_use]
    pub fn current_eps(&self) -> u64 {
        u64::try_from(self.counters.current_eps()).unwrap_or(0)
    }

    /// Records sent since start.
    #[must_use]
    pub fn total_sent(&self) -> u64 {
        self.counters.total_sent()
    }

    /// Whether the hot thread is live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Worker identity.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Telemetry port label.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub(crate) fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// Profile batch size, or one derived from the target when the profile
    /// left it unset.
    fn batch_size_or_derived(&self) -> u32 {
        if self.settings.batch_size > 0 {
            return self.settings.batch_size;
        }
        let ticks_per_sec = (1.0 / self.settings.tick_interval.as_secs_f64()).max(1.0);
        let derived = (self.target_eps as f64 / ticks_per_sec).round();
        (derived as u32).max(1)
    }
}

fn open_socket(id: u32, peer: SocketAddr, settings: &Settings) -> Result<UdpSocket, Error> {
    let domain = Domain::for_address(peer);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|source| Error::SocketOpen {
            worker_id: id,
            source,
        })?;

    socket
        .set_send_buffer_size(settings.send_buf_bytes as usize)
        .and_then(|()| socket.set_recv_buffer_size(settings.recv_buf_bytes as usize))
        .map_err(|source| Error::Sockopt {
            worker_id: id,
            source,
        })?;

    // Connected send-only socket; the local bind is left to the OS.
    socket
        .connect(&peer.into())
        .map_err(|source| Error::SocketOpen {
            worker_id: id,
            source,
        })?;

    Ok(socket.into())
}

/// Everything the hot thread owns. No field is shared except the atomic
/// counters and the halt flag.
struct SendLoop {
    id: u32,
    local_port: u16,
    socket: UdpSocket,
    templater: SystemLog,
    /// Packet-concat buffer: newline-joined records up to one datagram.
    scratch: Vec<u8>,
    /// Single-record slot buffer.
    record_buf: Vec<u8>,
    target_eps: u64,
    batch_size: u32,
    tick_interval: Duration,
    datagram_per_event: bool,
    counters: Arc<Counters>,
    snapshot_tx: mpsc::Sender<Snapshot>,
    shutdown: Watcher,
    halt: Arc<AtomicBool>,
    tracker: EpsTracker,
    seed: u64,
}

impl SendLoop {
    fn run(mut self, mode: PrecisionMode) {
        match mode {
            PrecisionMode::Ultra => self.run_ultra(),
            PrecisionMode::Realtime => self.run_realtime(),
            PrecisionMode::High => self.run_high(),
            PrecisionMode::Medium => self.run_medium(),
            PrecisionMode::Performance => self.run_performance(),
        }
        info!(
            worker_id = self.id,
            total_sent = self.counters.total_sent(),
            errors = self.counters.error_count(),
            "sender thread stopped"
        );
    }

    /// True when the loop must wind down. Checked once per tick.
    fn cancelled(&mut self) -> bool {
        if self.halt.load(Ordering::Relaxed) {
            return true;
        }
        !matches!(self.shutdown.try_recv(), Ok(false))
    }

    /// Housekeeping shared by every loop variant: timestamp refresh before
    /// generation, EPS smoothing and snapshot emission after accounting.
    fn on_tick_start(&mut self) {
        // Formatting failure would repeat every second; keep the stale
        // timestamp rather than log-storm the hot path.
        let _ = self.templater.refresh_timestamp();
    }

    fn on_tick_end(&mut self) {
        if let Some(smoothed) = self.tracker.maybe_smooth(self.counters.total_sent()) {
            self.counters
                .current_eps
                .store(smoothed as i64, Ordering::Relaxed);
        }
        if let Some(snapshot) = self.tracker.maybe_snapshot(
            self.id,
            self.local_port,
            &self.counters,
        ) {
            // The aggregator must never block this thread; on a full
            // channel the sample is simply dropped.
            let _ = self.snapshot_tx.try_send(snapshot);
            self.emit_counters();
        }
    }

    fn emit_counters(&self) {
        counter!("bytes_written", "worker" => self.id.to_string())
            .absolute(self.counters.bytes_sent());
        counter!("packets_sent", "worker" => self.id.to_string())
            .absolute(self.counters.packets_sent());
        counter!("write_failure", "worker" => self.id.to_string())
            .absolute(self.counters.error_count());
        gauge!("worker_eps", "worker" => self.id.to_string())
            .set(self.counters.current_eps() as f64);
    }

    /// Generate and send `n` records. Send errors are counted and the loop
    /// carries on; UDP is fire-and-forget.
    fn send_batch(&mut self, n: u32) {
        if self.datagram_per_event {
            for _ in 0..n {
                self.record_buf.clear();
                self.templater.generate_into(&mut self.record_buf);
                self.send_datagram_from_record();
            }
            return;
        }

        self.scratch.clear();
        let mut pending = 0_u64;
        for _ in 0..n {
            self.record_buf.clear();
            self.templater.generate_into(&mut self.record_buf);

            let needed = self.record_buf.len() + usize::from(!self.scratch.is_empty());
            if self.scratch.len() + needed > MAX_DATAGRAM_BYTES {
                self.flush_scratch(pending);
                pending = 0;
            }
            if !self.scratch.is_empty() {
                self.scratch.push(b'\n');
            }
            self.scratch.extend_from_slice(&self.record_buf);
            pending += 1;
        }
        self.flush_scratch(pending);
    }

    fn flush_scratch(&mut self, records: u64) {
        if records == 0 || self.scratch.is_empty() {
            return;
        }
        match self.socket.send(&self.scratch) {
            Ok(bytes) => {
                self.counters
                    .total_sent
                    .fetch_add(records, Ordering::Relaxed);
                self.counters
                    .bytes_sent
                    .fetch_add(bytes as u64, Ordering::Relaxed);
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.counters.stamp_last_sent();
            }
            Err(err) => {
                debug!(worker_id = self.id, "send failed: {err}");
                self.counters.error_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.scratch.clear();
    }

    fn send_datagram_from_record(&mut self) {
        match self.socket.send(&self.record_buf) {
            Ok(bytes) => {
                self.counters.total_sent.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_sent
                    .fetch_add(bytes as u64, Ordering::Relaxed);
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.counters.stamp_last_sent();
            }
            Err(err) => {
                debug!(worker_id = self.id, "send failed: {err}");
                self.counters.error_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// High precision: profile-cadence ticks, PID-adjusted batch interval
    /// every 50 ms.
    fn run_high(&mut self) {
        let target = self.target_eps;
        let mut pid = Pid::for_target(target);
        let mut interval = self.tick_interval;
        let mut last_control = Instant::now();

        loop {
            if self.cancelled() {
                return;
            }
            let tick_start = Instant::now();

            self.on_tick_start();
            self.send_batch(self.batch_size);
            self.on_tick_end();

            if target > 0 && last_control.elapsed() >= Duration::from_millis(50) {
                let out = pid.update(target, self.counters.current_eps() as f64);
                interval = apply_to_interval(interval, out);
                last_control = Instant::now();
            }

            sleep_remaining(tick_start, interval);
        }
    }

    /// Medium precision: 10 ms ticker, proportional batch-size adjustment
    /// every 200 ms.
    fn run_medium(&mut self) {
        let target = self.target_eps;
        // The 10 ms ticker floors out at 100 EPS with single-record
        // batches; slower targets keep the profile's stretched cadence.
        let interval = if target >= 100 || target == 0 {
            Duration::from_millis(10)
        } else {
            self.tick_interval
        };
        let base_batch =
            ((target as f64 * interval.as_secs_f64()).round() as u32).max(1);
        let mut feedback = ScalarFeedback::medium();
        let mut window = RateWindow::new(Duration::from_millis(200));

        loop {
            if self.cancelled() {
                return;
            }
            let tick_start = Instant::now();

            let batch = scaled_batch(base_batch, feedback.factor());
            self.on_tick_start();
            let before = self.counters.total_sent();
            self.send_batch(batch);
            window.add(self.counters.total_sent() - before);
            self.on_tick_end();

            if target > 0 {
                if let Some(actual_eps) = window.maybe_rate() {
                    feedback.observe(target, actual_eps);
                }
            }

            sleep_remaining(tick_start, interval);
        }
    }

    /// Performance: profile-cadence ticker, coarse scalar feedback every
    /// 100 ms, initialised with a 6.4% oversend boost.
    fn run_performance(&mut self) {
        let target = self.target_eps;
        let interval = self.tick_interval;
        let base_batch =
            ((target as f64 * interval.as_secs_f64()).round() as u32).max(1);
        let mut feedback = ScalarFeedback::performance();
        let mut window = RateWindow::new(Duration::from_millis(100));

        loop {
            if self.cancelled() {
                return;
            }
            let tick_start = Instant::now();

            let batch = scaled_batch(base_batch, feedback.factor());
            self.on_tick_start();
            let before = self.counters.total_sent();
            self.send_batch(batch);
            window.add(self.counters.total_sent() - before);
            self.on_tick_end();

            if target > 0 {
                if let Some(actual_eps) = window.maybe_rate() {
                    feedback.observe(target, actual_eps);
                }
            }

            sleep_remaining(tick_start, interval);
        }
    }

    /// Ultra: absolute nanosecond schedule (`next = start + n * interval`)
    /// with hybrid sleep/yield/spin waits and a +/-1% batch-size trim every
    /// 100 ms.
    fn run_ultra(&mut self) {
        let target = self.target_eps;
        let interval = self.tick_interval;
        let mut batch =
            ((target as f64 * interval.as_secs_f64() * 1.064).round()).max(1.0);
        let mut window = RateWindow::new(Duration::from_millis(100));

        let start = Instant::now();
        let mut tick: u32 = 0;

        loop {
            if self.cancelled() {
                return;
            }

            self.on_tick_start();
            let before = self.counters.total_sent();
            self.send_batch((batch.round() as u32).max(1));
            window.add(self.counters.total_sent() - before);
            self.on_tick_end();

            if target > 0 {
                if let Some(actual_eps) = window.maybe_rate() {
                    let error = (target as f64 - actual_eps) / target as f64;
                    if error > 0.01 {
                        batch *= 1.01;
                    } else if error < -0.01 {
                        batch *= 0.99;
                    }
                }
            }

            tick = tick.wrapping_add(1);
            wait_until(start + interval * tick);
        }
    }

    /// Realtime: fixed-interval ticker whose batches are pre-generated by a
    /// companion thread, double-buffered through a bounded channel.
    fn run_realtime(&mut self) {
        let target = self.target_eps;
        let interval = self.tick_interval;
        let batch = ((target as f64 * interval.as_secs_f64() * 1.064).round() as u32).max(1);

        let (batch_tx, batch_rx) = std::sync::mpsc::sync_channel::<Vec<u8>>(2);
        let halt = Arc::clone(&self.halt);
        let shutdown = self.shutdown.clone();
        let gen_seed = self.seed.wrapping_add(1);
        let generator = thread::Builder::new()
            .name(format!("logspray-gen-{id}", id = self.id))
            .spawn(move || pregenerate(gen_seed, batch, batch_tx, halt, shutdown));
        let generator = match generator {
            Ok(handle) => handle,
            Err(err) => {
                warn!(worker_id = self.id, "pre-generation thread failed: {err}");
                return self.run_high();
            }
        };

        let start = Instant::now();
        let mut tick: u32 = 0;
        loop {
            if self.cancelled() {
                break;
            }

            // Prefer the pre-generated buffer; fall back to inline
            // generation when the companion lags a tick.
            match batch_rx.try_recv() {
                Ok(buf) => self.send_pregenerated(&buf, u64::from(batch)),
                Err(_) => {
                    self.on_tick_start();
                    self.send_batch(batch);
                }
            }
            self.on_tick_end();

            tick = tick.wrapping_add(1);
            wait_until(start + interval * tick);
        }

        drop(batch_rx);
        let _ = generator.join();
    }

    fn send_pregenerated(&mut self, buf: &[u8], records: u64) {
        for chunk in split_datagrams(buf) {
            let chunk_records = records_in(chunk, records, buf.len());
            match self.socket.send(chunk) {
                Ok(bytes) => {
                    self.counters
                        .total_sent
                        .fetch_add(chunk_records, Ordering::Relaxed);
                    self.counters
                        .bytes_sent
                        .fetch_add(bytes as u64, Ordering::Relaxed);
                    self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                    self.counters.stamp_last_sent();
                }
                Err(err) => {
                    debug!(worker_id = self.id, "send failed: {err}");
                    self.counters.error_count.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Companion producer for the Realtime loop: render whole newline-joined
/// batches off the hot path.
fn pregenerate(
    seed: u64,
    batch: u32,
    tx: std::sync::mpsc::SyncSender<Vec<u8>>,
    halt: Arc<AtomicBool>,
    mut shutdown: Watcher,
) {
    let Ok(mut templater) = SystemLog::new(seed) else {
        return;
    };

    loop {
        if halt.load(Ordering::Relaxed) || !matches!(shutdown.try_recv(), Ok(false)) {
            return;
        }
        let _ = templater.refresh_timestamp();

        let mut buf = Vec::with_capacity(templater.max_record_len() * batch as usize);
        for i in 0..batch {
            if i > 0 {
                buf.push(b'\n');
            }
            templater.generate_into(&mut buf);
        }

        // Blocks when both slots are full, which is the pacing backstop.
        if tx.send(buf).is_err() {
            return;
        }
    }
}

/// Split a newline-joined buffer into datagram-sized chunks on record
/// boundaries.
fn split_datagrams(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = buf;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        if rest.len() <= MAX_DATAGRAM_BYTES {
            let chunk = rest;
            rest = &[];
            return Some(chunk);
        }
        let cut = rest[..MAX_DATAGRAM_BYTES]
            .iter()
            .rposition(|&b| b == b'\n')
            .unwrap_or(MAX_DATAGRAM_BYTES - 1);
        let (chunk, tail) = rest.split_at(cut);
        rest = tail.strip_prefix(b"\n").unwrap_or(tail);
        Some(chunk)
    })
}

/// Attribute a proportional share of `total_records` to a chunk of a
/// pre-generated buffer.
fn records_in(chunk: &[u8], total_records: u64, total_len: usize) -> u64 {
    if total_len == 0 {
        return 0;
    }
    let share = chunk.len() as f64 / total_len as f64;
    ((total_records as f64 * share).round() as u64).max(1)
}

fn scaled_batch(base: u32, factor: f64) -> u32 {
    ((f64::from(base) * factor).round() as u32).max(1)
}

/// Windowed send accounting for the scalar-feedback loops.
struct RateWindow {
    span: Duration,
    started: Instant,
    sent: u64,
}

impl RateWindow {
    fn new(span: Duration) -> Self {
        Self {
            span,
            started: Instant::now(),
            sent: 0,
        }
    }

    fn add(&mut self, records: u64) {
        self.sent += records;
    }

    /// The window's rate in EPS once the span has elapsed, resetting the
    /// window; `None` while the window is still open.
    fn maybe_rate(&mut self) -> Option<f64> {
        let elapsed = self.started.elapsed();
        if elapsed < self.span {
            return None;
        }
        let rate = self.sent as f64 / elapsed.as_secs_f64();
        self.sent = 0;
        self.started = Instant::now();
        Some(rate)
    }
}

/// EPS smoothing and snapshot cadence state, owned by the hot thread.
struct EpsTracker {
    ema: Ema,
    last_smooth: Instant,
    last_total: u64,
    last_snapshot: Instant,
    average_window: [i64; AVERAGE_WINDOW],
    average_idx: usize,
}

impl EpsTracker {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            ema: Ema::default(),
            last_smooth: now,
            last_total: 0,
            last_snapshot: now,
            average_window: [0; AVERAGE_WINDOW],
            average_idx: 0,
        }
    }

    /// Smooth the instantaneous rate every 100 ms.
    fn maybe_smooth(&mut self, total_sent: u64) -> Option<f64> {
        let elapsed = self.last_smooth.elapsed();
        if elapsed < EPS_UPDATE_INTERVAL {
            return None;
        }
        let instantaneous =
            (total_sent - self.last_total) as f64 / elapsed.as_secs_f64();
        self.last_total = total_sent;
        self.last_smooth = Instant::now();
        Some(self.ema.update(instantaneous))
    }

    /// Compose a snapshot every second.
    fn maybe_snapshot(
        &mut self,
        worker_id: u32,
        local_port: u16,
        counters: &Counters,
    ) -> Option<Snapshot> {
        if self.last_snapshot.elapsed() < SNAPSHOT_INTERVAL {
            return None;
        }
        self.last_snapshot = Instant::now();

        let current = counters.current_eps();
        self.average_window[self.average_idx] = current;
        self.average_idx = (self.average_idx + 1) % AVERAGE_WINDOW;

        let live: Vec<i64> = self
            .average_window
            .iter()
            .copied()
            .filter(|&eps| eps > 0)
            .collect();
        let average_eps = if live.is_empty() {
            0
        } else {
            live.iter().sum::<i64>() / live.len() as i64
        };

        let total_sent = counters.total_sent();
        let error_count = counters.error_count();
        let packet_loss = if total_sent > 0 {
            error_count as f64 / total_sent as f64 * 100.0
        } else {
            0.0
        };

        Some(Snapshot {
            worker_id,
            local_port,
            current_eps: current,
            average_eps,
            total_sent,
            error_count,
            packet_loss,
            last_sent: counters.last_sent(),
        })
    }
}
