//! EPS profiles.
//!
//! A profile is a coherent operating point: how many workers, how large a
//! batch, how often to tick, how the kernel buffers are sized and which
//! send-loop variant holds the rate. Named profiles cover the supported
//! load tiers; `custom` derives a parameter set for an arbitrary target.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard ceiling on fleet size, bounding file-descriptor and thread usage.
pub const MAX_WORKERS: u32 = 200;

/// Inclusive bounds on any target EPS accepted by the catalogue.
pub const MIN_TARGET_EPS: u64 = 1;
/// See [`MIN_TARGET_EPS`].
pub const MAX_TARGET_EPS: u64 = 10_000_000;

const KIB: u32 = 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// Errors produced by profile lookup and derivation.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The requested profile name is not in the catalogue.
    #[error("unknown profile: {0}")]
    UnknownProfile(String),
    /// The requested target EPS is outside the supported range.
    #[error("target EPS out of bounds: {0}")]
    TargetOutOfBounds(u64),
    /// The requested worker count exceeds the hard ceiling.
    #[error("worker count {0} outside 1..={MAX_WORKERS}")]
    WorkerCountExceeded(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The send-loop variant a worker runs, trading scheduling accuracy against
/// CPU overhead.
pub enum PrecisionMode {
    /// Nanosecond absolute schedule, hybrid sleep/yield/spin wait. Within 1%.
    Ultra,
    /// Fixed-interval ticker with pre-generated batches. Within 2%.
    Realtime,
    /// Ticker with a PID-adjusted batch interval. Within 1%.
    High,
    /// Ticker with proportional batch-size adjustment. Within 5%.
    Medium,
    /// Ticker with coarse scalar feedback, throughput first. Within 10%.
    Performance,
}

impl PrecisionMode {
    /// The declared relative error bound of this mode in steady state.
    #[must_use]
    pub fn precision_bound(self) -> f64 {
        match self {
            PrecisionMode::Ultra | PrecisionMode::High => 0.01,
            PrecisionMode::Realtime => 0.02,
            PrecisionMode::Medium => 0.05,
            PrecisionMode::Performance => 0.10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// An immutable parameter bundle for one generator run.
pub struct Profile {
    /// Catalogue key, `custom` for derived profiles.
    pub name: String,
    /// Aggregate events-per-second goal across the fleet.
    pub target_eps: u64,
    /// Fleet size.
    pub worker_count: u32,
    /// Records per send tick, before feedback adjustment.
    pub batch_size: u32,
    /// Nominal cadence between sends.
    pub tick_interval: Duration,
    /// `SO_SNDBUF` request per worker socket.
    pub send_buf_bytes: u32,
    /// `SO_RCVBUF` request per worker socket.
    pub recv_buf_bytes: u32,
    /// Send-loop variant for every worker in the fleet.
    pub precision_mode: PrecisionMode,
    /// Advisory resident-memory ceiling, consumed by the auto-tuner and
    /// alert thresholds only.
    pub memory_limit_bytes: u64,
}

impl Profile {
    /// The per-worker share of the aggregate target.
    #[must_use]
    pub fn eps_per_worker(&self) -> u64 {
        self.target_eps / u64::from(self.worker_count.max(1))
    }

    /// Validate the bundle's invariants, as at pool initialisation.
    ///
    /// # Errors
    ///
    /// Function will return an error if the target EPS is out of bounds or
    /// the worker count exceeds the hard ceiling.
    pub fn validate(&self) -> Result<(), Error> {
        if !(MIN_TARGET_EPS..=MAX_TARGET_EPS).contains(&self.target_eps) {
            return Err(Error::TargetOutOfBounds(self.target_eps));
        }
        if self.worker_count == 0 || self.worker_count > MAX_WORKERS {
            return Err(Error::WorkerCountExceeded(self.worker_count));
        }
        Ok(())
    }
}

/// Names in the catalogue, excluding `custom`.
pub const NAMES: [&str; 5] = ["100k", "500k", "1m", "2m", "4m"];

/// Look up a named profile.
///
/// # Errors
///
/// Function will return an error if the name is not in the catalogue. Note
/// that `custom` is not a catalogue entry; see [`custom`].
pub fn get(name: &str) -> Result<Profile, Error> {
    let profile = match name {
        "100k" => Profile {
            name: "100k".to_string(),
            target_eps: 100_000,
            worker_count: 10,
            batch_size: 100,
            tick_interval: Duration::from_millis(10),
            send_buf_bytes: 8_192 * KIB,
            recv_buf_bytes: 4_096 * KIB,
            precision_mode: PrecisionMode::High,
            memory_limit_bytes: 2 * GIB,
        },
        "500k" => Profile {
            name: "500k".to_string(),
            target_eps: 500_000,
            worker_count: 50,
            batch_size: 100,
            tick_interval: Duration::from_millis(10),
            send_buf_bytes: 16_384 * KIB,
            recv_buf_bytes: 8_192 * KIB,
            precision_mode: PrecisionMode::High,
            memory_limit_bytes: 4 * GIB,
        },
        "1m" => Profile {
            name: "1m".to_string(),
            target_eps: 1_000_000,
            worker_count: 40,
            batch_size: 250,
            tick_interval: Duration::from_millis(10),
            send_buf_bytes: 32_768 * KIB,
            recv_buf_bytes: 16_384 * KIB,
            precision_mode: PrecisionMode::Performance,
            memory_limit_bytes: 6 * GIB,
        },
        "2m" => Profile {
            name: "2m".to_string(),
            target_eps: 2_000_000,
            worker_count: 80,
            batch_size: 250,
            tick_interval: Duration::from_millis(10),
            send_buf_bytes: 65_536 * KIB,
            recv_buf_bytes: 32_768 * KIB,
            precision_mode: PrecisionMode::Performance,
            memory_limit_bytes: 8 * GIB,
        },
        "4m" => Profile {
            name: "4m".to_string(),
            target_eps: 4_000_000,
            worker_count: 160,
            batch_size: 250,
            tick_interval: Duration::from_millis(10),
            send_buf_bytes: 131_072 * KIB,
            recv_buf_bytes: 65_536 * KIB,
            precision_mode: PrecisionMode::Performance,
            memory_limit_bytes: 12 * GIB,
        },
        other => return Err(Error::UnknownProfile(other.to_string())),
    };
    Ok(profile)
}

/// Derive a `custom` profile for an arbitrary aggregate target.
///
/// Worker count follows the per-worker EPS band for the target tier, floored
/// to a CPU-aware maximum and the hard cap. Batch size and tick interval are
/// derived so `batch x ticks_per_second` approximates the per-worker share.
///
/// # Errors
///
/// Function will return an error if `target_eps` is out of bounds.
pub fn custom(target_eps: u64) -> Result<Profile, Error> {
    if !(MIN_TARGET_EPS..=MAX_TARGET_EPS).contains(&target_eps) {
        return Err(Error::TargetOutOfBounds(target_eps));
    }

    let worker_count = derive_worker_count(target_eps);
    let per_worker = target_eps / u64::from(worker_count);

    // At least one record per tick; slow targets stretch the tick instead
    // of shrinking the batch below one.
    let (batch_size, tick_interval) = if per_worker < 100 {
        (1, Duration::from_micros(1_000_000 / per_worker.max(1)))
    } else {
        (
            u32::try_from(per_worker / 100).unwrap_or(u32::MAX),
            Duration::from_millis(10),
        )
    };

    let send_buf_kib = u32::try_from((target_eps / 10).clamp(8_192, 262_144))
        .expect("clamped to u32 range");
    let memory_limit_gib = (target_eps / 500_000 + 1).clamp(2, 12);

    Ok(Profile {
        name: "custom".to_string(),
        target_eps,
        worker_count,
        batch_size,
        tick_interval,
        send_buf_bytes: send_buf_kib * KIB,
        recv_buf_bytes: send_buf_kib / 2 * KIB,
        precision_mode: PrecisionMode::Medium,
        memory_limit_bytes: memory_limit_gib * GIB,
    })
}

fn derive_worker_count(target_eps: u64) -> u32 {
    let band = if target_eps <= 100_000 {
        10_000
    } else if target_eps <= 500_000 {
        20_000
    } else {
        25_000
    };

    let workers = u32::try_from((target_eps / band).max(1)).unwrap_or(MAX_WORKERS);

    let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    let cpu_cap = u32::try_from(cores * 10).unwrap_or(MAX_WORKERS);

    workers.min(cpu_cap).min(MAX_WORKERS)
}
