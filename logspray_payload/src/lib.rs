//! Syslog payload generation for logspray.
//!
//! A [`SystemLog`] instance produces RFC-3164-style records of the form
//! `<PRI>TIMESTAMP HOST SERVICE[PID]: MESSAGE` where every field is chosen
//! by bounded pseudo-random index into a pool precomputed at construction.
//! After construction the generate path allocates nothing: records are
//! appended into a caller-owned buffer.
//!
//! Instances are intended to be per-worker. Nothing here is `Sync`; a
//! worker owns its templater the way it owns its socket.

#![deny(clippy::all)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]

use rand::{rngs::SmallRng, Rng, SeedableRng};
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};

/// RFC 3164 priority tokens, facility * 8 + severity for the kern, mail and
/// daemon facilities.
const PRIORITIES: [&str; 24] = [
    "<0>", "<1>", "<2>", "<3>", "<4>", "<5>", "<6>", "<7>", // kern
    "<16>", "<17>", "<18>", "<19>", "<20>", "<21>", "<22>", "<23>", // mail
    "<32>", "<33>", "<34>", "<35>", "<36>", "<37>", "<38>", "<39>", // daemon
];

const HOSTNAMES: [&str; 19] = [
    "server01", "server02", "server03", "server04", "server05", "web01", "web02", "web03", "db01",
    "db02", "cache01", "cache02", "app01", "app02", "app03", "proxy01", "proxy02", "lb01", "lb02",
];

const SERVICES: [&str; 16] = [
    "systemd",
    "kernel",
    "sshd",
    "nginx",
    "apache2",
    "mysqld",
    "redis-server",
    "cron",
    "rsyslog",
    "NetworkManager",
    "docker",
    "kubelet",
    "containerd",
    "etcd",
    "prometheus",
    "grafana",
];

const MESSAGES: [&str; 20] = [
    "Starting nginx.service",
    "Started nginx.service",
    "Stopping nginx.service",
    "Starting docker.service",
    "Started docker.service",
    "Unit entered failed state",
    "CPU0: temperature above threshold",
    "Out of memory: Kill process",
    "device eth0: link up",
    "TCP: Possible SYN flooding on port 80",
    "oom-killer: Killed process",
    "Accepted password for admin from 192.168.1.100",
    "Failed password for admin from 192.168.1.200",
    "Connection closed by 192.168.1.100",
    "pam_unix(sshd:session): session opened for user admin",
    "(root) CMD (/usr/bin/updatedb)",
    "action 'action 17' suspended",
    "device (eth0): state change",
    "Certificate will expire",
    "Disk space warning: /var partition at 85%",
];

/// Lowest PID rendered into the PID pool.
const PID_FLOOR: u32 = 1_000;
/// Number of distinct PIDs in the pool, `[PID_FLOOR, PID_FLOOR + PID_COUNT)`.
const PID_COUNT: u32 = 10_000;

/// UTC with millisecond precision, e.g. `2026-08-02T10:04:05.000Z`.
const TIMESTAMP_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
);

/// Errors produced by [`SystemLog`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A component pool was empty at construction.
    #[error("component pool `{0}` must not be empty")]
    EmptyPool(&'static str),
    /// The wall-clock timestamp could not be formatted.
    #[error("timestamp format failure: {0}")]
    TimestampFormat(#[from] time::error::Format),
}

#[derive(Debug)]
/// A syslog record templater.
///
/// Selection pools are precomputed once; the generate path is index
/// arithmetic and buffer appends only.
pub struct SystemLog {
    hostnames: Vec<String>,
    services: Vec<String>,
    messages: Vec<String>,
    /// Pre-rendered PID strings, avoiding integer formatting per record.
    pids: Vec<String>,
    /// Formatted wall-clock timestamp, refreshed by the owner at 1 Hz. May
    /// lag real time by up to one second; syslog consumers accept sender
    /// clock skew.
    timestamp: String,
    /// Unix second the cached timestamp was rendered for.
    timestamp_second: i64,
    rng: SmallRng,
}

impl SystemLog {
    /// Create a new [`SystemLog`] instance with the built-in pools.
    ///
    /// # Errors
    ///
    /// Function will return an error if the initial timestamp cannot be
    /// formatted.
    pub fn new(seed: u64) -> Result<Self, Error> {
        Self::with_pools(
            HOSTNAMES.iter().map(ToString::to_string).collect(),
            SERVICES.iter().map(ToString::to_string).collect(),
            MESSAGES.iter().map(ToString::to_string).collect(),
            seed,
        )
    }

    /// Create a new [`SystemLog`] instance with caller-supplied pools.
    ///
    /// # Errors
    ///
    /// Function will return an error if any pool is empty or the initial
    /// timestamp cannot be formatted.
    pub fn with_pools(
        hostnames: Vec<String>,
        services: Vec<String>,
        messages: Vec<String>,
        seed: u64,
    ) -> Result<Self, Error> {
        if hostnames.is_empty() {
            return Err(Error::EmptyPool("hostnames"));
        }
        if services.is_empty() {
            return Err(Error::EmptyPool("services"));
        }
        if messages.is_empty() {
            return Err(Error::EmptyPool("messages"));
        }

        let pids = (PID_FLOOR..PID_FLOOR + PID_COUNT)
            .map(|pid| pid.to_string())
            .collect();

        let mut templater = Self {
            hostnames,
            services,
            messages,
            pids,
            timestamp: String::with_capacity(24),
            timestamp_second: i64::MIN,
            rng: SmallRng::seed_from_u64(seed),
        };
        templater.refresh_timestamp()?;
        Ok(templater)
    }

    /// Re-render the cached timestamp if the wall-clock second has rolled
    /// over.
    ///
    /// Owners call this at batch boundaries, amortising the format cost
    /// across many generated records.
    ///
    /// # Errors
    ///
    /// Function will return an error if the timestamp cannot be formatted.
    pub fn refresh_timestamp(&mut self) -> Result<(), Error> {
        let now = OffsetDateTime::now_utc();
        if now.unix_timestamp() == self.timestamp_second {
            return Ok(());
        }
        self.timestamp = now.format(TIMESTAMP_FORMAT)?;
        self.timestamp_second = now.unix_timestamp();
        Ok(())
    }

    /// Append one record to `buf`. Infallible and allocation-free, assuming
    /// `buf` has spare capacity.
    pub fn generate_into(&mut self, buf: &mut Vec<u8>) {
        let priority = PRIORITIES[self.rng.gen_range(0..PRIORITIES.len())];
        let hostname = &self.hostnames[self.rng.gen_range(0..self.hostnames.len())];
        let service = &self.services[self.rng.gen_range(0..self.services.len())];
        let pid = &self.pids[self.rng.gen_range(0..self.pids.len())];
        let message = &self.messages[self.rng.gen_range(0..self.messages.len())];

        buf.extend_from_slice(priority.as_bytes());
        buf.extend_from_slice(self.timestamp.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(hostname.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(service.as_bytes());
        buf.push(b'[');
        buf.extend_from_slice(pid.as_bytes());
        buf.extend_from_slice(b"]: ");
        buf.extend_from_slice(message.as_bytes());
    }

    /// An upper bound on the byte length of a single generated record, for
    /// sizing batch buffers.
    #[must_use]
    pub fn max_record_len(&self) -> usize {
        let longest = |pool: &[String]| pool.iter().map(String::len).max().unwrap_or(0);

        // "<39>" + timestamp + ' ' + host + ' ' + service + '[' + pid + "]: " + message
        4 + self.timestamp.len().max(24)
            + 1
            + longest(&self.hostnames)
            + 1
            + longest(&self.services)
            + 1
            + 5
            + 3
            + longest(&self.messages)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{SystemLog, HOSTNAMES, MESSAGES, PID_COUNT, PID_FLOOR, SERVICES};

    fn parse_record(record: &str) -> (u8, &str, &str, &str, u32, &str) {
        let rest = record.strip_prefix('<').expect("missing PRI open");
        let (pri, rest) = rest.split_once('>').expect("missing PRI close");
        let pri: u8 = pri.parse().expect("PRI not numeric");

        let (timestamp, rest) = rest.split_once(' ').expect("missing timestamp");
        let (hostname, rest) = rest.split_once(' ').expect("missing hostname");
        let (service, rest) = rest.split_once('[').expect("missing service");
        let (pid, message) = rest.split_once("]: ").expect("missing pid close");
        let pid: u32 = pid.parse().expect("PID not numeric");

        (pri, timestamp, hostname, service, pid, message)
    }

    proptest! {
        // Every generated record must carry fields drawn from the pools and
        // a well-formed header, for any seed.
        #[test]
        fn record_shape_holds(seed: u64) {
            let mut templater = SystemLog::new(seed).expect("construction");
            let mut buf = Vec::with_capacity(templater.max_record_len());

            for _ in 0..32 {
                buf.clear();
                templater.generate_into(&mut buf);
                prop_assert!(buf.len() <= templater.max_record_len());

                let record = std::str::from_utf8(&buf).expect("not utf-8");
                prop_assert!(!record.contains('\n'));

                let (pri, timestamp, hostname, service, pid, message) = parse_record(record);
                prop_assert!(
                    (0..=7).contains(&pri) || (16..=23).contains(&pri) || (32..=39).contains(&pri)
                );
                // e.g. 2026-08-02T10:04:05.000Z
                prop_assert_eq!(timestamp.len(), 24);
                prop_assert!(timestamp.ends_with('Z'));
                prop_assert!(HOSTNAMES.contains(&hostname));
                prop_assert!(SERVICES.contains(&service));
                prop_assert!((PID_FLOOR..PID_FLOOR + PID_COUNT).contains(&pid));
                prop_assert!(MESSAGES.contains(&message));
            }
        }

        // Two templaters with the same seed emit the same byte stream.
        #[test]
        fn deterministic_for_seed(seed: u64) {
            let mut a = SystemLog::new(seed).expect("construction");
            let mut b = SystemLog::new(seed).expect("construction");

            let mut buf_a = Vec::new();
            let mut buf_b = Vec::new();
            for _ in 0..16 {
                a.generate_into(&mut buf_a);
                b.generate_into(&mut buf_b);
            }
            prop_assert_eq!(buf_a, buf_b);
        }
    }

    #[test]
    fn empty_pool_is_a_construction_error() {
        let err = SystemLog::with_pools(vec![], vec!["sshd".to_string()], vec!["m".to_string()], 0);
        assert!(matches!(err, Err(super::Error::EmptyPool("hostnames"))));

        let err = SystemLog::with_pools(vec!["h".to_string()], vec![], vec!["m".to_string()], 0);
        assert!(matches!(err, Err(super::Error::EmptyPool("services"))));

        let err = SystemLog::with_pools(vec!["h".to_string()], vec!["s".to_string()], vec![], 0);
        assert!(matches!(err, Err(super::Error::EmptyPool("messages"))));
    }

    #[test]
    fn generate_does_not_grow_a_sized_buffer() {
        let mut templater = SystemLog::new(11).expect("construction");
        let mut buf = Vec::with_capacity((templater.max_record_len() + 1) * 64);
        let cap = buf.capacity();

        for _ in 0..64 {
            templater.generate_into(&mut buf);
            buf.push(b'\n');
        }
        // A batch sized off max_record_len never reallocates.
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn refresh_is_idempotent_within_a_second() {
        let mut templater = SystemLog::new(3).expect("construction");
        let before = templater.timestamp.clone();
        templater.refresh_timestamp().expect("refresh");
        // Two refreshes within the same second must not re-render.
        assert_eq!(before, templater.timestamp);
    }
}
