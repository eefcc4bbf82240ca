//! The logspray UDP syslog load generator.
//!
//! logspray drives a configurable aggregate rate of RFC-3164-style syslog
//! records at a single destination over UDP, holding the rate inside the
//! precision band of the selected profile while exposing live telemetry.
//! The moving parts:
//!
//! * [`profile`] maps a named tier or arbitrary target to a coherent
//!   parameter bundle,
//! * [`worker`] holds one worker's share of the rate on its own hot
//!   thread,
//! * [`pool`] owns the fleet, aggregates counters at 1 Hz and publishes
//!   snapshots,
//! * [`telemetry`] derives the quality scores, retains bounded history and
//!   fires threshold alerts.
//!
//! This library supports the `logspray` binary found elsewhere in this
//! project; the pieces are not intended for use outside of it, although if
//! they are helpful in other domains that's a nice surprise.

#![deny(clippy::all)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(clippy::unnecessary_to_owned)]
#![deny(clippy::float_cmp)]
#![deny(clippy::redundant_allocation)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod pool;
pub mod profile;
pub mod telemetry;
pub mod worker;

pub(crate) mod observer;
