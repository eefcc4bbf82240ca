//! Process self-observation.
//!
//! A background thread samples this process's CPU share and resident
//! memory at 1 Hz and publishes the latest reading through an atomic slot.
//! The aggregator folds the reading into each pool snapshot; the numbers
//! are advisory.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use arc_swap::ArcSwap;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

/// One reading of the process's resource usage.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Sample {
    /// CPU usage as a percentage of one core.
    pub(crate) cpu_pct: f64,
    /// Resident set size in bytes.
    pub(crate) memory_bytes: u64,
}

/// Samples the current process at a fixed cadence on its own thread.
#[derive(Debug)]
pub(crate) struct SystemSampler {
    slot: Arc<ArcSwap<Sample>>,
    halt: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SystemSampler {
    /// Spawn the sampling thread.
    pub(crate) fn start() -> std::io::Result<Self> {
        let slot = Arc::new(ArcSwap::from_pointee(Sample::default()));
        let halt = Arc::new(AtomicBool::new(false));

        let thread_slot = Arc::clone(&slot);
        let thread_halt = Arc::clone(&halt);
        let handle = thread::Builder::new()
            .name("logspray-observer".to_string())
            .spawn(move || sample_loop(&thread_slot, &thread_halt))?;

        Ok(Self {
            slot,
            halt,
            handle: Some(handle),
        })
    }

    /// The most recent reading.
    #[cfg(test)]
    pub(crate) fn sample(&self) -> Sample {
        **self.slot.load()
    }

    /// A shareable handle onto the sample slot, for readers that outlive
    /// borrows of the sampler.
    pub(crate) fn reader(&self) -> Arc<ArcSwap<Sample>> {
        Arc::clone(&self.slot)
    }

    /// Stop and join the sampling thread.
    pub(crate) fn stop(&mut self) {
        self.halt.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SystemSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sample_loop(slot: &ArcSwap<Sample>, halt: &AtomicBool) {
    let mut sys = System::new();
    let pid = Pid::from_u32(std::process::id());

    // cpu_usage needs two observations; prime the first.
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));

    while !halt.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_secs(1));

        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        let Some(process) = sys.process(pid) else {
            debug!("own process vanished from the process table");
            continue;
        };

        slot.store(Arc::new(Sample {
            cpu_pct: f64::from(process.cpu_usage()),
            memory_bytes: process.memory(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::SystemSampler;

    #[test]
    fn sampler_produces_a_reading_and_stops_cleanly() {
        let mut sampler = SystemSampler::start().expect("sampler start");

        // Within a couple of cadences the slot holds a real reading; memory
        // of a live test process is never zero.
        let mut observed = sampler.sample();
        for _ in 0..30 {
            if observed.memory_bytes > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
            observed = sampler.sample();
        }
        assert!(observed.memory_bytes > 0);
        assert!(observed.cpu_pct >= 0.0);

        sampler.stop();
    }
}
