//! Pacing control for sender workers.
//!
//! Every send loop shares the same skeleton -- generate, assemble, send,
//! account, wait -- and differs only in how the wait is computed. The
//! controllers here are pure state machines over observed EPS so they can
//! be exercised against a simulated plant; the wall-clock never enters
//! them.

use std::time::{Duration, Instant};

/// Floor on the batch interval a controller may request.
pub(crate) const MIN_BATCH_INTERVAL: Duration = Duration::from_micros(10);
/// Ceiling on the batch interval a controller may request.
pub(crate) const MAX_BATCH_INTERVAL: Duration = Duration::from_millis(100);

/// A PID controller over the error between target and achieved EPS.
///
/// Gains are banded by the per-worker target: small fleets at low EPS need
/// a more aggressive controller than big fleets whose workers each carry a
/// large share.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    last_error: f64,
    /// Anti-windup bound on the integral accumulator.
    integral_limit: f64,
}

impl Pid {
    /// Gain band table, keyed by per-worker target EPS.
    pub(crate) fn for_target(target_eps: u64) -> Self {
        let (kp, ki, kd) = if target_eps <= 20_000 {
            (5e-5, 1e-5, 5e-6)
        } else if target_eps <= 50_000 {
            (3e-5, 8e-6, 3e-6)
        } else if target_eps <= 70_000 {
            (2e-5, 5e-6, 2e-6)
        } else {
            (1e-5, 3e-6, 1e-6)
        };

        Self {
            kp,
            ki,
            kd,
            integral: 0.0,
            last_error: 0.0,
            integral_limit: (target_eps as f64) * 10.0,
        }
    }

    /// Feed one observation, returning the raw controller output. Positive
    /// output means the worker is behind target and should send faster.
    pub(crate) fn update(&mut self, target_eps: u64, current_eps: f64) -> f64 {
        let error = target_eps as f64 - current_eps;

        let p = self.kp * error;

        self.integral =
            (self.integral + error).clamp(-self.integral_limit, self.integral_limit);
        let i = self.ki * self.integral;

        let d = self.kd * (error - self.last_error);
        self.last_error = error;

        p + i + d
    }

    #[cfg(test)]
    pub(crate) fn integral(&self) -> f64 {
        self.integral
    }
}

/// Scale `interval` by the controller output: behind target shrinks the
/// interval, ahead stretches it. The scale factor is bounded to a halving
/// or doubling per application, the interval itself to
/// `[MIN_BATCH_INTERVAL, MAX_BATCH_INTERVAL]`.
pub(crate) fn apply_to_interval(interval: Duration, pid_output: f64) -> Duration {
    let factor = (1.0 - pid_output).clamp(0.5, 2.0);
    let adjusted = interval.as_secs_f64() * factor;
    Duration::from_secs_f64(adjusted.clamp(
        MIN_BATCH_INTERVAL.as_secs_f64(),
        MAX_BATCH_INTERVAL.as_secs_f64(),
    ))
}

/// Proportional scalar feedback over a multiplicative batch-size factor,
/// used by the Medium and Performance loops.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScalarFeedback {
    /// Relative error below which no adjustment is made.
    deadband: f64,
    /// Proportional gain applied to the relative error.
    gain: f64,
    /// Bound on a single adjustment step.
    step_limit: f64,
    /// Bounds on the accumulated factor.
    factor_min: f64,
    factor_max: f64,
    factor: f64,
}

impl ScalarFeedback {
    /// Medium precision: 200 ms cadence, factor held within +/-30%.
    pub(crate) fn medium() -> Self {
        Self {
            deadband: 0.02,
            gain: 0.4,
            step_limit: 0.08,
            factor_min: 0.7,
            factor_max: 1.3,
            factor: 1.0,
        }
    }

    /// Performance: 100 ms cadence, factor held within a halving/doubling.
    /// Starts with a 6.4% oversend to cover warm-up shortfall.
    pub(crate) fn performance() -> Self {
        Self {
            deadband: 0.01,
            gain: 0.5,
            step_limit: 0.1,
            factor_min: 0.5,
            factor_max: 2.0,
            factor: 1.064,
        }
    }

    /// Feed one window's achieved EPS; returns the updated factor.
    pub(crate) fn observe(&mut self, target_eps: u64, actual_eps: f64) -> f64 {
        let target = target_eps.max(1) as f64;
        let error = (actual_eps - target) / target;

        if error.abs() > self.deadband {
            let step = (-error * self.gain).clamp(-self.step_limit, self.step_limit);
            self.factor = (self.factor * (1.0 + step)).clamp(self.factor_min, self.factor_max);
        }

        self.factor
    }

    pub(crate) fn factor(&self) -> f64 {
        self.factor
    }
}

/// Exponential moving average of achieved EPS, weighted 70/30 toward
/// history.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Ema {
    value: Option<f64>,
}

impl Ema {
    pub(crate) fn update(&mut self, instantaneous: f64) -> f64 {
        let next = match self.value {
            Some(prev) => 0.7 * prev + 0.3 * instantaneous,
            None => instantaneous,
        };
        self.value = Some(next);
        next
    }

    pub(crate) fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

/// Sleep out the remainder of a tick that began at `tick_start`. Coarse
/// sleeping only; the sub-millisecond tail is left to the scheduler.
pub(crate) fn sleep_remaining(tick_start: Instant, interval: Duration) {
    let elapsed = tick_start.elapsed();
    if let Some(remaining) = interval.checked_sub(elapsed) {
        std::thread::sleep(remaining);
    }
}

/// Wait until `deadline` with a hybrid strategy: sleep while more than a
/// millisecond remains, then yield to the scheduler, then spin the final
/// stretch. This keeps the absolute schedule of the Ultra loop accurate to
/// tens of microseconds without burning a core on long waits.
pub(crate) fn wait_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let remaining = deadline - now;

        if remaining > Duration::from_millis(1) {
            std::thread::sleep(remaining - Duration::from_micros(500));
        } else if remaining > Duration::from_micros(100) {
            std::thread::yield_now();
        }
        // The last <=100us are a pure spin on Instant::now.
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use proptest::prelude::*;

    use super::{
        apply_to_interval, wait_until, Ema, Pid, ScalarFeedback, MAX_BATCH_INTERVAL,
        MIN_BATCH_INTERVAL,
    };

    #[test]
    #[allow(clippy::float_cmp)] // literal-for-literal band comparisons
    fn gains_follow_the_band_table() {
        let pid = Pid::for_target(20_000);
        assert_eq!((pid.kp, pid.ki, pid.kd), (5e-5, 1e-5, 5e-6));

        let pid = Pid::for_target(50_000);
        assert_eq!((pid.kp, pid.ki, pid.kd), (3e-5, 8e-6, 3e-6));

        let pid = Pid::for_target(70_000);
        assert_eq!((pid.kp, pid.ki, pid.kd), (2e-5, 5e-6, 2e-6));

        let pid = Pid::for_target(100_000);
        assert_eq!((pid.kp, pid.ki, pid.kd), (1e-5, 3e-6, 1e-6));
    }

    #[test]
    fn integral_term_is_clamped() {
        let target = 10_000_u64;
        let mut pid = Pid::for_target(target);

        // A worker stuck at zero accumulates error fast; the accumulator
        // must stop at ten times the target.
        for _ in 0..1_000 {
            pid.update(target, 0.0);
        }
        assert!(pid.integral() <= target as f64 * 10.0);

        // And symmetrically when far over target.
        for _ in 0..2_000 {
            pid.update(target, 1_000_000.0);
        }
        assert!(pid.integral() >= target as f64 * -10.0);
    }

    #[test]
    fn behind_target_shrinks_the_interval() {
        let target = 10_000_u64;
        let mut pid = Pid::for_target(target);
        let interval = Duration::from_millis(10);

        let out = pid.update(target, 5_000.0);
        assert!(out > 0.0);
        assert!(apply_to_interval(interval, out) < interval);
    }

    #[test]
    fn ahead_of_target_stretches_the_interval() {
        let target = 10_000_u64;
        let mut pid = Pid::for_target(target);
        let interval = Duration::from_millis(10);

        let out = pid.update(target, 15_000.0);
        assert!(out < 0.0);
        assert!(apply_to_interval(interval, out) > interval);
    }

    #[test]
    fn pid_converges_on_a_simulated_plant() {
        // Plant model: achieved EPS is exactly batch/interval; the
        // controller observes the previous interval's rate and adjusts the
        // interval. Deterministic, no noise.
        let target = 10_000_u64;
        let batch = 100.0;
        let mut pid = Pid::for_target(target);
        let mut interval = Duration::from_millis(20); // start at half rate

        let mut history = Vec::with_capacity(2_000);
        for _ in 0..2_000 {
            let achieved = batch / interval.as_secs_f64();
            history.push(achieved);
            let out = pid.update(target, achieved);
            interval = apply_to_interval(interval, out);
        }

        let tail = &history[history.len() - 200..];
        let mean = tail.iter().sum::<f64>() / tail.len() as f64;
        let target = target as f64;
        assert!(
            (mean - target).abs() / target < 0.10,
            "tail mean {mean} vs target {target}"
        );

        // Late error must be well under the initial 50% deficit.
        let early = (history[0] - target).abs() / target;
        let late = (history[history.len() - 1] - target).abs() / target;
        assert!(late < early / 2.0, "early {early} late {late}");
    }

    proptest! {
        // Whatever the controller emits, the interval stays inside its
        // clamps.
        #[test]
        fn interval_always_within_clamps(
            out in -1e9_f64..1e9_f64,
            interval_us in 1_u64..10_000_000
        ) {
            let interval = Duration::from_micros(interval_us);
            let adjusted = apply_to_interval(interval, out);
            prop_assert!(adjusted >= MIN_BATCH_INTERVAL);
            prop_assert!(adjusted <= MAX_BATCH_INTERVAL);
        }

        // Scalar feedback never escapes its factor bounds.
        #[test]
        fn scalar_factor_always_within_bounds(observations in proptest::collection::vec(0_u64..10_000_000, 1..200)) {
            let target = 25_000_u64;
            let mut medium = ScalarFeedback::medium();
            let mut performance = ScalarFeedback::performance();

            for actual in observations {
                let m = medium.observe(target, actual as f64);
                prop_assert!((0.7..=1.3).contains(&m));
                let p = performance.observe(target, actual as f64);
                prop_assert!((0.5..=2.0).contains(&p));
            }
        }
    }

    #[test]
    fn scalar_feedback_has_a_deadband() {
        let target = 10_000_u64;
        let mut fb = ScalarFeedback::medium();
        let before = fb.factor();

        // 1% error is inside the 2% deadband; nothing moves.
        fb.observe(target, 10_100.0);
        assert!((fb.factor() - before).abs() < f64::EPSILON);

        // 10% error is not.
        fb.observe(target, 11_000.0);
        assert!(fb.factor() < before);
    }

    #[test]
    fn performance_feedback_starts_boosted() {
        let fb = ScalarFeedback::performance();
        assert!((fb.factor() - 1.064).abs() < f64::EPSILON);
    }

    #[test]
    fn ema_first_sample_passes_through() {
        let mut ema = Ema::default();
        assert!((ema.update(5_000.0) - 5_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ema_converges_on_constant_input() {
        let mut ema = Ema::default();
        ema.update(0.0);
        for _ in 0..100 {
            ema.update(10_000.0);
        }
        assert!((ema.value() - 10_000.0).abs() < 1.0);
    }

    #[test]
    fn wait_until_does_not_return_early() {
        let deadline = Instant::now() + Duration::from_millis(5);
        wait_until(deadline);
        assert!(Instant::now() >= deadline);
    }
}
