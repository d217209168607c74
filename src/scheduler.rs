//! Scheduler gate: decides whether an invocation does any work.
//!
//! In fixed-window mode every invocation runs. In jitter mode each invocation
//! draws a target gap from `[min_gap, max_gap]` and runs only when the time
//! since the last committed run has reached it, so work happens no more often
//! than `min_gap` and no less often than `max_gap` regardless of how often the
//! external trigger fires.

use crate::config::{ScheduleConfig, ScheduleMode};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

/// Source of target gaps for jitter mode.
pub trait GapSampler: Send {
    /// Draw a gap in whole minutes, uniformly from `[min, max]`.
    fn sample_minutes(&mut self, min: u32, max: u32) -> u32;
}

/// Production sampler backed by a seedable [`StdRng`].
pub struct RngSampler {
    rng: StdRng,
}

impl RngSampler {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Seeded when the config pins a seed, OS entropy otherwise.
    pub fn for_config(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(seed),
            None => Self::from_entropy(),
        }
    }
}

impl GapSampler for RngSampler {
    fn sample_minutes(&mut self, min: u32, max: u32) -> u32 {
        if min >= max {
            return min;
        }
        self.rng.random_range(min..=max)
    }
}

/// Outcome of the gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Run,
    Skip {
        elapsed_minutes: i64,
        target_gap_minutes: u32,
    },
}

/// Gate over the configured schedule mode.
pub struct SchedulerGate {
    config: ScheduleConfig,
    sampler: Box<dyn GapSampler>,
}

impl SchedulerGate {
    pub fn new(config: ScheduleConfig, sampler: Box<dyn GapSampler>) -> Self {
        Self { config, sampler }
    }

    pub fn mode(&self) -> ScheduleMode {
        self.config.mode
    }

    /// Decide whether to run, given the last committed run time.
    pub fn check(&mut self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> GateDecision {
        if self.config.mode == ScheduleMode::FixedWindow {
            return GateDecision::Run;
        }

        let Some(last_run) = last_run else {
            info!("No previous run recorded; running now");
            return GateDecision::Run;
        };

        let elapsed = now - last_run;
        let target_gap = self
            .sampler
            .sample_minutes(self.config.min_gap_minutes, self.config.max_gap_minutes);

        debug!(
            "Jitter gate: elapsed {}m, target gap {}m",
            elapsed.num_minutes(),
            target_gap
        );

        if elapsed < Duration::minutes(i64::from(target_gap)) {
            GateDecision::Skip {
                elapsed_minutes: elapsed.num_minutes(),
                target_gap_minutes: target_gap,
            }
        } else {
            GateDecision::Run
        }
    }

    /// Earliest item timestamp this run should fetch.
    ///
    /// The earlier of the last committed run and the start of the recency
    /// window, so nothing that arrived between runs is missed when runs are
    /// spaced out by the jitter gate or by skipped triggers.
    pub fn fetch_boundary(
        &self,
        last_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        recency_window_minutes: u32,
    ) -> DateTime<Utc> {
        let window_start = now - Duration::minutes(i64::from(recency_window_minutes));
        match last_run {
            Some(last_run) if last_run < window_start => last_run,
            _ => window_start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn jitter(min: u32, max: u32) -> ScheduleConfig {
        ScheduleConfig {
            mode: ScheduleMode::Jitter,
            min_gap_minutes: min,
            max_gap_minutes: max,
            seed: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 8, 8, 0, 0).unwrap()
    }

    struct FixedSampler(u32);

    impl GapSampler for FixedSampler {
        fn sample_minutes(&mut self, _min: u32, _max: u32) -> u32 {
            self.0
        }
    }

    #[test]
    fn test_fixed_window_always_runs() {
        let config = ScheduleConfig {
            mode: ScheduleMode::FixedWindow,
            ..jitter(30, 120)
        };
        let mut gate = SchedulerGate::new(config, Box::new(FixedSampler(1000)));
        assert_eq!(gate.check(Some(t0()), t0()), GateDecision::Run);
    }

    #[test]
    fn test_first_run_always_runs() {
        let mut gate = SchedulerGate::new(jitter(30, 120), Box::new(FixedSampler(120)));
        assert_eq!(gate.check(None, t0()), GateDecision::Run);
    }

    #[test]
    fn test_skip_before_target_gap() {
        let mut gate = SchedulerGate::new(jitter(30, 120), Box::new(FixedSampler(45)));
        let now = t0() + Duration::minutes(40);
        assert_eq!(
            gate.check(Some(t0()), now),
            GateDecision::Skip {
                elapsed_minutes: 40,
                target_gap_minutes: 45
            }
        );
        assert_eq!(
            gate.check(Some(t0()), t0() + Duration::minutes(45)),
            GateDecision::Run
        );
    }

    #[test]
    fn test_seeded_sampler_is_deterministic_and_in_range() {
        let mut a = RngSampler::seeded(7);
        let mut b = RngSampler::seeded(7);
        for _ in 0..100 {
            let x = a.sample_minutes(30, 120);
            assert_eq!(x, b.sample_minutes(30, 120));
            assert!((30..=120).contains(&x));
        }
        assert_eq!(a.sample_minutes(15, 15), 15);
    }

    #[test]
    fn test_jitter_bounds_over_three_hours() {
        for seed in 0..50 {
            let mut gate = SchedulerGate::new(jitter(30, 120), Box::new(RngSampler::seeded(seed)));
            let mut last_run: Option<DateTime<Utc>> = None;
            let mut runs = Vec::new();

            for tick in 0..=18 {
                let now = t0() + Duration::minutes(tick * 10);
                if gate.check(last_run, now) == GateDecision::Run {
                    if let Some(previous) = last_run {
                        let gap = (now - previous).num_minutes();
                        assert!(gap >= 30, "seed {seed}: ran after only {gap}m");
                        assert!(gap <= 120, "seed {seed}: waited {gap}m");
                    }
                    last_run = Some(now);
                    runs.push(now);
                }
            }
            assert!(runs.len() >= 2, "seed {seed}: only {} run(s)", runs.len());
        }
    }

    #[test]
    fn test_fetch_boundary() {
        let gate = SchedulerGate::new(jitter(30, 120), Box::new(FixedSampler(30)));
        let now = t0() + Duration::minutes(90);

        assert_eq!(gate.fetch_boundary(Some(t0()), now, 15), t0());
        assert_eq!(gate.fetch_boundary(None, now, 15), now - Duration::minutes(15));

        let fixed = SchedulerGate::new(
            ScheduleConfig {
                mode: ScheduleMode::FixedWindow,
                ..jitter(30, 120)
            },
            Box::new(FixedSampler(30)),
        );
        assert_eq!(fixed.fetch_boundary(Some(t0()), now, 15), t0());
        assert_eq!(
            fixed.fetch_boundary(Some(now - Duration::minutes(5)), now, 15),
            now - Duration::minutes(15)
        );
    }
}
