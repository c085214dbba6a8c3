//! Admission control for agent launches.
//!
//! Pure, clock-driven controller: the orchestrator asks it before every
//! launch and informs it of every rate-limit signal. It owns the adaptive
//! `effective` parallelism, the post-signal launch hold, the sliding-window
//! launch budget, and the cooldown-gated recovery.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::config::RateLimitParams;

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    /// All `effective` slots are busy.
    AtCapacity,
    /// Inside the post-signal hold window.
    LaunchHold { until: DateTime<Utc> },
    /// Launch budget exhausted. `fresh` is set exactly once per hold
    /// window, for the single `launch:budget-hold` event.
    BudgetHold { fresh: bool },
}

#[derive(Debug)]
pub struct AdmissionController {
    params: RateLimitParams,
    max: usize,
    effective: usize,
    floor: usize,
    signal_count: u64,
    total_backoff_ms: u64,
    signals_in_window: VecDeque<DateTime<Utc>>,
    launches_in_window: VecDeque<DateTime<Utc>>,
    hold_until: Option<DateTime<Utc>>,
    budget_hold_active: bool,
    budget_hold_count: u64,
    last_hold_at: Option<DateTime<Utc>>,
    last_signal_at: Option<DateTime<Utc>>,
    last_recovery_at: Option<DateTime<Utc>>,
}

impl AdmissionController {
    pub fn new(params: RateLimitParams, max_parallel: usize) -> Self {
        let max = max_parallel.max(1);
        let floor = params.parallel_floor.clamp(1, max);
        Self {
            effective: max,
            max,
            floor,
            params,
            signal_count: 0,
            total_backoff_ms: 0,
            signals_in_window: VecDeque::new(),
            launches_in_window: VecDeque::new(),
            hold_until: None,
            budget_hold_active: false,
            budget_hold_count: 0,
            last_hold_at: None,
            last_signal_at: None,
            last_recovery_at: None,
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn effective(&self) -> usize {
        self.effective
    }

    pub fn signal_count(&self) -> u64 {
        self.signal_count
    }

    pub fn total_backoff_ms(&self) -> u64 {
        self.total_backoff_ms
    }

    pub fn budget_hold_count(&self) -> u64 {
        self.budget_hold_count
    }

    pub fn last_hold_at(&self) -> Option<DateTime<Utc>> {
        self.last_hold_at
    }

    /// Launches inside the current sliding window.
    pub fn budget_used(&mut self, now: DateTime<Utc>) -> u32 {
        self.prune_launches(now);
        self.launches_in_window.len() as u32
    }

    /// May one more agent launch right now, given `running` active agents?
    pub fn admit(&mut self, now: DateTime<Utc>, running: usize) -> Admission {
        if running >= self.effective {
            return Admission::AtCapacity;
        }
        if let Some(until) = self.hold_until
            && now < until
        {
            return Admission::LaunchHold { until };
        }

        self.prune_launches(now);
        if self.launches_in_window.len() as u32 >= self.params.launch_budget_per_minute {
            let fresh = !self.budget_hold_active;
            if fresh {
                self.budget_hold_active = true;
                self.budget_hold_count += 1;
                self.last_hold_at = Some(now);
            }
            return Admission::BudgetHold { fresh };
        }
        self.budget_hold_active = false;
        Admission::Allow
    }

    /// Record an admitted launch against the budget window.
    pub fn record_launch(&mut self, now: DateTime<Utc>) {
        self.launches_in_window.push_back(now);
    }

    /// Record a 429-style signal. Returns true when `effective` dropped.
    pub fn record_signal(&mut self, now: DateTime<Utc>, backoff_ms: u64) -> bool {
        self.signal_count += 1;
        self.total_backoff_ms += backoff_ms;
        self.last_signal_at = Some(now);
        self.hold_until = Some(now + Duration::milliseconds(self.params.signal_extra_hold_ms as i64));

        self.signals_in_window.push_back(now);
        self.prune_signals(now);

        if !self.params.adaptive_parallel {
            return false;
        }

        let before = self.effective;
        self.effective = self.effective.saturating_sub(1).max(self.floor);
        if self.signals_in_window.len() as u32 > self.params.signal_threshold {
            // A burst pushes further down, toward the dynamic floor.
            let dynamic_floor = self.params.dynamic_budget_floor.clamp(self.floor, self.max);
            self.effective = self.effective.min(dynamic_floor);
        }
        self.effective < before
    }

    /// Single-step recovery after a signal-free cool interval. Returns true
    /// when `effective` grew.
    pub fn maybe_recover(&mut self, now: DateTime<Utc>) -> bool {
        if self.effective >= self.max {
            return false;
        }
        let cooldown = Duration::milliseconds(self.params.cooldown_ms as i64);
        let quiet_since = match (self.last_signal_at, self.last_recovery_at) {
            (Some(signal), Some(recovery)) => signal.max(recovery),
            (Some(signal), None) => signal,
            (None, Some(recovery)) => recovery,
            (None, None) => return false,
        };
        if now - quiet_since < cooldown {
            return false;
        }
        self.effective = (self.effective + 1).min(self.max);
        self.last_recovery_at = Some(now);
        true
    }

    /// Exponential backoff with jitter for the given attempt (1-based).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let pow = attempt.saturating_sub(1).min(16);
        let raw = self
            .params
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(pow));
        let capped = raw.min(self.params.backoff_max_ms);
        // ±25% jitter, never below half the base.
        let jitter = (capped / 4).max(1);
        let offset = rand::random::<u64>() % (2 * jitter);
        (capped + offset).saturating_sub(jitter)
    }

    pub fn max_retries(&self) -> u32 {
        self.params.max_retries
    }
}

fn prune(window: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window_ms: u64) {
    let cutoff = now - Duration::milliseconds(window_ms as i64);
    while let Some(front) = window.front() {
        if *front <= cutoff {
            window.pop_front();
        } else {
            break;
        }
    }
}

impl AdmissionController {
    fn prune_launches(&mut self, now: DateTime<Utc>) {
        let window_ms = self.params.launch_budget_window_ms;
        prune(&mut self.launches_in_window, now, window_ms);
        if self.budget_hold_active
            && (self.launches_in_window.len() as u32) < self.params.launch_budget_per_minute
        {
            self.budget_hold_active = false;
        }
    }

    fn prune_signals(&mut self, now: DateTime<Utc>) {
        let window_ms = self.params.signal_window_ms;
        prune(&mut self.signals_in_window, now, window_ms);
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::RateLimitProfile;

    fn params() -> RateLimitParams {
        RateLimitParams {
            max_retries: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            adaptive_parallel: true,
            parallel_floor: 1,
            cooldown_ms: 30_000,
            launch_budget_per_minute: 4,
            launch_budget_window_ms: 60_000,
            signal_window_ms: 60_000,
            signal_threshold: 2,
            signal_extra_hold_ms: 10_000,
            dynamic_budget_floor: 1,
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn admits_up_to_effective() {
        let mut ctl = AdmissionController::new(params(), 3);
        let now = start();
        assert_eq!(ctl.admit(now, 0), Admission::Allow);
        assert_eq!(ctl.admit(now, 2), Admission::Allow);
        assert_eq!(ctl.admit(now, 3), Admission::AtCapacity);
    }

    #[test]
    fn signal_drops_effective_but_not_below_floor() {
        let mut ctl = AdmissionController::new(params(), 3);
        let mut now = start();

        assert!(ctl.record_signal(now, 100));
        assert_eq!(ctl.effective(), 2);
        now += Duration::milliseconds(20_000);
        assert!(ctl.record_signal(now, 100));
        assert_eq!(ctl.effective(), 1);
        now += Duration::milliseconds(20_000);
        assert!(!ctl.record_signal(now, 100));
        assert_eq!(ctl.effective(), 1);
        assert_eq!(ctl.signal_count(), 3);
        assert_eq!(ctl.total_backoff_ms(), 300);
    }

    #[test]
    fn signal_opens_a_launch_hold_window() {
        let mut ctl = AdmissionController::new(params(), 3);
        let now = start();

        ctl.record_signal(now, 100);
        match ctl.admit(now + Duration::milliseconds(5_000), 0) {
            Admission::LaunchHold { .. } => {}
            other => panic!("expected launch hold, got {other:?}"),
        }
        assert_eq!(
            ctl.admit(now + Duration::milliseconds(10_001), 0),
            Admission::Allow
        );
    }

    #[test]
    fn budget_exhaustion_holds_with_one_fresh_flag_per_window() {
        let mut ctl = AdmissionController::new(params(), 8);
        let now = start();

        for i in 0..4 {
            assert_eq!(ctl.admit(now, i), Admission::Allow);
            ctl.record_launch(now);
        }
        assert_eq!(ctl.admit(now, 4), Admission::BudgetHold { fresh: true });
        assert_eq!(ctl.admit(now, 4), Admission::BudgetHold { fresh: false });
        assert_eq!(
            ctl.admit(now + Duration::milliseconds(30_000), 4),
            Admission::BudgetHold { fresh: false }
        );
        assert_eq!(ctl.budget_hold_count(), 1);

        // The window slides; budget regenerates and a later exhaustion is a
        // new hold.
        let later = now + Duration::milliseconds(61_000);
        assert_eq!(ctl.admit(later, 4), Admission::Allow);
        for _ in 0..4 {
            ctl.record_launch(later);
        }
        assert_eq!(ctl.admit(later, 4), Admission::BudgetHold { fresh: true });
        assert_eq!(ctl.budget_hold_count(), 2);
    }

    #[test]
    fn launches_within_any_window_respect_the_budget() {
        let mut ctl = AdmissionController::new(params(), 8);
        let mut now = start();
        let mut granted = 0u32;

        // Try to launch every 5 seconds for 2 minutes.
        for _ in 0..24 {
            if ctl.admit(now, 0) == Admission::Allow {
                ctl.record_launch(now);
                granted += 1;
            }
            now += Duration::milliseconds(5_000);
        }
        // 4 per sliding minute over 2 minutes.
        assert!(granted <= 9, "granted {granted} launches");
    }

    #[test]
    fn burst_of_signals_drops_toward_dynamic_floor() {
        let mut p = params();
        p.dynamic_budget_floor = 2;
        p.parallel_floor = 1;
        let mut ctl = AdmissionController::new(p, 6);
        let now = start();

        ctl.record_signal(now, 100);
        ctl.record_signal(now + Duration::milliseconds(100), 100);
        assert_eq!(ctl.effective(), 4);
        // Third signal inside the window exceeds threshold=2.
        ctl.record_signal(now + Duration::milliseconds(200), 100);
        assert_eq!(ctl.effective(), 2);
    }

    #[test]
    fn recovery_needs_a_quiet_cooldown_and_steps_once() {
        let mut ctl = AdmissionController::new(params(), 3);
        let now = start();

        ctl.record_signal(now, 100);
        ctl.record_signal(now + Duration::milliseconds(40_000), 100);
        assert_eq!(ctl.effective(), 1);

        // Too soon after the last signal.
        assert!(!ctl.maybe_recover(now + Duration::milliseconds(50_000)));

        let quiet = now + Duration::milliseconds(40_000 + 30_000);
        assert!(ctl.maybe_recover(quiet));
        assert_eq!(ctl.effective(), 2);

        // The next step needs its own cool interval.
        assert!(!ctl.maybe_recover(quiet + Duration::milliseconds(1_000)));
        assert!(ctl.maybe_recover(quiet + Duration::milliseconds(30_000)));
        assert_eq!(ctl.effective(), 3);

        // Never above max.
        assert!(!ctl.maybe_recover(quiet + Duration::milliseconds(120_000)));
        assert_eq!(ctl.effective(), 3);
    }

    #[test]
    fn non_adaptive_profile_keeps_effective_fixed() {
        let mut p = params();
        p.adaptive_parallel = false;
        let mut ctl = AdmissionController::new(p, 4);
        let now = start();

        assert!(!ctl.record_signal(now, 100));
        assert_eq!(ctl.effective(), 4);
        // The hold window still applies.
        assert!(matches!(
            ctl.admit(now + Duration::milliseconds(1), 0),
            Admission::LaunchHold { .. }
        ));
    }

    #[test]
    fn backoff_grows_and_respects_the_cap() {
        let ctl = AdmissionController::new(params(), 2);
        let first = ctl.backoff_ms(1);
        let fifth = ctl.backoff_ms(5);
        assert!(first >= 50 && first <= 150, "first={first}");
        // Capped at 1000 with ±25% jitter.
        assert!(fifth <= 1_250, "fifth={fifth}");
        assert!(fifth >= 750, "fifth={fifth}");
    }

    #[test]
    fn preset_profiles_build_working_controllers() {
        for profile in [
            RateLimitProfile::Conservative,
            RateLimitProfile::Balanced,
            RateLimitProfile::Aggressive,
        ] {
            let mut ctl = AdmissionController::new(profile.params(), 4);
            assert_eq!(ctl.effective(), 4);
            assert_eq!(ctl.admit(start(), 0), Admission::Allow);
        }
    }
}
