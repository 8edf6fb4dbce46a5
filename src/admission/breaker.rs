//! Circuit breaker guarding the worker pool.
//!
//! ```text
//! CLOSED --[queue depth or failure rate]--> OPEN
//!    ^                                        |
//!    |                                  [open duration]
//!    |                                        v
//!    +------[half_open_max_calls ok]---- HALF_OPEN --[any failure]--> OPEN
//! ```
//!
//! All counters live behind one `parking_lot::Mutex`; critical sections do no I/O.

use super::clock::{Clock, SystemClock};
use crate::config::AdmissionConfig;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests flow through
    Closed,
    /// Tripped - requests rejected without touching the pool
    Open,
    /// Probing recovery - a bounded number of requests allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

/// Why the breaker tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripReason {
    QueueDepth(usize),
    FailureRate { failures: usize, calls: usize },
    ProbeFailed,
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripReason::QueueDepth(depth) => write!(f, "queue depth {}", depth),
            TripReason::FailureRate { failures, calls } => {
                write!(f, "failure rate {}/{}", failures, calls)
            }
            TripReason::ProbeFailed => f.write_str("half-open probe failed"),
        }
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub queue_depth: usize,
    pub window_calls: usize,
    pub window_failures: usize,
    pub failure_rate: f64,
    pub trips: u64,
}

struct BreakerState {
    current: CircuitState,
    /// Outcomes recorded while CLOSED, oldest first
    window: VecDeque<(Outcome, Instant)>,
    /// Requests currently inside the guarded region
    queue_depth: usize,
    opened_at: Option<Instant>,
    /// Probes admitted in HALF_OPEN that have not reported yet
    probes_in_flight: usize,
    probe_successes: usize,
    trips: u64,
    /// Bumped on every state transition; outcomes from an older epoch are stale
    epoch: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            current: CircuitState::Closed,
            window: VecDeque::new(),
            queue_depth: 0,
            opened_at: None,
            probes_in_flight: 0,
            probe_successes: 0,
            trips: 0,
            epoch: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((_, at)) = self.window.front() {
            if now.saturating_duration_since(*at) >= window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn failures(&self) -> usize {
        self.window
            .iter()
            .filter(|(o, _)| *o == Outcome::Failure)
            .count()
    }

    fn reset_counters(&mut self) {
        self.window.clear();
        self.probes_in_flight = 0;
        self.probe_successes = 0;
    }
}

/// Admission controller in front of the worker pool.
pub struct CircuitBreaker {
    config: AdmissionConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: AdmissionConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AdmissionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Decide whether one request may enter the guarded region.
    ///
    /// Callers that get `true` must report the outcome with
    /// [`record_success`](Self::record_success) or [`record_failure`](Self::record_failure).
    /// Prefer [`admit`](Self::admit), which reports on drop.
    pub fn guard(&self) -> bool {
        self.try_admit().is_some()
    }

    /// Admission decision; returns the epoch the request was admitted in.
    fn try_admit(&self) -> Option<u64> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.prune(now, self.config.window_size());

        let admitted = match state.current {
            CircuitState::Closed => match self.trip_reason(&state) {
                Some(reason) => {
                    self.trip(&mut state, now, reason);
                    false
                }
                None => true,
            },
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                if elapsed >= self.config.open_duration() {
                    state.current = CircuitState::HalfOpen;
                    state.epoch += 1;
                    state.probes_in_flight = 1;
                    state.probe_successes = 0;
                    info!("circuit breaker half-open after {:?}, probing", elapsed);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.probes_in_flight < self.config.half_open_max_calls {
                    state.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        };
        admitted.then_some(state.epoch)
    }

    pub fn record_success(&self) {
        self.record(Outcome::Success, None);
    }

    pub fn record_failure(&self) {
        self.record(Outcome::Failure, None);
    }

    /// Admit one request, or `None` when the breaker refuses it.
    ///
    /// The returned [`Admission`] must be settled with
    /// [`Admission::success`] or [`Admission::failure`]. Dropping it unsettled,
    /// e.g. when the caller's future is cancelled, counts as a failure, so a
    /// half-open slot is never leaked.
    pub fn admit(&self) -> Option<Admission<'_>> {
        self.try_admit().map(|epoch| Admission {
            breaker: self,
            epoch,
            settled: false,
        })
    }

    fn record(&self, outcome: Outcome, epoch: Option<u64>) {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if let Some(epoch) = epoch {
            if epoch != state.epoch {
                debug!(
                    "ignoring {:?} admitted before the breaker went {}",
                    outcome, state.current
                );
                return;
            }
        }

        match (state.current, outcome) {
            (CircuitState::Closed, _) => state.window.push_back((outcome, now)),
            (CircuitState::HalfOpen, Outcome::Success) => {
                state.probes_in_flight = state.probes_in_flight.saturating_sub(1);
                state.probe_successes += 1;
                if state.probe_successes >= self.config.half_open_max_calls {
                    state.current = CircuitState::Closed;
                    state.epoch += 1;
                    state.opened_at = None;
                    state.reset_counters();
                    info!(
                        "circuit breaker closed after {} successful probes",
                        self.config.half_open_max_calls
                    );
                }
            }
            (CircuitState::HalfOpen, Outcome::Failure) => {
                self.trip(&mut state, now, TripReason::ProbeFailed)
            }
            // Late result from a call admitted before the trip.
            (CircuitState::Open, _) => {}
        }
    }

    /// Enter the guarded region; depth drops again when the slot is dropped.
    pub fn enter(&self) -> QueueSlot<'_> {
        self.state.lock().queue_depth += 1;
        QueueSlot { breaker: self }
    }

    pub fn queue_depth(&self) -> usize {
        self.state.lock().queue_depth
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().current
    }

    /// Suggested delay before a rejected caller retries.
    pub fn retry_after(&self) -> Duration {
        let now = self.clock.now();
        let state = self.state.lock();
        match (state.current, state.opened_at) {
            (CircuitState::Open, Some(at)) => {
                let remaining = self
                    .config
                    .open_duration()
                    .saturating_sub(now.saturating_duration_since(at));
                if remaining.is_zero() {
                    Duration::from_millis(1)
                } else {
                    remaining
                }
            }
            _ => self.config.open_duration(),
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.prune(now, self.config.window_size());

        let window_calls = state.window.len();
        let window_failures = state.failures();
        CircuitBreakerStats {
            state: state.current,
            queue_depth: state.queue_depth,
            window_calls,
            window_failures,
            failure_rate: if window_calls == 0 {
                0.0
            } else {
                window_failures as f64 / window_calls as f64
            },
            trips: state.trips,
        }
    }

    fn trip_reason(&self, state: &BreakerState) -> Option<TripReason> {
        if state.queue_depth >= self.config.queue_depth_threshold {
            return Some(TripReason::QueueDepth(state.queue_depth));
        }

        let calls = state.window.len();
        if calls >= self.config.min_calls_for_rate && calls > 0 {
            let failures = state.failures();
            if failures as f64 / calls as f64 >= self.config.failure_rate_threshold {
                return Some(TripReason::FailureRate { failures, calls });
            }
        }
        None
    }

    fn trip(&self, state: &mut BreakerState, now: Instant, reason: TripReason) {
        let from = state.current;
        state.current = CircuitState::Open;
        state.epoch += 1;
        state.opened_at = Some(now);
        state.reset_counters();
        state.trips += 1;
        warn!(
            "circuit breaker tripped {} -> open ({}), rejecting for {:?}",
            from,
            reason,
            self.config.open_duration()
        );
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}

/// RAII marker for one request inside the guarded region.
#[must_use = "queue depth drops as soon as the slot is dropped"]
pub struct QueueSlot<'a> {
    breaker: &'a CircuitBreaker,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.breaker.state.lock();
        state.queue_depth = state.queue_depth.saturating_sub(1);
    }
}

/// One admitted request that has not reported its outcome yet.
#[must_use = "an unsettled admission counts as a failure when dropped"]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    settled: bool,
}

impl Admission<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record(Outcome::Success, Some(self.epoch));
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record(Outcome::Failure, Some(self.epoch));
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!("admitted call abandoned before completion");
            self.breaker.record(Outcome::Failure, Some(self.epoch));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::ManualClock;

    fn config() -> AdmissionConfig {
        AdmissionConfig {
            queue_depth_threshold: 4,
            failure_rate_threshold: 0.5,
            min_calls_for_rate: 4,
            open_duration_secs: 10,
            half_open_max_calls: 2,
            window_size_secs: 60,
        }
    }

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (CircuitBreaker::with_clock(config(), clock.clone()), clock)
    }

    #[test]
    fn test_starts_closed_and_allows() {
        let (cb, _) = breaker();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.guard());
    }

    #[test]
    fn test_rate_ignored_below_min_calls() {
        let (cb, _) = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(cb.guard());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_stale_outcomes_leave_the_window() {
        let (cb, clock) = breaker();
        for _ in 0..4 {
            cb.record_failure();
        }
        clock.advance(Duration::from_secs(61));
        assert!(cb.guard());
        assert_eq!(cb.stats().window_calls, 0);
    }

    #[test]
    fn test_open_rejects_until_duration_elapses() {
        let (cb, clock) = breaker();
        for _ in 0..4 {
            cb.record_failure();
        }
        assert!(!cb.guard());
        clock.advance(Duration::from_secs(9));
        assert!(!cb.guard());
        assert_eq!(cb.retry_after(), Duration::from_secs(1));
        clock.advance(Duration::from_secs(1));
        assert!(cb.guard());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_caps_concurrent_calls() {
        let (cb, clock) = breaker();
        for _ in 0..4 {
            cb.record_failure();
        }
        assert!(!cb.guard());
        clock.advance(Duration::from_secs(10));
        assert!(cb.guard());
        assert!(cb.guard());
        assert!(!cb.guard(), "third concurrent call exceeds half_open_max_calls");
    }

    #[test]
    fn test_queue_slot_releases_depth() {
        let (cb, _) = breaker();
        {
            let _a = cb.enter();
            let _b = cb.enter();
            assert_eq!(cb.queue_depth(), 2);
        }
        assert_eq!(cb.queue_depth(), 0);
    }

    #[test]
    fn test_unsettled_admission_counts_as_failure() {
        let (cb, clock) = breaker();
        for _ in 0..4 {
            cb.record_failure();
        }
        assert!(cb.admit().is_none());
        clock.advance(Duration::from_secs(10));

        let first = cb.admit().expect("half-open admits");
        let second = cb.admit().expect("second half-open slot");
        assert!(cb.admit().is_none());
        second.success();
        drop(first);

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().trips, 2);
    }

    #[test]
    fn test_admission_from_previous_epoch_is_ignored() {
        let (cb, clock) = breaker();
        let stale = cb.admit().expect("closed admits");
        for _ in 0..4 {
            cb.record_failure();
        }
        assert!(cb.admit().is_none());
        clock.advance(Duration::from_secs(10));

        let live = cb.admit().expect("half-open admits");
        stale.failure();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        live.success();
        cb.admit().expect("second slot").success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trip_counter() {
        let (cb, _) = breaker();
        let slots: Vec<_> = (0..4).map(|_| cb.enter()).collect();
        assert!(!cb.guard());
        drop(slots);
        assert_eq!(cb.stats().trips, 1);
    }
}
