//! Admission control in front of the worker pool.

pub mod breaker;
pub mod clock;

pub use breaker::{
    Admission, CircuitBreaker, CircuitBreakerStats, CircuitState, QueueSlot, TripReason,
};
pub use clock::{Clock, ManualClock, SystemClock};
