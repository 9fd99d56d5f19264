//! Scheduler errors
//!
//! Invalid input is rejected at registration. Consistency violations are fatal:
//! the scheduler halts and every later call reports `Halted`.

use crate::domain::DomainLabel;

/// Errors surfaced by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// A repeating callback was registered with a zero (or negative) interval.
    #[error("repeating callback requires a positive interval")]
    ZeroInterval,

    /// A queue entry has no matching registry record.
    #[error("queue entry {label}/{id} has no registry record ({context})")]
    Inconsistent {
        label: DomainLabel,
        id: u64,
        context: &'static str,
    },

    /// The defensive order check found two adjacent entries out of order.
    #[error("execution queue is not sorted at position {position}")]
    Unsorted { position: usize },

    /// Queue and registry disagree on the number of pending callbacks.
    #[error("execution queue holds {queued} entries but the registry holds {registered}")]
    Diverged { queued: usize, registered: usize },

    /// The scheduler stopped after a consistency violation.
    #[error("scheduler halted after an internal consistency violation")]
    Halted,
}

impl SchedulerError {
    /// Whether this error indicates a logic bug rather than bad input.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Inconsistent { .. }
                | SchedulerError::Unsorted { .. }
                | SchedulerError::Diverged { .. }
        )
    }
}
