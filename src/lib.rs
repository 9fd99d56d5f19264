//! Deterministic Timers
//!
//! A deterministic replacement for one-shot and repeating delayed callbacks:
//! - Labeled logical clock domains, each with its own advancing logical time
//! - Reproducible ordering: due time, then domain origin, then priority and arrival
//! - Every callback multiplexed onto a single physical timer, with catch-up
//!   when the host falls behind
//! - Offline (virtual clock stepping) and realtime (spin_sleep) drivers

pub mod callback;
pub mod domain;
pub mod error;
pub mod host;
pub mod queue;
pub mod pq;
pub mod scheduler;
pub mod engine;


pub use callback::{CallbackError, CallbackId, CallbackKind, CallbackOptions, CallbackResult};
pub use domain::DomainLabel;
pub use engine::{EngineConfig, OfflineRunner, RealtimeRunner};
pub use error::SchedulerError;
pub use host::{ArmedTimer, TimerHandle, TimerHost, VirtualClock, WallClock};
pub use pq::HeapQueue;
pub use queue::{ExecutionQueue, SortedQueue};
pub use scheduler::{DrainReport, DriverState, Scheduler, SchedulerConfig};
