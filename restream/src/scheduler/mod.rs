//! Stream-session scheduling.
//!
//! The [`Scheduler`] enforces the host-wide concurrency cap, admits or queues
//! start requests, tears sessions down when their process exits and promotes
//! queued streams into freed slots.

mod queue;
mod reconciler;
mod registry;
mod service;

pub use queue::{AdmissionQueue, QueueError};
pub use reconciler::StatusReconciler;
pub use registry::{RegistryError, Session, SessionRegistry};
pub use service::{
    QueueStatus, Scheduler, SchedulerConfig, SchedulerError, SchedulerEvent, ShutdownReport,
    StartOutcome, StopOutcome,
};
