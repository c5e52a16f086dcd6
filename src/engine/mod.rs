//! Core engine: one self-rescheduling guard → fetch → evaluate → reconcile
//! loop per instrument.

pub mod backoff;
pub mod scheduler;

pub use scheduler::{AfterError, AfterSkip, CycleOutcome, InstrumentScheduler, SchedulerConfig, SchedulerState};
