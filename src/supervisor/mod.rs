//! # Supervisor
//!
//! One worker per channel, kept alive by a periodic monitor cycle.

mod error;
pub mod launcher;
mod worker_supervisor;

pub use error::SupervisorError;
pub use launcher::{
    InProcessHandle, InProcessLauncher, ProcessHandle, ProcessLauncher, WorkerHandle,
    WorkerLauncher,
};
pub use worker_supervisor::{ShutdownReport, WorkerStatus, WorkerSupervisor};
