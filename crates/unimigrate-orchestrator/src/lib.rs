//! # unimigrate-orchestrator
//!
//! Orchestrator half of the migration platform: owns the persistent
//! operation registry, the scheduler that dispatches due operations, the
//! supervisor that guarantees the migration worker process is alive, and
//! the execute/retry/cancel lifecycle.

pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod operation;
pub mod scheduler;
pub mod store;
pub mod supervisor;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use executor::Executor;
pub use operation::{Operation, OperationConfig, OperationStatus};
pub use scheduler::Scheduler;
pub use store::{MemoryOperationStore, OperationStore, PgOperationStore};
pub use supervisor::WorkerSupervisor;
