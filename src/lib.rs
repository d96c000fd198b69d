//! plugin-runner: sandboxed execution of untrusted plugin code against a
//! durable job queue.
//!
//! Plugins are instrumented by [`transform`] so every loop and function
//! body checks an execution budget, run in a bounded [`pool`] of isolated
//! child processes, and fed by an [`orchestrator`] that claims jobs from a
//! [`store`] only while it holds a distributed [`lock`].

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod orchestrator;
pub mod plugins;
pub mod pool;
pub mod shutdown;
pub mod store;
pub mod transform;

// Re-export commonly used types
pub use config::RunnerConfig;
pub use error::{
    ConfigError, JobFailure, LockError, OrchestratorError, PoolError, StoreError, TransformError,
};
pub use lock::{DistributedLock, LockToken};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorState, RunReport};
pub use plugins::PluginRegistry;
pub use pool::{PoolConfig, WorkerPool};
pub use store::{Job, JobStatus, JobStore, NewJob};
pub use transform::CodeTransformer;
