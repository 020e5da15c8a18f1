//! Benchmark task scheduler.
//!
//! A pool of workers polls a filesystem queue of task descriptors, claims each
//! task exactly once, copies the testbed into a private sandbox, grounds the
//! candidate into it, runs the build phase the task asks for, and publishes
//! the score back to the candidate folder before archiving the task.

pub mod controller;
pub mod error;
pub mod grounding;
pub mod perf;
pub mod pool;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod sandbox;
pub mod verify;
pub mod worker;

pub use controller::{Controller, ShutdownKind, ShutdownReport};
pub use error::SchedulerError;
pub use grounding::{CommandGrounding, CopyGrounding, GroundingStage};
pub use perf::PerformanceLog;
pub use pool::{PoolState, WorkerPool, WorkerPoolBuilder};
pub use publisher::{PublishReport, ResultPublisher};
pub use queue::{Claim, ClaimedTask, TaskQueue};
pub use registry::DedupRegistry;
pub use runner::{BenchmarkRunner, ClassifierRunner, FeatureExtractionRunner, RunReport, RunnerRegistry};
pub use sandbox::SandboxManager;
pub use verify::VerificationCheck;
pub use worker::{OutcomeStatus, TaskContext, TaskOutcome, WorkerSummary};
