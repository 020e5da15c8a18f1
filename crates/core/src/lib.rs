pub mod config;
pub mod error;
pub mod task;

pub use config::{BenchConfig, ClaimMode, ScanErrorPolicy};
pub use error::*;
pub use task::{BuildPhase, TaskDescriptor};
