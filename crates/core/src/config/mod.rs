//! Scheduler configuration.
//!
//! Parsed once at startup from `benchd.toml`, overridden from the environment,
//! validated, then shared read-only with every component.

mod loading;
mod types;
mod validation;


pub use loading::load_dotenv;
pub use types::{
    BenchConfig, ClaimMode, GroundingConfig, PerfConfig, PoolConfig, PublishConfig, QueueConfig,
    RunnerConfig, SandboxConfig, ScanErrorPolicy, VerificationConfig,
};
