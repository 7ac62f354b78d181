//! kiln-core
//!
//! Core building blocks for the Kiln job execution engine:
//! - domain: job and result records, execution modes, backend outcomes
//! - scheduler: priority ordering with aging to prevent starvation
//! - pipeline: staged record pipelines and the type registry
//! - exec: thread / process / async backends behind a router
//! - store: durable job and result persistence
//! - engine: submission intake, main loop, retries, shutdown orchestration

pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exec;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod store;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::KilnError;
