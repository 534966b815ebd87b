//! Shared types, error model, and configuration for pipehub.
//!
//! This crate is the foundation depended on by all other pipehub crates.
//! It provides:
//! - [`PipehubError`] — the unified error type
//! - Domain types ([`TaskInvocation`], [`TaskResult`], [`ServiceTarget`],
//!   [`ReadinessVerdict`], [`Pipeline`], [`InvocationId`])
//! - Configuration ([`AppConfig`], config loading, built-in pipelines)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, PipelineEntry, ResolvedConfig, ServiceEntry, TaskEntry,
    config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{PipehubError, Result};
pub use types::{
    InvocationId, Pipeline, ReadinessVerdict, ServiceStatus, ServiceTarget, TaskInvocation,
    TaskParams, TaskResult, TaskStatus,
};
