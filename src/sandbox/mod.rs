//! Sandbox lifecycle: launch, probe, select, reap, inject, revert.

pub mod fleet;
pub mod inject;
pub mod launcher;
pub mod probe;
pub mod profile;
pub mod proxy;
pub mod runtime;
pub mod snapshot;
pub mod ssh;

use crate::config::Config;
use runtime::CliRuntime;

/// Runtime adapter for the configured binary.
pub fn runtime_from_config(config: &Config) -> CliRuntime {
    CliRuntime::new(config.runtime())
}
