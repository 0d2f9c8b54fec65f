pub mod args;
pub mod fleet;
pub mod inject;
pub mod probe;
pub mod profile;
pub mod revert;
pub mod up;

use std::collections::BTreeMap;
use std::io::{self, IsTerminal, Write};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::sandbox::launcher::RunOverrides;
use crate::sandbox::probe::CancelToken;
use crate::sandbox::profile::{LaunchProfile, OsFamily, Resources};
use crate::sandbox::runtime::{RuntimeKind, images_match};
use args::LaunchArgs;

/// Loaded configuration with the `--runtime` flag applied on top.
pub fn load_config(runtime: Option<RuntimeKind>) -> Result<Config> {
    let mut config = Config::load()?;
    if runtime.is_some() {
        config.runtime = runtime;
    }
    Ok(config)
}

/// Built-in profile for `family`, then the config override, then `--image`.
pub fn resolve_profile(config: &Config, family: OsFamily, image: Option<&str>) -> LaunchProfile {
    let mut profile = LaunchProfile::builtin(family);
    if let Some(over) = config.profiles.for_family(family) {
        profile = profile.with_override(over);
    }
    if let Some(image) = image {
        profile.image_ref = image.to_string();
    }
    profile
}

/// Stop grace for containers of `image`: that of the family profile running
/// it, else the configured default.
pub fn stop_timeout_for_image(config: &Config, image: &str) -> Duration {
    [OsFamily::Linux, OsFamily::Windows, OsFamily::Macos]
        .into_iter()
        .map(|family| resolve_profile(config, family, None))
        .find(|profile| images_match(&profile.image_ref, image))
        .map(|profile| profile.stop_timeout(config.stop_timeout()))
        .unwrap_or_else(|| config.stop_timeout())
}

/// Translate launch flags into per-run overrides for `profile`.
///
/// A `--port` for a port the profile declares remaps it; any other port is
/// published in addition.
pub fn run_overrides(name: &str, profile: &LaunchProfile, args: &LaunchArgs) -> RunOverrides {
    let mut host_ports = BTreeMap::new();
    let mut extra_port_bindings = Vec::new();
    for &(container, host) in &args.ports {
        if profile.port_map.iter().any(|p| p.container == container) {
            host_ports.insert(container, host);
        } else {
            extra_port_bindings.push((host, container));
        }
    }

    let resources = (args.cpus.is_some() || args.ram.is_some()).then(|| Resources {
        cpu_cores: args.cpus.unwrap_or(profile.resources.cpu_cores),
        ram_size: args
            .ram
            .clone()
            .unwrap_or_else(|| profile.resources.ram_size.clone()),
    });

    RunOverrides {
        container_name: name.to_string(),
        host_storage_path: args.storage.clone(),
        proxy: None,
        host_ports,
        extra_port_bindings,
        credentials: args.credentials.credentials(),
        resources,
        extra_env: args.env.iter().cloned().collect(),
        golden_image: args.golden.clone(),
        base_image: args.base_image.clone(),
    }
}

/// Ask before a destructive action. `--yes` skips the prompt; without it a
/// non-interactive stdin is refused rather than read as "no".
pub fn confirm(question: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    if !io::stdin().is_terminal() {
        bail!("{} Refusing without --yes on a non-interactive stdin", question);
    }
    print!("{} [y/N] ", question);
    io::stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    io::stdin()
        .read_line(&mut input)
        .context("Failed to read user input")?;

    if input.trim().to_lowercase() != "y" {
        println!("Aborted.");
        return Ok(false);
    }
    Ok(true)
}

/// Ctrl-C cancels the returned token instead of killing the process, so
/// in-flight work can clean up.
pub fn install_cancel_handler() -> CancelToken {
    let token = CancelToken::new();
    let handler_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        debug!(error = %e, "command:ctrl-c handler not installed");
    }
    token
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
