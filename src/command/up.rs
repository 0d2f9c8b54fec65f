use anyhow::{Result, bail};
use console::style;
use tracing::info;

use super::args::LaunchArgs;
use super::{install_cancel_handler, load_config, print_json, resolve_profile, run_overrides};
use crate::error::LifecycleError;
use crate::sandbox::launcher::{Launcher, SandboxHandle};
use crate::sandbox::probe::{Prober, ReadinessResult};
use crate::sandbox::profile::OsFamily;
use crate::sandbox::proxy::ProxyUrl;
use crate::sandbox::runtime::RuntimeKind;
use crate::sandbox::runtime_from_config;
use crate::spinner;

pub struct UpOptions {
    pub family: OsFamily,
    pub name: String,
    pub proxy: Option<ProxyUrl>,
    pub launch: LaunchArgs,
    pub no_wait: bool,
    pub json: bool,
}

pub fn run(runtime_flag: Option<RuntimeKind>, opts: UpOptions) -> Result<()> {
    let config = load_config(runtime_flag)?;
    let runtime = runtime_from_config(&config);
    let profile = resolve_profile(&config, opts.family, opts.launch.image.as_deref());

    let mut overrides = run_overrides(&opts.name, &profile, &opts.launch);
    overrides.proxy = opts.proxy.clone();

    let launcher = Launcher::new(&runtime, config.stop_timeout());
    let handle = spinner::with_spinner(&format!("Launching {}", opts.name), || {
        Ok(launcher.launch(&profile, &overrides)?)
    })?;
    if handle.degraded {
        eprintln!(
            "{} /dev/kvm is not available; {} runs without hardware virtualization",
            style("warning:").yellow().bold(),
            handle.container_name
        );
    }

    if profile.mutates_golden_in_place() && !opts.json {
        eprintln!(
            "{} {} is mounted read-write; revert it from a backup before reusing it",
            style("note:").dim(),
            opts.launch.storage.display()
        );
    }

    if opts.no_wait {
        return report(&handle, opts.json);
    }

    let cancel = install_cancel_handler();
    let policy = opts.launch.probe.policy(&config);
    let prober = Prober::new(policy).with_runtime(&runtime);
    let result = spinner::with_spinner_status(
        &format!("Waiting for {} control plane", handle.container_name),
        || prober.await_ready(handle.clone(), &cancel),
        |r| matches!(r, ReadinessResult::Ready(_)),
    );

    match result {
        ReadinessResult::Ready(handle) => {
            info!(container = %handle.container_name, "up:ready");
            report(&handle, opts.json)
        }
        ReadinessResult::TimedOut { attempts } => {
            teardown_hint(&handle.container_name);
            Err(LifecycleError::ReadinessTimeout {
                container: handle.container_name,
                attempts,
            }
            .into())
        }
        ReadinessResult::Failed(reason) => {
            teardown_hint(&handle.container_name);
            Err(LifecycleError::Launch {
                container: handle.container_name,
                cause: reason,
            }
            .into())
        }
        ReadinessResult::Cancelled { attempts } => {
            teardown_hint(&handle.container_name);
            bail!(
                "Wait for '{}' cancelled after {} attempts",
                handle.container_name,
                attempts
            )
        }
    }
}

fn teardown_hint(name: &str) {
    eprintln!(
        "Sandbox '{}' was left in place. Remove it with: {}",
        name,
        style(format!("deskvm rm {}", name)).cyan()
    );
}

fn report(handle: &SandboxHandle, json: bool) -> Result<()> {
    if json {
        return print_json(handle);
    }
    let endpoint = &handle.control_endpoint;
    let target = match &endpoint.liveness_path {
        Some(path) => format!("{}{}", endpoint.base_url(), path),
        None => format!("{}:{}", endpoint.host, endpoint.port),
    };
    println!(
        "{} {} ({})",
        style("✓").green(),
        style(&handle.container_name).bold(),
        handle.os_family
    );
    println!("  id:      {}", handle.container_id);
    println!("  control: {} {}", endpoint.protocol, target);
    println!("  created: {}", handle.created_at.to_rfc3339());
    Ok(())
}
