use std::path::PathBuf;

use anyhow::{Result, bail};
use console::style;
use tracing::info;

use super::args::LaunchArgs;
use super::{
    confirm, install_cancel_handler, load_config, print_json, resolve_profile, run_overrides,
};
use crate::config::Config;
use crate::sandbox::inject::{
    BackupPolicy, InjectOutcome, LinuxInjector, MacosInjector, ProxyInjector, SandboxSession,
    WindowsInjector,
};
use crate::sandbox::profile::OsFamily;
use crate::sandbox::proxy::ProxyUrl;
use crate::sandbox::runtime::{ContainerRuntime, RuntimeKind};
use crate::sandbox::runtime_from_config;
use crate::spinner;

pub struct LinuxOptions {
    pub proxy: ProxyUrl,
    pub disk: PathBuf,
    pub guest_path: Option<String>,
    pub variable: Option<String>,
    pub json: bool,
}

pub struct WindowsOptions {
    pub proxy: ProxyUrl,
    pub name: String,
    pub launch: LaunchArgs,
    pub backup: Option<PathBuf>,
    pub existing_backup: Option<PathBuf>,
    pub source_path: Option<String>,
    pub variable: Option<String>,
    pub yes: bool,
    pub json: bool,
}

pub struct MacosOptions {
    pub proxy: ProxyUrl,
    pub name: String,
    pub launch: LaunchArgs,
    pub output: PathBuf,
    pub services: Vec<String>,
    pub json: bool,
}

fn session<'a>(
    runtime: &'a dyn ContainerRuntime,
    config: &Config,
    launch: &LaunchArgs,
) -> SandboxSession<'a> {
    SandboxSession {
        runtime,
        probe: launch.probe.policy(config),
        cancel: install_cancel_handler(),
        stop_timeout: config.stop_timeout(),
    }
}

fn execute(injector: &dyn ProxyInjector, proxy: &ProxyUrl, json: bool) -> Result<InjectOutcome> {
    let family = injector.family();
    let outcome = spinner::with_spinner(&format!("Injecting {} into {} guest", proxy, family), || {
        Ok(injector.inject(proxy)?)
    })?;
    info!(family = %family, artifact = %outcome.artifact.display(), "inject:done");
    if json {
        print_json(&outcome)?;
    } else if outcome.in_place {
        println!(
            "{} {} now routes through {}",
            style("✓").green(),
            outcome.artifact.display(),
            proxy
        );
    } else {
        println!(
            "{} wrote {}",
            style("✓").green(),
            style(outcome.artifact.display()).bold()
        );
    }
    Ok(outcome)
}

pub fn linux(runtime_flag: Option<RuntimeKind>, opts: LinuxOptions) -> Result<()> {
    let config = load_config(runtime_flag)?;
    let injector = LinuxInjector {
        disk: opts.disk,
        guest_path: opts
            .guest_path
            .unwrap_or_else(|| config.injector.linux_config_path().to_string()),
        variable: opts
            .variable
            .unwrap_or_else(|| config.injector.proxy_variable().to_string()),
    };
    execute(&injector, &opts.proxy, opts.json)?;
    Ok(())
}

fn backup_policy(backup: Option<PathBuf>, existing: Option<PathBuf>) -> Result<BackupPolicy> {
    match (backup, existing) {
        (Some(path), None) => Ok(BackupPolicy::Create(path)),
        (None, Some(path)) => Ok(BackupPolicy::Existing(path)),
        _ => bail!("Pass exactly one of --backup or --existing-backup"),
    }
}

pub fn windows(runtime_flag: Option<RuntimeKind>, opts: WindowsOptions) -> Result<()> {
    let config = load_config(runtime_flag)?;
    let backup = backup_policy(opts.backup, opts.existing_backup)?;
    let confirmed = confirm(
        &format!(
            "Proxy settings will be written permanently into {}. Continue?",
            opts.launch.storage.display()
        ),
        opts.yes,
    )?;
    if !confirmed {
        return Ok(());
    }

    let runtime = runtime_from_config(&config);
    let profile = resolve_profile(&config, OsFamily::Windows, opts.launch.image.as_deref());
    let overrides = run_overrides(&opts.name, &profile, &opts.launch);
    let injector = WindowsInjector {
        session: session(&runtime, &config, &opts.launch),
        profile,
        overrides,
        backup,
        confirmed,
        source_path: opts
            .source_path
            .unwrap_or_else(|| config.injector.windows_source_path().to_string()),
        variable: opts
            .variable
            .unwrap_or_else(|| config.injector.proxy_variable().to_string()),
    };
    execute(&injector, &opts.proxy, opts.json)?;
    Ok(())
}

pub fn macos(runtime_flag: Option<RuntimeKind>, opts: MacosOptions) -> Result<()> {
    let config = load_config(runtime_flag)?;
    let runtime = runtime_from_config(&config);
    let profile = resolve_profile(&config, OsFamily::Macos, opts.launch.image.as_deref());
    let overrides = run_overrides(&opts.name, &profile, &opts.launch);
    let services = if opts.services.is_empty() {
        config.injector.macos_network_services().map(<[String]>::to_vec)
    } else {
        Some(opts.services)
    };
    let injector = MacosInjector {
        session: session(&runtime, &config, &opts.launch),
        profile,
        overrides,
        output: opts.output,
        services,
    };
    let outcome = execute(&injector, &opts.proxy, opts.json)?;
    if !opts.json {
        println!(
            "Point subsequent runs at it with --golden {}",
            outcome.artifact.display()
        );
    }
    Ok(())
}
