//! Turns a [`LaunchProfile`] plus per-run overrides into a running container.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::LifecycleError;
use crate::sandbox::fleet;
use crate::sandbox::profile::{
    ControlProtocol, LaunchProfile, MountMode, MountSource, OsFamily, Resources,
};
use crate::sandbox::proxy::ProxyUrl;
use crate::sandbox::runtime::{ContainerRuntime, ResolvedMount, RunSpec};

const PROXY_VARS: [&str; 4] = ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];
const NO_PROXY: &str = "localhost,127.0.0.1";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-invocation settings. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    /// Unique among active runs.
    pub container_name: String,
    pub host_storage_path: PathBuf,
    pub proxy: Option<ProxyUrl>,
    /// Container port to host port for the profile's declared ports.
    /// Unlisted ports are published on the same host port.
    pub host_ports: BTreeMap<u16, u16>,
    /// Additional (host, container) bindings beyond the profile's.
    pub extra_port_bindings: Vec<(u16, u16)>,
    pub credentials: Option<Credentials>,
    pub resources: Option<Resources>,
    pub extra_env: BTreeMap<String, String>,
    pub golden_image: Option<PathBuf>,
    pub base_image: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: ControlProtocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_path: Option<String>,
}

impl ControlEndpoint {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// A launched sandbox. Invalid once its container is removed.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxHandle {
    pub container_id: String,
    pub container_name: String,
    pub os_family: OsFamily,
    pub control_endpoint: ControlEndpoint,
    pub created_at: DateTime<Utc>,
    /// Launched without hardware virtualization.
    pub degraded: bool,
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

pub struct Launcher<'a> {
    runtime: &'a dyn ContainerRuntime,
    stop_timeout: Duration,
}

impl<'a> Launcher<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, stop_timeout: Duration) -> Self {
        Self {
            runtime,
            stop_timeout,
        }
    }

    pub fn launch(
        &self,
        profile: &LaunchProfile,
        overrides: &RunOverrides,
    ) -> Result<SandboxHandle, LifecycleError> {
        let name = overrides.container_name.as_str();
        validate_container_name(name)?;

        ensure_storage_dir(&overrides.host_storage_path)?;
        let mounts = resolve_mounts(profile, overrides)?;
        let (devices, degraded) = resolve_devices(profile, name);

        if let Some(credential_env) = &profile.credential_env
            && overrides.credentials.is_none()
        {
            return Err(LifecycleError::precondition(
                name,
                format!(
                    "{} sandboxes need credentials for {}/{}",
                    profile.os_family, credential_env.0, credential_env.1
                ),
            ));
        }

        let ports = resolve_ports(profile, overrides);
        let control_host_port = ports
            .iter()
            .find(|(_, container)| *container == profile.control.container_port)
            .map(|(host, _)| *host)
            .ok_or_else(|| {
                LifecycleError::precondition(
                    name,
                    format!(
                        "control port {} is not published",
                        profile.control.container_port
                    ),
                )
            })?;

        self.remove_existing(name, profile.stop_timeout(self.stop_timeout))?;

        let spec = RunSpec {
            name: name.to_string(),
            image: profile.image_ref.clone(),
            privileged: profile.privileged,
            tty: profile.tty,
            devices,
            cap_add: profile.cap_add.clone(),
            shm_size: profile.shm_size.clone(),
            ports,
            mounts,
            env: build_env(profile, overrides, degraded),
            extra_hosts: profile.extra_hosts.clone(),
            entrypoint: profile.entrypoint.clone(),
            command: profile.command.clone(),
            platform: profile.platform.clone(),
        };

        info!(
            container = name,
            runtime = self.runtime.name(),
            family = %profile.os_family,
            image = %profile.image_ref,
            proxy = overrides.proxy.is_some(),
            degraded,
            "launcher:starting"
        );
        let container_id = self
            .runtime
            .run(&spec)
            .map_err(|e| LifecycleError::from_runtime(name, e))?;
        info!(container = name, id = %container_id, "launcher:started");

        Ok(SandboxHandle {
            container_id,
            container_name: name.to_string(),
            os_family: profile.os_family,
            control_endpoint: ControlEndpoint {
                host: "127.0.0.1".to_string(),
                port: control_host_port,
                protocol: profile.control.protocol,
                liveness_path: profile.control.liveness_path.clone(),
            },
            created_at: Utc::now(),
            degraded,
            credentials: overrides.credentials.clone(),
        })
    }

    /// Stop and remove whatever currently carries `name`.
    fn remove_existing(&self, name: &str, stop_timeout: Duration) -> Result<(), LifecycleError> {
        let existing = self
            .runtime
            .find_by_name(name)
            .map_err(|e| LifecycleError::from_runtime(name, e))?;
        if let Some(existing) = existing {
            warn!(container = name, id = %existing.id, state = %existing.state, "launcher:replacing existing container");
            fleet::reap_one(self.runtime, &existing, stop_timeout)
                .map_err(|e| LifecycleError::from_runtime(name, e))?;
        }
        Ok(())
    }
}

fn validate_container_name(name: &str) -> Result<(), LifecycleError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(LifecycleError::precondition(
            format!("container name '{}'", name),
            "must match [a-zA-Z0-9][a-zA-Z0-9_.-]*",
        ))
    }
}

fn ensure_storage_dir(path: &Path) -> Result<(), LifecycleError> {
    if path.as_os_str().is_empty() {
        return Err(LifecycleError::precondition(
            "host storage path",
            "must not be empty",
        ));
    }
    fs::create_dir_all(path)
        .map_err(|e| LifecycleError::precondition(path.display(), e.to_string()))
}

fn require_file(path: Option<&Path>, what: &str) -> Result<PathBuf, LifecycleError> {
    let path = path.ok_or_else(|| LifecycleError::precondition(what, "no path given"))?;
    if !path.exists() {
        return Err(LifecycleError::precondition(
            path.display(),
            format!("{} does not exist", what),
        ));
    }
    Ok(path.to_path_buf())
}

fn resolve_mounts(
    profile: &LaunchProfile,
    overrides: &RunOverrides,
) -> Result<Vec<ResolvedMount>, LifecycleError> {
    profile
        .volume_mounts
        .iter()
        .map(|mount| {
            let host_path = match &mount.source {
                MountSource::Storage => overrides.host_storage_path.clone(),
                MountSource::GoldenImage => {
                    require_file(overrides.golden_image.as_deref(), "golden image")?
                }
                MountSource::BaseImage => {
                    require_file(overrides.base_image.as_deref(), "base system image")?
                }
                MountSource::Host(path) => path.clone(),
            };
            Ok(ResolvedMount {
                host_path,
                container_path: mount.container_path.clone(),
                mode: mount.mode,
            })
        })
        .collect()
}

/// Present devices, plus whether a missing optional one degraded the run.
fn resolve_devices(profile: &LaunchProfile, name: &str) -> (Vec<(PathBuf, PathBuf)>, bool) {
    let mut devices = Vec::new();
    let mut degraded = false;
    for device in &profile.device_passthrough {
        if device.host_path.exists() {
            devices.push((device.host_path.clone(), device.container_path.clone()));
        } else if device.optional {
            warn!(
                container = name,
                device = %device.host_path.display(),
                "launcher:device missing, continuing without hardware acceleration"
            );
            degraded = true;
        } else {
            // Non-optional devices are left for the runtime to reject.
            devices.push((device.host_path.clone(), device.container_path.clone()));
        }
    }
    (devices, degraded)
}

fn resolve_ports(profile: &LaunchProfile, overrides: &RunOverrides) -> Vec<(u16, u16)> {
    let mut ports: Vec<(u16, u16)> = profile
        .port_map
        .iter()
        .map(|p| {
            let host = overrides
                .host_ports
                .get(&p.container)
                .copied()
                .unwrap_or(p.host);
            (host, p.container)
        })
        .collect();
    for binding in &overrides.extra_port_bindings {
        if !ports.contains(binding) {
            ports.push(*binding);
        }
    }
    ports
}

fn build_env(
    profile: &LaunchProfile,
    overrides: &RunOverrides,
    degraded: bool,
) -> BTreeMap<String, String> {
    let mut env = profile.env_vars.clone();

    let resources = overrides.resources.as_ref().unwrap_or(&profile.resources);
    env.insert("CPU_CORES".to_string(), resources.cpu_cores.to_string());
    env.insert("RAM_SIZE".to_string(), resources.ram_size.clone());

    if let Some(kvm) = &profile.kvm_env {
        env.insert(kvm.clone(), if degraded { "N" } else { "Y" }.to_string());
    }

    if let (Some((user_var, password_var)), Some(creds)) =
        (&profile.credential_env, &overrides.credentials)
    {
        env.insert(user_var.clone(), creds.user.clone());
        env.insert(password_var.clone(), creds.password.clone());
    }

    env.extend(
        overrides
            .extra_env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    // Proxy variables only ever come from the proxy URL.
    for var in PROXY_VARS.iter().chain(["NO_PROXY", "no_proxy"].iter()) {
        env.remove(*var);
    }
    if let Some(proxy) = &overrides.proxy {
        for var in PROXY_VARS {
            env.insert(var.to_string(), proxy.to_string());
        }
        env.insert("NO_PROXY".to_string(), NO_PROXY.to_string());
    }

    env
}
