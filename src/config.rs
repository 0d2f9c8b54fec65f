use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::sandbox::profile::OsFamily;
use crate::sandbox::runtime::RuntimeKind;

/// Readiness polling defaults
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct ProbeConfig {
    /// Seconds between handshake attempts. Default: 5
    pub interval_secs: Option<u64>,
    /// Attempts before giving up. Default: 120 (ten minutes at the default interval)
    pub max_attempts: Option<u32>,
    /// Per-attempt handshake timeout. Default: 5
    pub attempt_timeout_secs: Option<u64>,
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.unwrap_or(5))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(120).max(1)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs.unwrap_or(5).max(1))
    }
}

/// Per-family adjustments to the built-in launch profile
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct ProfileOverride {
    /// Replace the container image reference
    pub image: Option<String>,
    pub cpus: Option<u32>,
    /// e.g. "16G"
    pub ram: Option<String>,
    /// Extra environment, merged over the profile's own
    pub env: Option<BTreeMap<String, String>>,
    /// Grace period before a stopping sandbox of this family is killed
    pub stop_timeout_secs: Option<u64>,
}

impl ProfileOverride {
    fn merge(self, project: Self) -> Self {
        let env = match (self.env, project.env) {
            (Some(mut global), Some(project)) => {
                global.extend(project);
                Some(global)
            }
            (global, project) => project.or(global),
        };
        Self {
            image: project.image.or(self.image),
            cpus: project.cpus.or(self.cpus),
            ram: project.ram.or(self.ram),
            env,
            stop_timeout_secs: project.stop_timeout_secs.or(self.stop_timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct ProfilesConfig {
    pub linux: Option<ProfileOverride>,
    pub windows: Option<ProfileOverride>,
    pub macos: Option<ProfileOverride>,
}

impl ProfilesConfig {
    pub fn for_family(&self, family: OsFamily) -> Option<&ProfileOverride> {
        match family {
            OsFamily::Linux => self.linux.as_ref(),
            OsFamily::Windows => self.windows.as_ref(),
            OsFamily::Macos => self.macos.as_ref(),
        }
    }

    fn merge(self, project: Self) -> Self {
        fn pick(
            global: Option<ProfileOverride>,
            project: Option<ProfileOverride>,
        ) -> Option<ProfileOverride> {
            match (global, project) {
                (Some(g), Some(p)) => Some(g.merge(p)),
                (g, p) => p.or(g),
            }
        }
        Self {
            linux: pick(self.linux, project.linux),
            windows: pick(self.windows, project.windows),
            macos: pick(self.macos, project.macos),
        }
    }
}

/// Where each family's control-plane proxy setting lives inside the guest
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct InjectorConfig {
    /// Linux: absolute guest path of the file holding the proxy assignment.
    /// Default: /home/user/server/main.py
    pub linux_config_path: Option<String>,
    /// Windows: guest path of the control-plane source.
    /// Default: C:\oem\server\main.py
    pub windows_source_path: Option<String>,
    /// Name of the variable assigned the proxy URL in those files. Default: PROXY_URL
    pub proxy_variable: Option<String>,
    /// macOS: network services to configure. Default: every service the guest lists
    pub macos_network_services: Option<Vec<String>>,
}

impl InjectorConfig {
    pub fn linux_config_path(&self) -> &str {
        self.linux_config_path
            .as_deref()
            .unwrap_or("/home/user/server/main.py")
    }

    pub fn windows_source_path(&self) -> &str {
        self.windows_source_path
            .as_deref()
            .unwrap_or(r"C:\oem\server\main.py")
    }

    pub fn proxy_variable(&self) -> &str {
        self.proxy_variable.as_deref().unwrap_or("PROXY_URL")
    }

    pub fn macos_network_services(&self) -> Option<&[String]> {
        self.macos_network_services
            .as_deref()
            .filter(|services| !services.is_empty())
    }

    fn merge(self, project: Self) -> Self {
        Self {
            linux_config_path: project.linux_config_path.or(self.linux_config_path),
            windows_source_path: project.windows_source_path.or(self.windows_source_path),
            proxy_variable: project.proxy_variable.or(self.proxy_variable),
            macos_network_services: project
                .macos_network_services
                .or(self.macos_network_services),
        }
    }
}

/// Configuration for deskvm, read from ~/.config/deskvm/config.yaml and .deskvm.yaml
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Container runtime binary. Default: docker
    #[serde(default)]
    pub runtime: Option<RuntimeKind>,

    #[serde(default)]
    pub probe: ProbeConfig,

    /// Grace period given to `stop` before the runtime kills the container. Default: 30
    #[serde(default)]
    pub stop_timeout_secs: Option<u64>,

    #[serde(default)]
    pub profiles: ProfilesConfig,

    #[serde(default)]
    pub injector: InjectorConfig,
}

impl Config {
    pub fn runtime(&self) -> RuntimeKind {
        self.runtime.unwrap_or_default()
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs.unwrap_or(30))
    }

    /// Load and merge global and project configurations.
    pub fn load() -> anyhow::Result<Self> {
        debug!("config:loading");
        let global = Self::load_global()?.unwrap_or_default();
        let project = Self::load_project()?.unwrap_or_default();
        let config = global.merge(project);
        debug!(runtime = ?config.runtime(), "config:loaded");
        Ok(config)
    }

    /// Load configuration from a specific path.
    fn load_from_path(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config at {}: {}", path.display(), e))?;
        Ok(Some(config))
    }

    fn load_global() -> anyhow::Result<Option<Self>> {
        if let Some(home_dir) = home::home_dir() {
            for name in ["config.yaml", "config.yml"] {
                let path = home_dir.join(".config/deskvm").join(name);
                if path.exists() {
                    return Self::load_from_path(&path);
                }
            }
        }
        Ok(None)
    }

    fn load_project() -> anyhow::Result<Option<Self>> {
        let start_dir = std::env::current_dir().unwrap_or_default();
        match find_project_config(&start_dir) {
            Some(path) => Self::load_from_path(&path),
            None => Ok(None),
        }
    }

    /// Merge a project config into a global config. Project wins per field.
    fn merge(self, project: Self) -> Self {
        Self {
            runtime: project.runtime.or(self.runtime),
            probe: ProbeConfig {
                interval_secs: project.probe.interval_secs.or(self.probe.interval_secs),
                max_attempts: project.probe.max_attempts.or(self.probe.max_attempts),
                attempt_timeout_secs: project
                    .probe
                    .attempt_timeout_secs
                    .or(self.probe.attempt_timeout_secs),
            },
            stop_timeout_secs: project.stop_timeout_secs.or(self.stop_timeout_secs),
            profiles: self.profiles.merge(project.profiles),
            injector: self.injector.merge(project.injector),
        }
    }
}

/// Find the nearest .deskvm.yaml by walking up from start_dir.
pub fn find_project_config(start_dir: &Path) -> Option<PathBuf> {
    let config_names = [".deskvm.yaml", ".deskvm.yml"];
    let mut dir = start_dir
        .canonicalize()
        .unwrap_or_else(|_| start_dir.to_path_buf());

    loop {
        for name in &config_names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "config:found project config");
                return Some(candidate);
            }
        }
        if !dir.pop() {
            return None;
        }
    }
}
