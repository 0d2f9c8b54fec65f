//! Declarative per-OS container requirements.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ProfileOverride;

/// Guest operating system family. Drives both launch and proxy injection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Linux,
    Windows,
    Macos,
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OsFamily::Linux => "linux",
            OsFamily::Windows => "windows",
            OsFamily::Macos => "macos",
        })
    }
}

/// A host device passed through to the container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DeviceSpec {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    /// Missing optional devices degrade the sandbox instead of failing the launch.
    pub optional: bool,
}

impl DeviceSpec {
    pub fn kvm() -> Self {
        Self {
            host_path: PathBuf::from("/dev/kvm"),
            container_path: PathBuf::from("/dev/kvm"),
            optional: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl PortMapping {
    /// Same port on both sides; the usual default before per-run overrides.
    pub fn identity(port: u16) -> Self {
        Self {
            host: port,
            container: port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    Ro,
    Rw,
}

impl MountMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MountMode::Ro => "ro",
            MountMode::Rw => "rw",
        }
    }
}

/// Where the host side of a mount comes from. Run-specific sources are
/// resolved against [`super::launcher::RunOverrides`] at launch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountSource {
    /// The per-run storage directory.
    Storage,
    /// The golden disk image of the family.
    GoldenImage,
    /// The macOS installer/base-system image.
    BaseImage,
    /// A fixed host path.
    Host(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeMount {
    pub source: MountSource,
    pub container_path: String,
    pub mode: MountMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resources {
    pub cpu_cores: u32,
    /// Size string understood by the guest image, e.g. `8G`.
    pub ram_size: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ControlProtocol {
    Ssh,
    Http,
}

impl fmt::Display for ControlProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControlProtocol::Ssh => "ssh",
            ControlProtocol::Http => "http",
        })
    }
}

/// The in-guest control plane the prober and harness talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlChannel {
    pub container_port: u16,
    pub protocol: ControlProtocol,
    /// Path answering with 2xx once the HTTP control plane is up.
    pub liveness_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchProfile {
    pub image_ref: String,
    pub os_family: OsFamily,
    pub device_passthrough: BTreeSet<DeviceSpec>,
    pub port_map: Vec<PortMapping>,
    pub volume_mounts: Vec<VolumeMount>,
    pub resources: Resources,
    pub env_vars: BTreeMap<String, String>,
    pub control: ControlChannel,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub shm_size: Option<String>,
    pub extra_hosts: Vec<String>,
    pub tty: bool,
    /// Env var receiving `Y`/`N` depending on whether KVM was passed through.
    pub kvm_env: Option<String>,
    /// Env vars receiving the guest credentials (user, password).
    pub credential_env: Option<(String, String)>,
    /// Replaces the image's entrypoint.
    pub entrypoint: Option<String>,
    /// Arguments after the image reference.
    pub command: Vec<String>,
    pub platform: Option<String>,
    /// Seconds a stopping guest gets to shut down before it is killed.
    pub stop_grace_secs: Option<u64>,
}

impl LaunchProfile {
    pub fn builtin(family: OsFamily) -> Self {
        match family {
            OsFamily::Linux => Self::linux(),
            OsFamily::Windows => Self::windows(),
            OsFamily::Macos => Self::macos(),
        }
    }

    fn linux() -> Self {
        Self {
            image_ref: "happysixd/osworld-docker:latest".to_string(),
            os_family: OsFamily::Linux,
            device_passthrough: BTreeSet::from([DeviceSpec::kvm()]),
            port_map: [5000, 9222, 8006, 8080]
                .into_iter()
                .map(PortMapping::identity)
                .collect(),
            volume_mounts: vec![
                VolumeMount {
                    source: MountSource::GoldenImage,
                    container_path: "/System.qcow2".to_string(),
                    mode: MountMode::Ro,
                },
                VolumeMount {
                    source: MountSource::Storage,
                    container_path: "/storage".to_string(),
                    mode: MountMode::Rw,
                },
            ],
            resources: Resources {
                cpu_cores: 4,
                ram_size: "4G".to_string(),
            },
            env_vars: BTreeMap::from([("DISK_SIZE".to_string(), "32G".to_string())]),
            control: ControlChannel {
                container_port: 5000,
                protocol: ControlProtocol::Http,
                liveness_path: Some("/screenshot".to_string()),
            },
            privileged: false,
            cap_add: vec!["NET_ADMIN".to_string()],
            shm_size: None,
            extra_hosts: Vec::new(),
            tty: false,
            kvm_env: None,
            credential_env: None,
            entrypoint: None,
            command: Vec::new(),
            platform: None,
            stop_grace_secs: None,
        }
    }

    fn windows() -> Self {
        Self {
            image_ref: "winarena-v2:latest".to_string(),
            os_family: OsFamily::Windows,
            device_passthrough: BTreeSet::from([DeviceSpec::kvm()]),
            port_map: [5000, 3389, 9222, 8006]
                .into_iter()
                .map(PortMapping::identity)
                .collect(),
            // The storage directory *is* the golden image here; it is mutated in place.
            volume_mounts: vec![VolumeMount {
                source: MountSource::Storage,
                container_path: "/storage".to_string(),
                mode: MountMode::Rw,
            }],
            resources: Resources {
                cpu_cores: 8,
                ram_size: "8G".to_string(),
            },
            env_vars: BTreeMap::new(),
            control: ControlChannel {
                container_port: 5000,
                protocol: ControlProtocol::Http,
                liveness_path: Some("/probe".to_string()),
            },
            privileged: true,
            cap_add: vec!["NET_ADMIN".to_string()],
            shm_size: Some("500m".to_string()),
            extra_hosts: vec!["host.docker.internal:host-gateway".to_string()],
            tty: false,
            kvm_env: Some("KVM".to_string()),
            credential_env: None,
            // entry_setup.sh boots the VM in the background; tail keeps PID 1 alive.
            entrypoint: Some("/bin/bash".to_string()),
            command: vec![
                "-c".to_string(),
                "./entry_setup.sh & tail -f /dev/null".to_string(),
            ],
            platform: Some("linux/amd64".to_string()),
            // Windows flushes the in-place disk on shutdown.
            stop_grace_secs: Some(300),
        }
    }

    fn macos() -> Self {
        Self {
            image_ref: "numbmelon/docker-osx-evalkit-auto:latest".to_string(),
            os_family: OsFamily::Macos,
            device_passthrough: BTreeSet::from([DeviceSpec::kvm()]),
            port_map: [10022, 5901]
                .into_iter()
                .map(PortMapping::identity)
                .collect(),
            volume_mounts: vec![
                VolumeMount {
                    source: MountSource::Host(PathBuf::from("/tmp/.X11-unix")),
                    container_path: "/tmp/.X11-unix".to_string(),
                    mode: MountMode::Rw,
                },
                // The image copies the source disk before booting, so the golden stays pristine.
                VolumeMount {
                    source: MountSource::GoldenImage,
                    container_path: "/home/arch/OSX-KVM/mac_hdd_ng_src.img".to_string(),
                    mode: MountMode::Ro,
                },
                VolumeMount {
                    source: MountSource::BaseImage,
                    container_path: "/home/arch/OSX-KVM/BaseSystem_src.img".to_string(),
                    mode: MountMode::Ro,
                },
            ],
            resources: Resources {
                cpu_cores: 4,
                ram_size: "8G".to_string(),
            },
            env_vars: BTreeMap::from([
                (
                    "EXTRA".to_string(),
                    "-vnc 0.0.0.0:1,password=off".to_string(),
                ),
                ("CPU".to_string(), "Haswell-noTSX".to_string()),
                (
                    "CPUID_FLAGS".to_string(),
                    "kvm=on,vendor=GenuineIntel,+invtsc,vmware-cpuid-freq=on".to_string(),
                ),
                ("SHORTNAME".to_string(), "sonoma".to_string()),
            ]),
            control: ControlChannel {
                container_port: 10022,
                protocol: ControlProtocol::Ssh,
                liveness_path: None,
            },
            privileged: true,
            cap_add: Vec::new(),
            shm_size: None,
            extra_hosts: Vec::new(),
            tty: true,
            kvm_env: None,
            credential_env: Some(("USERNAME".to_string(), "PASSWORD".to_string())),
            entrypoint: None,
            command: Vec::new(),
            platform: None,
            stop_grace_secs: None,
        }
    }

    /// Container path of the disk the guest actually boots from, for families
    /// whose image writes go to an internal copy.
    pub fn internal_disk_path(&self) -> Option<&'static str> {
        match self.os_family {
            OsFamily::Macos => Some("/home/arch/OSX-KVM/mac_hdd_ng.img"),
            OsFamily::Linux | OsFamily::Windows => None,
        }
    }

    /// Whether the golden image is mutated by simply running the sandbox.
    pub fn mutates_golden_in_place(&self) -> bool {
        self.os_family == OsFamily::Windows
    }

    /// How long to let the guest shut down, falling back to `default`.
    pub fn stop_timeout(&self, default: Duration) -> Duration {
        self.stop_grace_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Return a copy of this profile with config-file overrides applied.
    pub fn with_override(&self, over: &ProfileOverride) -> Self {
        let mut profile = self.clone();
        if let Some(image) = &over.image {
            profile.image_ref = image.clone();
        }
        if let Some(cpus) = over.cpus {
            profile.resources.cpu_cores = cpus;
        }
        if let Some(ram) = &over.ram {
            profile.resources.ram_size = ram.clone();
        }
        if let Some(env) = &over.env {
            profile
                .env_vars
                .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(secs) = over.stop_timeout_secs {
            profile.stop_grace_secs = Some(secs);
        }
        profile
    }
}
