//! Container runtime boundary (docker or podman CLI).
//!
//! Everything in the lifecycle manager reaches the runtime through
//! [`ContainerRuntime`]; [`CliRuntime`] drives the real binary.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cmd::Cmd;
use crate::sandbox::profile::MountMode;

/// Container runtime binary
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    Podman,
}

impl RuntimeKind {
    pub fn binary(self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Podman => "podman",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// Binary missing or daemon not answering.
    #[error("{runtime} is unreachable: {cause}")]
    Unreachable { runtime: String, cause: String },
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("{runtime} rejected the request: {cause}")]
    Rejected { runtime: String, cause: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" | "configured" | "initialized" => ContainerState::Created,
            "running" | "up" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" | "stopped" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    /// A stop request against this state halts a live process.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ContainerState::Running | ContainerState::Paused | ContainerState::Restarting
        )
    }

    /// The guest can never come up from this state without a relaunch.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ContainerState::Exited | ContainerState::Dead | ContainerState::Removing
        )
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// One row of `ps -a`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    pub name: String,
    pub state: ContainerState,
}

/// Outcome of a stop/remove that tolerates concurrent actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Done,
    AlreadyAbsent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub mode: MountMode,
}

/// Fully-resolved create-and-start request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub privileged: bool,
    pub tty: bool,
    pub devices: Vec<(PathBuf, PathBuf)>,
    pub cap_add: Vec<String>,
    pub shm_size: Option<String>,
    /// (host, container)
    pub ports: Vec<(u16, u16)>,
    pub mounts: Vec<ResolvedMount>,
    pub env: BTreeMap<String, String>,
    pub extra_hosts: Vec<String>,
    pub entrypoint: Option<String>,
    /// Arguments after the image.
    pub command: Vec<String>,
    pub platform: Option<String>,
}

pub trait ContainerRuntime: Send + Sync {
    /// Binary name, used in messages.
    fn name(&self) -> &str;

    /// Fails with [`RuntimeError::Unreachable`] if the daemon cannot be reached.
    fn ping(&self) -> Result<(), RuntimeError>;

    /// Container (any state) whose name is exactly `name`.
    fn find_by_name(&self, name: &str) -> Result<Option<ContainerSummary>, RuntimeError>;

    /// Containers (any state) created from `image`, in runtime listing order.
    fn list_by_ancestor(&self, image: &str) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Create and start a detached container, returning its ID.
    fn run(&self, spec: &RunSpec) -> Result<String, RuntimeError>;

    fn stop(&self, id: &str, timeout: Duration) -> Result<Removal, RuntimeError>;

    /// Force-remove, killing the container if it still runs.
    fn remove(&self, id: &str) -> Result<Removal, RuntimeError>;

    /// `None` if the container no longer exists.
    fn state(&self, id: &str) -> Result<Option<ContainerState>, RuntimeError>;

    /// Copy a file out of a container to the host.
    fn copy_out(&self, id: &str, container_path: &str, host_path: &Path)
    -> Result<(), RuntimeError>;
}

/// Build the argument vector for `<runtime> run`.
pub(crate) fn build_run_args(spec: &RunSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];

    if let Some(platform) = &spec.platform {
        args.push("--platform".to_string());
        args.push(platform.clone());
    }
    if let Some(entrypoint) = &spec.entrypoint {
        args.push("--entrypoint".to_string());
        args.push(entrypoint.clone());
    }
    if spec.privileged {
        args.push("--privileged".to_string());
    }
    if spec.tty {
        args.push("-it".to_string());
    }
    for (host, container) in &spec.devices {
        args.push("--device".to_string());
        args.push(format!("{}:{}", host.display(), container.display()));
    }
    for cap in &spec.cap_add {
        args.push("--cap-add".to_string());
        args.push(cap.clone());
    }
    if let Some(shm) = &spec.shm_size {
        args.push("--shm-size".to_string());
        args.push(shm.clone());
    }
    for host in &spec.extra_hosts {
        args.push("--add-host".to_string());
        args.push(host.clone());
    }
    for (host, container) in &spec.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}", host, container));
    }
    for mount in &spec.mounts {
        args.push("-v".to_string());
        args.push(format!(
            "{}:{}:{}",
            mount.host_path.display(),
            mount.container_path,
            mount.mode.as_str()
        ));
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Normalize an image reference so `foo` and `foo:latest` compare equal.
/// Digests and explicit tags are left alone.
pub fn normalize_image_ref(image: &str) -> String {
    let image = image.trim();
    if image.contains('@') {
        return image.to_string();
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

/// Exact image match; prefix-sharing names such as `foo` vs `foo-bar` never match.
pub fn images_match(target: &str, reported: &str) -> bool {
    let target = normalize_image_ref(target);
    let reported = normalize_image_ref(reported);
    if target == reported {
        return true;
    }
    // podman reports short names fully qualified.
    let strip = |s: &str| {
        s.strip_prefix("docker.io/library/")
            .or_else(|| s.strip_prefix("docker.io/"))
            .or_else(|| s.strip_prefix("localhost/"))
            .unwrap_or(s)
            .to_string()
    };
    strip(&target) == strip(&reported)
}

const PS_FORMAT: &str = "{{.ID}}\t{{.Image}}\t{{.Names}}\t{{.State}}";

/// Parse `ps --format PS_FORMAT` output (one tab-separated row per line).
pub(crate) fn parse_ps_rows(stdout: &str) -> Result<Vec<ContainerSummary>> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let mut cols = line.split('\t');
            let mut next = |field: &str| {
                cols.next()
                    .map(str::trim)
                    .with_context(|| format!("missing {} column in ps row: {}", field, line))
            };
            let id = next("ID")?.to_string();
            let image = next("Image")?.to_string();
            let name = next("Names")?.trim_start_matches('/').to_string();
            let state = ContainerState::parse(next("State")?);
            Ok(ContainerSummary {
                id,
                image,
                name,
                state,
            })
        })
        .collect()
}

fn looks_unreachable(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    s.contains("cannot connect to the docker daemon")
        || s.contains("is the docker daemon running")
        || s.contains("unable to connect to podman")
        || s.contains("error during connect")
}

fn looks_not_found(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    s.contains("no such container")
        || s.contains("no container with name or id")
        || s.contains("no such object")
}

/// Drives the docker or podman binary.
pub struct CliRuntime {
    kind: RuntimeKind,
}

impl CliRuntime {
    pub fn new(kind: RuntimeKind) -> Self {
        Self { kind }
    }

    fn exec<I, S>(&self, args: I) -> Result<String, RuntimeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let binary = self.kind.binary();
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        debug!(runtime = binary, args = ?args, "runtime:exec");
        let output = Cmd::new(binary)
            .args(args)
            .output()
            .map_err(|e| RuntimeError::Unreachable {
                runtime: binary.to_string(),
                cause: format!("{:#}", e),
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!(runtime = binary, stderr = %stderr, "runtime:exec failure");
        if looks_unreachable(&stderr) {
            Err(RuntimeError::Unreachable {
                runtime: binary.to_string(),
                cause: stderr,
            })
        } else if looks_not_found(&stderr) {
            Err(RuntimeError::NotFound(stderr))
        } else {
            Err(RuntimeError::Rejected {
                runtime: binary.to_string(),
                cause: stderr,
            })
        }
    }

    fn ps(&self, filter: String) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let stdout = self.exec([
            "ps",
            "-a",
            "--no-trunc",
            "--filter",
            filter.as_str(),
            "--format",
            PS_FORMAT,
        ])?;
        parse_ps_rows(&stdout).map_err(|e| RuntimeError::Rejected {
            runtime: self.kind.binary().to_string(),
            cause: format!("{:#}", e),
        })
    }

    fn tolerate_absent(result: Result<String, RuntimeError>) -> Result<Removal, RuntimeError> {
        match result {
            Ok(_) => Ok(Removal::Done),
            Err(RuntimeError::NotFound(_)) => Ok(Removal::AlreadyAbsent),
            Err(e) => Err(e),
        }
    }
}

impl ContainerRuntime for CliRuntime {
    fn name(&self) -> &str {
        self.kind.binary()
    }

    fn ping(&self) -> Result<(), RuntimeError> {
        self.exec(["info"]).map(|_| ()).map_err(|e| match e {
            RuntimeError::Unreachable { .. } => e,
            other => RuntimeError::Unreachable {
                runtime: self.kind.binary().to_string(),
                cause: other.to_string(),
            },
        })
    }

    fn find_by_name(&self, name: &str) -> Result<Option<ContainerSummary>, RuntimeError> {
        // The name filter is a regex substring match; re-check for equality.
        let rows = self.ps(format!("name=^/?{}$", name))?;
        Ok(rows.into_iter().find(|c| c.name == name))
    }

    fn list_by_ancestor(&self, image: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let rows = self.ps(format!("ancestor={}", image))?;
        Ok(rows
            .into_iter()
            .filter(|c| images_match(image, &c.image))
            .collect())
    }

    fn run(&self, spec: &RunSpec) -> Result<String, RuntimeError> {
        self.exec(build_run_args(spec))
    }

    fn stop(&self, id: &str, timeout: Duration) -> Result<Removal, RuntimeError> {
        let secs = timeout.as_secs().to_string();
        Self::tolerate_absent(self.exec(["stop", "-t", secs.as_str(), id]))
    }

    fn remove(&self, id: &str) -> Result<Removal, RuntimeError> {
        Self::tolerate_absent(self.exec(["rm", "-f", id]))
    }

    fn state(&self, id: &str) -> Result<Option<ContainerState>, RuntimeError> {
        match self.exec(["inspect", "--format", "{{.State.Status}}", id]) {
            Ok(status) => Ok(Some(ContainerState::parse(&status))),
            Err(RuntimeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn copy_out(
        &self,
        id: &str,
        container_path: &str,
        host_path: &Path,
    ) -> Result<(), RuntimeError> {
        let source = format!("{}:{}", id, container_path);
        let dest = host_path.display().to_string();
        self.exec(["cp", source.as_str(), dest.as_str()])
            .map(|_| ())
    }
}

/// In-memory runtime for lifecycle tests.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct FakeContainer {
        pub summary: ContainerSummary,
        pub spec: Option<RunSpec>,
    }

    #[derive(Default)]
    pub struct FakeRuntime {
        pub containers: Mutex<Vec<FakeContainer>>,
        pub unreachable: Mutex<bool>,
        /// IDs whose removal the runtime refuses.
        pub stuck: Mutex<Vec<String>>,
        /// IDs whose graceful stop the runtime refuses.
        pub stop_fails: Mutex<Vec<String>>,
        /// Every stop request with its grace period.
        pub stops: Mutex<Vec<(String, Duration)>>,
        /// Reject every `run` with this message.
        pub reject_run: Mutex<Option<String>>,
        pub copied: Mutex<Vec<(String, String, PathBuf)>>,
        next_id: Mutex<u32>,
    }

    impl FakeRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_containers(rows: &[(&str, &str, &str)]) -> Self {
            let rt = Self::new();
            for (id, image, name) in rows {
                rt.containers.lock().unwrap().push(FakeContainer {
                    summary: ContainerSummary {
                        id: id.to_string(),
                        image: image.to_string(),
                        name: name.to_string(),
                        state: ContainerState::Running,
                    },
                    spec: None,
                });
            }
            rt
        }

        pub fn set_state(&self, id: &str, state: ContainerState) {
            for c in self.containers.lock().unwrap().iter_mut() {
                if c.summary.id == id {
                    c.summary.state = state;
                }
            }
        }

        pub fn named(&self, name: &str) -> Vec<FakeContainer> {
            self.containers
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.summary.name == name)
                .cloned()
                .collect()
        }

        fn check(&self) -> Result<(), RuntimeError> {
            if *self.unreachable.lock().unwrap() {
                return Err(RuntimeError::Unreachable {
                    runtime: "fake".into(),
                    cause: "daemon down".into(),
                });
            }
            Ok(())
        }
    }

    impl ContainerRuntime for FakeRuntime {
        fn name(&self) -> &str {
            "fake"
        }

        fn ping(&self) -> Result<(), RuntimeError> {
            self.check()
        }

        fn find_by_name(&self, name: &str) -> Result<Option<ContainerSummary>, RuntimeError> {
            self.check()?;
            Ok(self.named(name).into_iter().next().map(|c| c.summary))
        }

        fn list_by_ancestor(&self, image: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
            self.check()?;
            Ok(self
                .containers
                .lock()
                .unwrap()
                .iter()
                .filter(|c| images_match(image, &c.summary.image))
                .map(|c| c.summary.clone())
                .collect())
        }

        fn run(&self, spec: &RunSpec) -> Result<String, RuntimeError> {
            self.check()?;
            if let Some(cause) = self.reject_run.lock().unwrap().clone() {
                return Err(RuntimeError::Rejected {
                    runtime: "fake".into(),
                    cause,
                });
            }
            if !self.named(&spec.name).is_empty() {
                return Err(RuntimeError::Rejected {
                    runtime: "fake".into(),
                    cause: format!("name {} already in use", spec.name),
                });
            }
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            let id = format!("fake{:08}", *next);
            self.containers.lock().unwrap().push(FakeContainer {
                summary: ContainerSummary {
                    id: id.clone(),
                    image: spec.image.clone(),
                    name: spec.name.clone(),
                    state: ContainerState::Running,
                },
                spec: Some(spec.clone()),
            });
            Ok(id)
        }

        fn stop(&self, id: &str, timeout: Duration) -> Result<Removal, RuntimeError> {
            self.check()?;
            self.stops.lock().unwrap().push((id.to_string(), timeout));
            if self.stop_fails.lock().unwrap().iter().any(|s| s == id) {
                return Err(RuntimeError::Rejected {
                    runtime: "fake".into(),
                    cause: format!("container {} did not stop", id),
                });
            }
            let mut containers = self.containers.lock().unwrap();
            match containers.iter_mut().find(|c| c.summary.id == id) {
                Some(c) => {
                    c.summary.state = ContainerState::Exited;
                    Ok(Removal::Done)
                }
                None => Ok(Removal::AlreadyAbsent),
            }
        }

        fn remove(&self, id: &str) -> Result<Removal, RuntimeError> {
            self.check()?;
            if self.stuck.lock().unwrap().iter().any(|s| s == id) {
                return Err(RuntimeError::Rejected {
                    runtime: "fake".into(),
                    cause: "device or resource busy".into(),
                });
            }
            let mut containers = self.containers.lock().unwrap();
            let before = containers.len();
            containers.retain(|c| c.summary.id != id);
            if containers.len() < before {
                Ok(Removal::Done)
            } else {
                Ok(Removal::AlreadyAbsent)
            }
        }

        fn state(&self, id: &str) -> Result<Option<ContainerState>, RuntimeError> {
            self.check()?;
            Ok(self
                .containers
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.summary.id == id)
                .map(|c| c.summary.state))
        }

        fn copy_out(
            &self,
            id: &str,
            container_path: &str,
            host_path: &Path,
        ) -> Result<(), RuntimeError> {
            self.check()?;
            std::fs::write(host_path, b"disk").map_err(|e| RuntimeError::Rejected {
                runtime: "fake".into(),
                cause: e.to_string(),
            })?;
            self.copied.lock().unwrap().push((
                id.to_string(),
                container_path.to_string(),
                host_path.to_path_buf(),
            ));
            Ok(())
        }
    }
}
