use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::sandbox::launcher::Credentials;
use crate::sandbox::probe::ProbePolicy;
use crate::sandbox::profile::OsFamily;
use crate::sandbox::proxy::ProxyUrl;

/// Parse `CONTAINER:HOST` into (container, host).
pub fn parse_port_binding(s: &str) -> Result<(u16, u16), String> {
    let (container, host) = s
        .split_once(':')
        .ok_or_else(|| format!("expected CONTAINER:HOST, got '{}'", s))?;
    let container = container
        .trim()
        .parse::<u16>()
        .map_err(|e| format!("bad container port '{}': {}", container, e))?;
    let host = host
        .trim()
        .parse::<u16>()
        .map_err(|e| format!("bad host port '{}': {}", host, e))?;
    Ok((container, host))
}

/// Parse `KEY=VALUE`.
pub fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

pub fn parse_proxy(s: &str) -> Result<ProxyUrl, String> {
    ProxyUrl::parse(s).map_err(|e| e.to_string())
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct ProbeFlags {
    /// Seconds between readiness attempts
    #[arg(long, value_name = "SECS")]
    pub interval: Option<u64>,

    /// Give up after this many attempts
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: Option<u32>,

    /// Per-attempt handshake timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub attempt_timeout: Option<u64>,
}

impl ProbeFlags {
    /// CLI flags win over config, config over built-in defaults.
    pub fn policy(&self, config: &Config) -> ProbePolicy {
        ProbePolicy {
            interval: self
                .interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.probe.interval()),
            max_attempts: self
                .max_attempts
                .unwrap_or_else(|| config.probe.max_attempts()),
            attempt_timeout: self
                .attempt_timeout
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or_else(|| config.probe.attempt_timeout()),
        }
    }
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct CredentialArgs {
    /// Guest login user
    #[arg(long, requires = "password")]
    pub user: Option<String>,

    /// Guest login password
    #[arg(long, env = "DESKVM_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

impl CredentialArgs {
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some(Credentials {
                user: user.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// Everything that shapes a launch, shared by `up` and the online injectors.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct LaunchArgs {
    /// Host directory mounted as the sandbox's storage (created if missing)
    #[arg(long, value_hint = clap::ValueHint::DirPath)]
    pub storage: PathBuf,

    /// Golden disk image (linux qcow2, macOS disk)
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub golden: Option<PathBuf>,

    /// macOS base system image
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub base_image: Option<PathBuf>,

    /// Publish a container port on a host port (repeatable)
    #[arg(long = "port", value_name = "CONTAINER:HOST", value_parser = parse_port_binding)]
    pub ports: Vec<(u16, u16)>,

    /// Override the container image
    #[arg(long)]
    pub image: Option<String>,

    #[arg(long)]
    pub cpus: Option<u32>,

    /// Guest RAM, e.g. 16G
    #[arg(long)]
    pub ram: Option<String>,

    /// Extra container environment (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    #[command(flatten)]
    pub credentials: CredentialArgs,

    #[command(flatten)]
    pub probe: ProbeFlags,
}

#[derive(clap::Args, Debug, Clone)]
pub struct FleetArgs {
    /// Image reference to match exactly
    #[arg(long, required_unless_present = "family", conflicts_with = "family")]
    pub image: Option<String>,

    /// Match the image of this family's launch profile
    #[arg(long, value_enum)]
    pub family: Option<OsFamily>,

    /// Skip containers whose ID contains this substring (repeatable)
    #[arg(long = "exclude", value_name = "ID")]
    pub exclude: Vec<String>,
}
