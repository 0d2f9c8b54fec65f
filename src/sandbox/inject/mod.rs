//! Make the guest control plane talk through an HTTP proxy.
//!
//! Every injector mutates persistent state (a disk image or a storage
//! directory) and none of them is transactional.

mod linux;
mod macos;
mod windows;

pub use linux::LinuxInjector;
pub use macos::MacosInjector;
pub use windows::{BackupPolicy, WindowsInjector};

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::LifecycleError;
use crate::sandbox::launcher::{Launcher, RunOverrides, SandboxHandle};
use crate::sandbox::probe::{CancelToken, ProbePolicy, Prober, ReadinessResult};
use crate::sandbox::profile::{LaunchProfile, OsFamily};
use crate::sandbox::proxy::ProxyUrl;
use crate::sandbox::runtime::ContainerRuntime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InjectOutcome {
    /// The image or directory that now carries the proxy setting.
    pub artifact: PathBuf,
    /// False when a new artifact was produced next to the original.
    pub in_place: bool,
}

pub trait ProxyInjector {
    fn family(&self) -> OsFamily;

    fn inject(&self, proxy: &ProxyUrl) -> Result<InjectOutcome, LifecycleError>;
}

/// How the online injectors bring up and tear down their helper sandbox.
pub struct SandboxSession<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub probe: ProbePolicy,
    pub cancel: CancelToken,
    /// Used when the profile declares no grace period of its own.
    pub stop_timeout: Duration,
}

impl SandboxSession<'_> {
    /// Launch a sandbox without proxy variables and wait until its control
    /// plane answers. A sandbox that never comes up is torn down again.
    fn start(
        &self,
        profile: &LaunchProfile,
        overrides: &RunOverrides,
    ) -> Result<SandboxHandle, LifecycleError> {
        let mut overrides = overrides.clone();
        overrides.proxy = None;
        let handle = Launcher::new(self.runtime, self.stop_timeout).launch(profile, &overrides)?;
        let name = handle.container_name.clone();
        let id = handle.container_id.clone();

        let prober = Prober::new(self.probe).with_runtime(self.runtime);
        let err = match prober.await_ready(handle, &self.cancel) {
            ReadinessResult::Ready(handle) => return Ok(handle),
            ReadinessResult::TimedOut { attempts } => LifecycleError::ReadinessTimeout {
                container: name.clone(),
                attempts,
            },
            ReadinessResult::Failed(reason) => LifecycleError::injection(&name, reason),
            ReadinessResult::Cancelled { attempts } => LifecycleError::injection(
                &name,
                format!("cancelled after {} attempts", attempts),
            ),
        };
        self.teardown(profile, &name, &id);
        Err(err)
    }

    /// Best-effort stop and remove; failures are logged.
    fn teardown(&self, profile: &LaunchProfile, name: &str, id: &str) {
        if let Err(e) = self.runtime.stop(id, profile.stop_timeout(self.stop_timeout)) {
            warn!(container = name, error = %e, "inject:stop failed");
        }
        match self.runtime.remove(id) {
            Ok(_) => info!(container = name, "inject:helper sandbox removed"),
            Err(e) => warn!(container = name, error = %e, "inject:remove failed"),
        }
    }
}

/// Rewrite every `VAR = <value>` assignment in `content` to `value`.
///
/// Keeps indentation, an optional `export ` prefix and the quote style of
/// the existing literal (bare values get double quotes). Returns the patched
/// text and the number of assignments rewritten; zero is an error.
pub fn patch_proxy_assignment(content: &str, var: &str, value: &str) -> Result<(String, usize)> {
    let pattern = format!(
        r#"(?m)^(?P<lhs>[ \t]*(?:export[ \t]+)?{}[ \t]*=[ \t]*)(?P<rhs>"[^"\n]*"|'[^'\n]*'|[^\s#]*)"#,
        regex::escape(var)
    );
    let re = Regex::new(&pattern)?;

    let mut count = 0;
    let patched = re.replace_all(content, |caps: &regex::Captures| {
        count += 1;
        let quote = match caps["rhs"].chars().next() {
            Some('\'') => '\'',
            _ => '"',
        };
        format!("{}{}{}{}", &caps["lhs"], quote, value, quote)
    });
    if count == 0 {
        bail!("no assignment to {} found", var);
    }
    Ok((patched.into_owned(), count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_double_quoted() {
        let src = "import os\nPROXY_URL = \"\"\nport = 5000\n";
        let (out, n) = patch_proxy_assignment(src, "PROXY_URL", "http://10.1.8.5:23128").unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            out,
            "import os\nPROXY_URL = \"http://10.1.8.5:23128\"\nport = 5000\n"
        );
    }

    #[test]
    fn test_patch_keeps_single_quotes_and_indent() {
        let src = "def cfg():\n    PROXY_URL='http://old:1'  # upstream\n";
        let (out, _) = patch_proxy_assignment(src, "PROXY_URL", "http://new:2").unwrap();
        assert_eq!(out, "def cfg():\n    PROXY_URL='http://new:2'  # upstream\n");
    }

    #[test]
    fn test_patch_bare_value_and_export() {
        let src = "export HTTP_PROXY=none\n";
        let (out, _) = patch_proxy_assignment(src, "HTTP_PROXY", "http://p:3128").unwrap();
        assert_eq!(out, "export HTTP_PROXY=\"http://p:3128\"\n");
    }

    #[test]
    fn test_patch_ignores_similar_names() {
        let src = "NO_PROXY_URL = 'x'\nPROXY_URL_BACKUP = 'y'\n";
        assert!(patch_proxy_assignment(src, "PROXY_URL", "http://p:1").is_err());
    }

    #[test]
    fn test_patch_missing_assignment_errors() {
        let err = patch_proxy_assignment("print('hi')\n", "PROXY_URL", "http://p:1").unwrap_err();
        assert!(err.to_string().contains("PROXY_URL"));
    }
}
