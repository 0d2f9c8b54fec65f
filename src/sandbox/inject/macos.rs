use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use super::{InjectOutcome, ProxyInjector, SandboxSession};
use crate::error::LifecycleError;
use crate::sandbox::launcher::{Credentials, RunOverrides, SandboxHandle};
use crate::sandbox::profile::{LaunchProfile, OsFamily};
use crate::sandbox::proxy::ProxyUrl;
use crate::sandbox::ssh::{SshSession, shell_quote};

const SSH_TIMEOUT: Duration = Duration::from_secs(60);

/// Sets the guest network proxy over SSH and extracts the resulting disk as
/// a new image. The golden image itself is never written.
pub struct MacosInjector<'a> {
    pub session: SandboxSession<'a>,
    pub profile: LaunchProfile,
    /// Container name, golden and base images, and guest credentials.
    pub overrides: RunOverrides,
    /// Where the new disk image is written. Must not exist.
    pub output: PathBuf,
    /// Services to configure; every listed service when `None`.
    pub services: Option<Vec<String>>,
}

/// Parse `networksetup -listallnetworkservices`. The first line is a legend;
/// disabled services carry a leading `*`.
fn parse_network_services(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| !line.starts_with("An asterisk"))
        .map(|line| line.trim().trim_start_matches('*').trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

fn proxy_commands(service: &str, proxy: &ProxyUrl) -> Vec<String> {
    let port = proxy.port().unwrap_or(80);
    ["-setwebproxy", "-setsecurewebproxy"]
        .iter()
        .map(|flag| {
            format!(
                "sudo -S -p '' networksetup {} {} {} {}",
                flag,
                shell_quote(service),
                shell_quote(proxy.host()),
                port
            )
        })
        .collect()
}

impl MacosInjector<'_> {
    fn configure_guest(
        &self,
        handle: &SandboxHandle,
        credentials: &Credentials,
        proxy: &ProxyUrl,
    ) -> Result<usize> {
        let ssh = SshSession::new(
            handle.control_endpoint.host.clone(),
            handle.control_endpoint.port,
            Some(credentials.clone()),
        );
        let services = match &self.services {
            Some(services) => services.clone(),
            None => parse_network_services(
                &ssh.exec("networksetup -listallnetworkservices", SSH_TIMEOUT)?,
            ),
        };
        let sudo_input = format!("{}\n", credentials.password);
        for service in &services {
            for command in proxy_commands(service, proxy) {
                ssh.exec_with_stdin(&command, &sudo_input, SSH_TIMEOUT)?;
            }
            info!(container = %handle.container_name, service = %service, "inject:macos proxy set");
        }
        ssh.exec("sync", SSH_TIMEOUT)?;
        Ok(services.len())
    }

    fn extract_disk(&self, handle: &SandboxHandle) -> Result<(), LifecycleError> {
        let runtime = self.session.runtime;
        let disk = self.profile.internal_disk_path().ok_or_else(|| {
            LifecycleError::injection(&handle.container_name, "profile has no internal disk")
        })?;
        // The guest must be down before its disk is copied.
        runtime
            .stop(
                &handle.container_id,
                self.profile.stop_timeout(self.session.stop_timeout),
            )
            .map_err(|e| LifecycleError::from_runtime(&handle.container_name, e))?;
        runtime
            .copy_out(&handle.container_id, disk, &self.output)
            .map_err(|e| LifecycleError::injection(&handle.container_name, e))?;
        Ok(())
    }
}

impl ProxyInjector for MacosInjector<'_> {
    fn family(&self) -> OsFamily {
        OsFamily::Macos
    }

    fn inject(&self, proxy: &ProxyUrl) -> Result<InjectOutcome, LifecycleError> {
        if self.output.exists() {
            return Err(LifecycleError::precondition(
                self.output.display(),
                "output image already exists",
            ));
        }
        if let Some(parent) = self.output.parent()
            && !parent.as_os_str().is_empty()
            && !parent.is_dir()
        {
            return Err(LifecycleError::precondition(
                parent.display(),
                "output directory does not exist",
            ));
        }
        let credentials = self.overrides.credentials.clone().ok_or_else(|| {
            LifecycleError::precondition(
                &self.overrides.container_name,
                "macOS injection needs guest credentials",
            )
        })?;

        let handle = self.session.start(&self.profile, &self.overrides)?;
        let result = self
            .configure_guest(&handle, &credentials, proxy)
            .map_err(|e| LifecycleError::injection(&handle.container_name, format!("{:#}", e)))
            .and_then(|services| self.extract_disk(&handle).map(|_| services));
        self.session
            .teardown(&self.profile, &handle.container_name, &handle.container_id);
        let services = result?;

        info!(
            output = %self.output.display(),
            services,
            "inject:macos wrote new disk image"
        );
        Ok(InjectOutcome {
            artifact: self.output.clone(),
            in_place: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::probe::{CancelToken, ProbePolicy};
    use crate::sandbox::runtime::fake::FakeRuntime;
    use tempfile::TempDir;

    #[test]
    fn test_parse_network_services() {
        let out = "An asterisk (*) denotes that a network service is disabled.\n\
                   Ethernet\n\
                   *Thunderbolt Bridge\n\
                   Wi-Fi\n";
        assert_eq!(
            parse_network_services(out),
            vec!["Ethernet", "Thunderbolt Bridge", "Wi-Fi"]
        );
    }

    #[test]
    fn test_proxy_commands_quote_service_names() {
        let proxy = ProxyUrl::parse("http://10.1.8.5:23128").unwrap();
        let cmds = proxy_commands("Thunderbolt Bridge", &proxy);
        assert_eq!(
            cmds[0],
            "sudo -S -p '' networksetup -setwebproxy 'Thunderbolt Bridge' '10.1.8.5' 23128"
        );
        assert!(cmds[1].contains("-setsecurewebproxy"));
    }

    #[test]
    fn test_refuses_existing_output_and_missing_credentials() {
        let rt = FakeRuntime::new();
        let temp = TempDir::new().unwrap();
        let existing = temp.path().join("out.img");
        std::fs::write(&existing, b"x").unwrap();
        let rt_ref: &FakeRuntime = &rt;
        let session = move || SandboxSession {
            runtime: rt_ref,
            probe: ProbePolicy::default(),
            cancel: CancelToken::new(),
            stop_timeout: Duration::from_secs(1),
        };
        let proxy = ProxyUrl::parse("http://10.1.8.5:23128").unwrap();

        let inj = MacosInjector {
            session: session(),
            profile: LaunchProfile::builtin(OsFamily::Macos),
            overrides: RunOverrides {
                container_name: "mac-inject".into(),
                ..Default::default()
            },
            output: existing,
            services: None,
        };
        assert!(matches!(
            inj.inject(&proxy),
            Err(LifecycleError::Precondition { .. })
        ));

        let inj = MacosInjector {
            output: temp.path().join("new.img"),
            ..inj
        };
        match inj.inject(&proxy) {
            Err(LifecycleError::Precondition { reason, .. }) => {
                assert!(reason.contains("credentials"))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rt.containers.lock().unwrap().is_empty());
    }
}
