use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{InjectOutcome, ProxyInjector, SandboxSession, patch_proxy_assignment};
use crate::error::LifecycleError;
use crate::sandbox::launcher::{ControlEndpoint, RunOverrides};
use crate::sandbox::profile::{LaunchProfile, OsFamily};
use crate::sandbox::proxy::ProxyUrl;
use crate::sandbox::snapshot::copy_sparse;

const INTERNET_SETTINGS: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(120);
/// Keeps each write-back command well under cmd.exe's line limit.
const BASE64_CHUNK: usize = 4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupPolicy {
    /// Copy the storage directory here before touching it. Must not exist.
    Create(PathBuf),
    /// The operator asserts a clean copy already lives here.
    Existing(PathBuf),
}

/// Edits a directly-mounted Windows storage directory through the running
/// guest's control API. Changes are permanent.
pub struct WindowsInjector<'a> {
    pub session: SandboxSession<'a>,
    pub profile: LaunchProfile,
    /// Carries the container name and the storage directory to edit.
    pub overrides: RunOverrides,
    pub backup: BackupPolicy,
    /// The operator acknowledged that the edit is permanent.
    pub confirmed: bool,
    /// Guest path of the control-plane source.
    pub source_path: String,
    pub variable: String,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    returncode: Option<i64>,
}

/// Client for the guest's `POST /execute` endpoint.
struct GuestApi {
    client: reqwest::blocking::Client,
    url: String,
}

impl GuestApi {
    fn new(endpoint: &ControlEndpoint) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(EXECUTE_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/execute", endpoint.base_url()),
        })
    }

    fn execute(&self, command: &str) -> Result<String> {
        debug!(command, "inject:windows execute");
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "command": command, "shell": true }))
            .send()?;
        let status = response.status();
        if !status.is_success() {
            bail!("{} returned {} for `{}`", self.url, status, command);
        }
        let body: ExecuteResponse = response.json()?;
        check_execute_response(command, body)
    }
}

fn check_execute_response(command: &str, body: ExecuteResponse) -> Result<String> {
    let failed = body.status.as_deref() == Some("error")
        || body.returncode.is_some_and(|code| code != 0);
    if failed {
        let detail = body
            .error
            .filter(|e| !e.trim().is_empty())
            .or(body.output)
            .unwrap_or_default();
        return Err(anyhow!("`{}` failed in guest: {}", command, detail.trim()));
    }
    Ok(body.output.unwrap_or_default())
}

fn system_proxy_commands(proxy: &ProxyUrl) -> Vec<String> {
    let server = proxy.host_port();
    vec![
        format!(
            r#"netsh winhttp set proxy proxy-server="{}" bypass-list="localhost;127.0.0.1""#,
            server
        ),
        format!(
            r#"reg add "{}" /v ProxyEnable /t REG_DWORD /d 1 /f"#,
            INTERNET_SETTINGS
        ),
        format!(
            r#"reg add "{}" /v ProxyServer /t REG_SZ /d "{}" /f"#,
            INTERNET_SETTINGS, server
        ),
    ]
}

/// PowerShell commands that stage `bytes` as base64 next to `path` in
/// chunks, decode them over `path`, and remove the staging file.
fn write_back_commands(path: &str, bytes: &[u8]) -> Vec<String> {
    let encoded = BASE64.encode(bytes);
    let staging = format!("{}.b64", path);
    let ps = |script: String| format!(r#"powershell -NoProfile -Command "{}""#, script);

    let mut commands = vec![ps(format!("Set-Content -NoNewline -Path '{}' -Value ''", staging))];
    let chars: Vec<char> = encoded.chars().collect();
    for chunk in chars.chunks(BASE64_CHUNK) {
        let chunk: String = chunk.iter().collect();
        commands.push(ps(format!(
            "Add-Content -NoNewline -Path '{}' -Value '{}'",
            staging, chunk
        )));
    }
    commands.push(ps(format!(
        "[IO.File]::WriteAllBytes('{}', [Convert]::FromBase64String((Get-Content -Raw '{}')))",
        path, staging
    )));
    commands.push(ps(format!("Remove-Item -Force '{}'", staging)));
    commands
}

impl WindowsInjector<'_> {
    fn storage(&self) -> &PathBuf {
        &self.overrides.host_storage_path
    }

    fn ensure_backup(&self) -> Result<PathBuf, LifecycleError> {
        match &self.backup {
            BackupPolicy::Create(path) => {
                if path.exists() {
                    return Err(LifecycleError::precondition(
                        path.display(),
                        "backup target already exists",
                    ));
                }
                info!(storage = %self.storage().display(), backup = %path.display(), "inject:windows backing up storage");
                copy_sparse(self.storage(), path)
                    .map_err(|e| LifecycleError::injection(path.display(), format!("{:#}", e)))?;
                Ok(path.clone())
            }
            BackupPolicy::Existing(path) => {
                if !path.is_dir() {
                    return Err(LifecycleError::precondition(
                        path.display(),
                        "asserted backup does not exist",
                    ));
                }
                Ok(path.clone())
            }
        }
    }

    fn edit_guest(&self, api: &GuestApi, proxy: &ProxyUrl) -> Result<usize> {
        for command in system_proxy_commands(proxy) {
            api.execute(&command)?;
        }

        let source = api.execute(&format!(r#"type "{}""#, self.source_path))?;
        let (patched, count) = patch_proxy_assignment(&source, &self.variable, proxy.as_str())?;
        for command in write_back_commands(&self.source_path, patched.as_bytes()) {
            api.execute(&command)?;
        }
        Ok(count)
    }
}

impl ProxyInjector for WindowsInjector<'_> {
    fn family(&self) -> OsFamily {
        OsFamily::Windows
    }

    fn inject(&self, proxy: &ProxyUrl) -> Result<InjectOutcome, LifecycleError> {
        let storage = self.storage().clone();
        if !self.confirmed {
            return Err(LifecycleError::precondition(
                storage.display(),
                "editing a Windows storage directory is permanent and needs explicit confirmation",
            ));
        }
        if !storage.is_dir() {
            return Err(LifecycleError::precondition(
                storage.display(),
                "storage directory does not exist",
            ));
        }
        let backup = self.ensure_backup()?;

        let handle = self.session.start(&self.profile, &self.overrides)?;
        let result = GuestApi::new(&handle.control_endpoint)
            .and_then(|api| self.edit_guest(&api, proxy));
        self.session
            .teardown(&self.profile, &handle.container_name, &handle.container_id);

        let count = result.map_err(|e| {
            LifecycleError::injection(&handle.container_name, format!("{:#}", e))
        })?;
        info!(
            storage = %storage.display(),
            backup = %backup.display(),
            assignments = count,
            "inject:windows patched"
        );
        Ok(InjectOutcome {
            artifact: storage,
            in_place: true,
        })
    }
}
