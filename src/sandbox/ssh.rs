//! Password-authenticated SSH into sandbox guests.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::cmd::Cmd;
use crate::sandbox::launcher::Credentials;

/// Options shared by every ssh invocation. Guest images are disposable, so
/// host keys change on every boot.
const SSH_OPTS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
];

#[derive(Debug, Clone)]
pub struct SshSession {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub connect_timeout: Duration,
}

impl SshSession {
    pub fn new(host: impl Into<String>, port: u16, credentials: Option<Credentials>) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Host binaries every invocation needs, in argv order.
    pub fn required_tools(&self) -> &'static [&'static str] {
        if self.credentials.is_some() {
            &["sshpass", "ssh"]
        } else {
            &["ssh"]
        }
    }

    /// First required binary that `installed` reports missing.
    pub fn missing_tool(&self, installed: impl Fn(&str) -> bool) -> Option<&'static str> {
        self.required_tools()
            .iter()
            .copied()
            .find(|tool| !installed(*tool))
    }

    /// Whether the port accepts TCP connections at all.
    pub fn port_open(&self) -> bool {
        match self.socket_addr() {
            Ok(addr) => TcpStream::connect_timeout(&addr, self.connect_timeout).is_ok(),
            Err(_) => false,
        }
    }

    fn socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {}:{}", self.host, self.port))?
            .next()
            .ok_or_else(|| anyhow!("No address for {}:{}", self.host, self.port))
    }

    /// The full argv (program first) for running `remote` in the guest.
    pub(crate) fn argv(&self, remote: &str) -> Vec<String> {
        let mut argv = Vec::new();
        if self.credentials.is_some() {
            argv.extend(["sshpass".to_string(), "-e".to_string()]);
        }
        argv.push("ssh".to_string());
        argv.extend(SSH_OPTS.iter().map(|s| s.to_string()));
        argv.push("-o".to_string());
        argv.push(format!(
            "ConnectTimeout={}",
            self.connect_timeout.as_secs().max(1)
        ));
        if self.credentials.is_none() {
            argv.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        argv.push("-p".to_string());
        argv.push(self.port.to_string());
        let target = match &self.credentials {
            Some(creds) => format!("{}@{}", creds.user, self.host),
            None => self.host.clone(),
        };
        argv.push(target);
        argv.push(remote.to_string());
        argv
    }

    fn command(&self, remote: &str, timeout: Duration) -> Cmd<'static> {
        let program = if self.credentials.is_some() {
            "sshpass"
        } else {
            "ssh"
        };
        let args = self.argv(remote).into_iter().skip(1);
        let mut cmd = Cmd::new(program).args(args).timeout(timeout);
        if let Some(creds) = &self.credentials {
            cmd = cmd.env("SSHPASS", creds.password.clone());
        }
        cmd
    }

    /// Run `remote` in the guest, failing on a non-zero exit.
    pub fn exec(&self, remote: &str, timeout: Duration) -> Result<String> {
        debug!(host = %self.host, port = self.port, remote, "ssh:exec");
        self.command(remote, timeout)
            .run_and_capture_stdout()
            .with_context(|| format!("ssh {}:{} `{}` failed", self.host, self.port, remote))
    }

    /// Run `remote` with `input` on its stdin (used for `sudo -S`).
    pub fn exec_with_stdin(&self, remote: &str, input: &str, timeout: Duration) -> Result<String> {
        debug!(host = %self.host, port = self.port, remote, "ssh:exec with stdin");
        self.command(remote, timeout)
            .stdin(input)
            .run_and_capture_stdout()
            .with_context(|| format!("ssh {}:{} `{}` failed", self.host, self.port, remote))
    }

    /// Log in and run `true`.
    pub fn handshake(&self, timeout: Duration) -> Result<()> {
        let ok = self.command("true", timeout).run_as_check()?;
        if ok {
            Ok(())
        } else {
            Err(anyhow!("ssh login to {}:{} failed", self.host, self.port))
        }
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_argv_with_password_uses_sshpass_env() {
        let session = SshSession::new(
            "127.0.0.1",
            10022,
            Some(Credentials {
                user: "eval".into(),
                password: "secret".into(),
            }),
        );
        let argv = session.argv("true");
        assert_eq!(&argv[..3], &["sshpass", "-e", "ssh"]);
        assert!(argv.iter().all(|a| !a.contains("secret")));
        assert!(argv.contains(&"eval@127.0.0.1".to_string()));
        assert!(!argv.contains(&"BatchMode=yes".to_string()));
        assert_eq!(argv.last().unwrap(), "true");
    }

    #[test]
    fn test_argv_without_password_is_batch_mode() {
        let argv = SshSession::new("10.0.0.2", 22, None).argv("uptime");
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"BatchMode=yes".to_string()));
        assert!(argv.contains(&"10.0.0.2".to_string()));
    }

    #[test]
    fn test_missing_tool_checks_sshpass_only_with_credentials() {
        let with_password = SshSession::new(
            "127.0.0.1",
            22,
            Some(Credentials {
                user: "eval".into(),
                password: "secret".into(),
            }),
        );
        assert_eq!(with_password.missing_tool(|t| t == "ssh"), Some("sshpass"));
        assert_eq!(with_password.missing_tool(|_| true), None);

        let key_auth = SshSession::new("127.0.0.1", 22, None);
        assert_eq!(key_auth.missing_tool(|t| t == "ssh"), None);
        assert_eq!(key_auth.missing_tool(|_| false), Some("ssh"));
    }

    #[test]
    fn test_port_open() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(SshSession::new("127.0.0.1", port, None).port_open());
        drop(listener);
        assert!(
            !SshSession::new("127.0.0.1", port, None)
                .with_connect_timeout(Duration::from_millis(200))
                .port_open()
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("Wi-Fi"), "'Wi-Fi'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
