//! Blocking, cancellable readiness polling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tracing::{debug, info, warn};

use crate::error::LifecycleError;
use crate::sandbox::launcher::{ControlEndpoint, Credentials, SandboxHandle};
use crate::sandbox::profile::ControlProtocol;
use crate::sandbox::runtime::{ContainerRuntime, RuntimeError};
use crate::sandbox::ssh::SshSession;

/// Longest uninterrupted sleep; bounds how late a cancellation is noticed.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 120,
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared abort flag, settable from a signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first. Returns false if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

#[derive(Debug)]
pub enum ReadinessResult {
    Ready(SandboxHandle),
    TimedOut { attempts: u32 },
    /// Non-retryable, e.g. the container exited.
    Failed(String),
    Cancelled { attempts: u32 },
}

/// One lightweight liveness check against a control endpoint.
pub trait Handshake {
    fn attempt(&self) -> Result<()>;
}

pub struct HttpHandshake {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpHandshake {
    pub fn new(endpoint: &ControlEndpoint, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()?;
        let path = endpoint.liveness_path.as_deref().unwrap_or("/");
        Ok(Self {
            client,
            url: format!("{}{}", endpoint.base_url(), path),
        })
    }
}

impl Handshake for HttpHandshake {
    fn attempt(&self) -> Result<()> {
        let response = self.client.get(&self.url).send()?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(anyhow!("GET {} returned {}", self.url, response.status()))
        }
    }
}

pub struct SshHandshake {
    session: SshSession,
    timeout: Duration,
}

impl SshHandshake {
    pub fn new(endpoint: &ControlEndpoint, credentials: Option<Credentials>, timeout: Duration) -> Self {
        Self {
            session: SshSession::new(endpoint.host.clone(), endpoint.port, credentials)
                .with_connect_timeout(timeout),
            timeout,
        }
    }

    /// Refuse up front when a host binary is missing; every attempt would fail.
    fn ensure_tools(self, installed: impl Fn(&str) -> bool) -> Result<Self> {
        if let Some(tool) = self.session.missing_tool(installed) {
            return Err(LifecycleError::precondition(
                tool,
                "not installed; required for SSH readiness checks",
            )
            .into());
        }
        Ok(self)
    }
}

impl Handshake for SshHandshake {
    fn attempt(&self) -> Result<()> {
        // Skip spawning ssh while the forwarded port is still closed.
        if !self.session.port_open() {
            return Err(anyhow!(
                "port {}:{} not accepting connections",
                self.session.host,
                self.session.port
            ));
        }
        // Login and command together get a little more than the connect budget.
        self.session.handshake(self.timeout * 2)
    }
}

pub fn handshake_for(
    endpoint: &ControlEndpoint,
    credentials: Option<Credentials>,
    timeout: Duration,
) -> Result<Box<dyn Handshake>> {
    Ok(match endpoint.protocol {
        ControlProtocol::Http => Box::new(HttpHandshake::new(endpoint, timeout)?),
        ControlProtocol::Ssh => Box::new(
            SshHandshake::new(endpoint, credentials, timeout)
                .ensure_tools(|tool| which::which(tool).is_ok())?,
        ),
    })
}

/// Outcome of [`poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
    Cancelled { attempts: u32 },
    /// The target is gone for good.
    Aborted { attempts: u32 },
}

/// Core loop: attempt, then sleep between attempts. No sleep after the last one.
/// `gone` is consulted after each failed attempt and aborts the poll when it
/// returns a reason.
pub fn poll(
    handshake: &dyn Handshake,
    policy: ProbePolicy,
    cancel: &CancelToken,
    mut gone: impl FnMut() -> Option<String>,
) -> (PollOutcome, Option<String>) {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;
    while attempts < max_attempts {
        if cancel.is_cancelled() {
            return (PollOutcome::Cancelled { attempts }, None);
        }
        attempts += 1;
        match handshake.attempt() {
            Ok(()) => return (PollOutcome::Ready { attempts }, None),
            Err(e) => debug!(attempt = attempts, error = %e, "probe:attempt failed"),
        }
        if let Some(reason) = gone() {
            return (PollOutcome::Aborted { attempts }, Some(reason));
        }
        if attempts < max_attempts && !cancel.sleep(policy.interval) {
            return (PollOutcome::Cancelled { attempts }, None);
        }
    }
    (PollOutcome::TimedOut { attempts }, None)
}

pub struct Prober<'a> {
    runtime: Option<&'a dyn ContainerRuntime>,
    policy: ProbePolicy,
}

impl<'a> Prober<'a> {
    pub fn new(policy: ProbePolicy) -> Self {
        Self {
            runtime: None,
            policy,
        }
    }

    /// Watch the container between attempts so a dead sandbox fails fast.
    pub fn with_runtime(mut self, runtime: &'a dyn ContainerRuntime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn await_ready(&self, handle: SandboxHandle, cancel: &CancelToken) -> ReadinessResult {
        let handshake = match handshake_for(
            &handle.control_endpoint,
            handle.credentials.clone(),
            self.policy.attempt_timeout,
        ) {
            Ok(h) => h,
            Err(e) => return ReadinessResult::Failed(format!("{:#}", e)),
        };
        self.await_with(handle, handshake.as_ref(), cancel)
    }

    pub fn await_with(
        &self,
        handle: SandboxHandle,
        handshake: &dyn Handshake,
        cancel: &CancelToken,
    ) -> ReadinessResult {
        let name = handle.container_name.clone();
        info!(
            container = %name,
            endpoint = %format!("{}:{}", handle.control_endpoint.host, handle.control_endpoint.port),
            protocol = %handle.control_endpoint.protocol,
            max_attempts = self.policy.max_attempts,
            "probe:waiting"
        );
        let started = Instant::now();
        let (outcome, reason) = poll(handshake, self.policy, cancel, || {
            self.container_gone(&handle)
        });
        match outcome {
            PollOutcome::Ready { attempts } => {
                info!(
                    container = %name,
                    attempts,
                    elapsed_secs = started.elapsed().as_secs(),
                    "probe:ready"
                );
                ReadinessResult::Ready(handle)
            }
            PollOutcome::TimedOut { attempts } => {
                warn!(container = %name, attempts, "probe:timed out");
                ReadinessResult::TimedOut { attempts }
            }
            PollOutcome::Cancelled { attempts } => {
                info!(container = %name, attempts, "probe:cancelled");
                ReadinessResult::Cancelled { attempts }
            }
            PollOutcome::Aborted { .. } => {
                let reason = reason.unwrap_or_else(|| "container is gone".to_string());
                warn!(container = %name, reason = %reason, "probe:failed");
                ReadinessResult::Failed(reason)
            }
        }
    }

    fn container_gone(&self, handle: &SandboxHandle) -> Option<String> {
        let runtime = self.runtime?;
        match runtime.state(&handle.container_id) {
            Ok(Some(state)) if state.is_terminal() => Some(format!(
                "container '{}' is {}",
                handle.container_name, state
            )),
            Ok(Some(_)) => None,
            Ok(None) => Some(format!("container '{}' vanished", handle.container_name)),
            // Transient runtime errors keep polling.
            Err(RuntimeError::Unreachable { .. } | RuntimeError::Rejected { .. }) => None,
            Err(RuntimeError::NotFound(_)) => {
                Some(format!("container '{}' vanished", handle.container_name))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::profile::OsFamily;
    use crate::sandbox::runtime::ContainerState;
    use crate::sandbox::runtime::fake::FakeRuntime;
    use chrono::Utc;
    use std::cell::Cell;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    struct Scripted {
        succeed_on: Option<u32>,
        calls: Cell<u32>,
    }

    impl Scripted {
        fn never() -> Self {
            Self {
                succeed_on: None,
                calls: Cell::new(0),
            }
        }

        fn on(n: u32) -> Self {
            Self {
                succeed_on: Some(n),
                calls: Cell::new(0),
            }
        }
    }

    impl Handshake for Scripted {
        fn attempt(&self) -> Result<()> {
            let n = self.calls.get() + 1;
            self.calls.set(n);
            if self.succeed_on == Some(n) {
                Ok(())
            } else {
                Err(anyhow!("connection refused"))
            }
        }
    }

    fn fast(max_attempts: u32) -> ProbePolicy {
        ProbePolicy {
            interval: Duration::from_millis(10),
            max_attempts,
            attempt_timeout: Duration::from_millis(200),
        }
    }

    fn handle(id: &str, port: u16, protocol: ControlProtocol) -> SandboxHandle {
        SandboxHandle {
            container_id: id.to_string(),
            container_name: format!("{}-name", id),
            os_family: OsFamily::Linux,
            control_endpoint: ControlEndpoint {
                host: "127.0.0.1".into(),
                port,
                protocol,
                liveness_path: Some("/probe".into()),
            },
            created_at: Utc::now(),
            degraded: false,
            credentials: None,
        }
    }

    #[test]
    fn test_dead_endpoint_times_out_within_budget() {
        let hs = Scripted::never();
        let result = Prober::new(fast(4)).await_with(
            handle("c1", 1, ControlProtocol::Http),
            &hs,
            &CancelToken::new(),
        );
        assert!(matches!(result, ReadinessResult::TimedOut { attempts: 4 }));
        assert_eq!(hs.calls.get(), 4);
    }

    #[test]
    fn test_ready_on_first_success() {
        let hs = Scripted::on(3);
        let result = Prober::new(fast(10)).await_with(
            handle("c1", 1, ControlProtocol::Http),
            &hs,
            &CancelToken::new(),
        );
        assert!(matches!(result, ReadinessResult::Ready(_)));
        assert_eq!(hs.calls.get(), 3);
    }

    #[test]
    fn test_no_sleep_after_last_attempt() {
        let policy = ProbePolicy {
            interval: Duration::from_secs(3),
            max_attempts: 1,
            attempt_timeout: Duration::from_millis(100),
        };
        let started = Instant::now();
        let (outcome, _) = poll(&Scripted::never(), policy, &CancelToken::new(), || None);
        assert_eq!(outcome, PollOutcome::TimedOut { attempts: 1 });
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_cancel_interrupts_sleep() {
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let policy = ProbePolicy {
            interval: Duration::from_secs(30),
            max_attempts: 5,
            attempt_timeout: Duration::from_millis(100),
        };
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            remote.cancel();
        });
        let started = Instant::now();
        let (outcome, _) = poll(&Scripted::never(), policy, &cancel, || None);
        worker.join().unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled { attempts: 1 });
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_exited_container_fails_fast() {
        let rt = FakeRuntime::with_containers(&[("c1", "img", "c1-name")]);
        rt.set_state("c1", ContainerState::Exited);
        let hs = Scripted::never();
        let result = Prober::new(fast(50)).with_runtime(&rt).await_with(
            handle("c1", 1, ControlProtocol::Http),
            &hs,
            &CancelToken::new(),
        );
        match result {
            ReadinessResult::Failed(reason) => assert!(reason.contains("c1-name")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(hs.calls.get(), 1);
    }

    #[test]
    fn test_vanished_container_fails() {
        let rt = FakeRuntime::new();
        let result = Prober::new(fast(50)).with_runtime(&rt).await_with(
            handle("gone", 1, ControlProtocol::Http),
            &Scripted::never(),
            &CancelToken::new(),
        );
        assert!(matches!(result, ReadinessResult::Failed(_)));
    }

    #[test]
    fn test_http_handshake_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf).unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .unwrap();
            request
        });

        let h = handle("c1", port, ControlProtocol::Http);
        let hs = HttpHandshake::new(&h.control_endpoint, Duration::from_secs(2)).unwrap();
        hs.attempt().unwrap();
        let request = server.join().unwrap();
        assert!(request.starts_with("GET /probe "));
    }

    #[test]
    fn test_http_handshake_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let h = handle("c1", port, ControlProtocol::Http);
        let hs = HttpHandshake::new(&h.control_endpoint, Duration::from_millis(300)).unwrap();
        assert!(hs.attempt().is_err());
    }

    #[test]
    fn test_ssh_handshake_closed_port_fails_without_spawning() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let h = handle("c1", port, ControlProtocol::Ssh);
        let hs = SshHandshake::new(&h.control_endpoint, None, Duration::from_millis(200));
        let err = hs.attempt().unwrap_err();
        assert!(err.to_string().contains("not accepting"));
    }

    #[test]
    fn test_missing_sshpass_fails_before_polling() {
        let mut h = handle("c1", 22, ControlProtocol::Ssh);
        h.credentials = Some(Credentials {
            user: "eval".into(),
            password: "secret".into(),
        });
        let err = SshHandshake::new(&h.control_endpoint, h.credentials.clone(), Duration::from_millis(200))
            .ensure_tools(|tool| tool != "sshpass")
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<LifecycleError>(),
            Some(LifecycleError::Precondition { subject, .. }) if subject == "sshpass"
        ));
    }
}
