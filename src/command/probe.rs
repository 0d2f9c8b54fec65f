use anyhow::{Result, bail};
use console::style;

use super::args::{CredentialArgs, ProbeFlags};
use super::{install_cancel_handler, load_config};
use crate::sandbox::launcher::ControlEndpoint;
use crate::sandbox::probe::{PollOutcome, handshake_for, poll};
use crate::sandbox::profile::ControlProtocol;
use crate::sandbox::runtime::RuntimeKind;
use crate::spinner;

pub struct ProbeOptions {
    pub protocol: ControlProtocol,
    pub host: String,
    pub port: u16,
    pub path: Option<String>,
    pub credentials: CredentialArgs,
    pub probe: ProbeFlags,
}

/// Wait for an arbitrary control endpoint without touching any container.
pub fn run(runtime_flag: Option<RuntimeKind>, opts: ProbeOptions) -> Result<()> {
    let config = load_config(runtime_flag)?;
    let policy = opts.probe.policy(&config);
    let endpoint = ControlEndpoint {
        host: opts.host,
        port: opts.port,
        protocol: opts.protocol,
        liveness_path: match opts.protocol {
            ControlProtocol::Http => Some(opts.path.unwrap_or_else(|| "/".to_string())),
            ControlProtocol::Ssh => None,
        },
    };
    let handshake = handshake_for(
        &endpoint,
        opts.credentials.credentials(),
        policy.attempt_timeout,
    )?;

    let cancel = install_cancel_handler();
    let target = format!("{}:{}", endpoint.host, endpoint.port);
    let (outcome, _) = spinner::with_spinner_status(
        &format!("Probing {} {}", endpoint.protocol, target),
        || poll(handshake.as_ref(), policy, &cancel, || None),
        |(outcome, _)| matches!(outcome, PollOutcome::Ready { .. }),
    );

    match outcome {
        PollOutcome::Ready { attempts } => {
            println!(
                "{} {} ready after {} attempt(s)",
                style("✓").green(),
                target,
                attempts
            );
            Ok(())
        }
        PollOutcome::TimedOut { attempts } => {
            bail!("{} was not reachable after {} attempts", target, attempts)
        }
        PollOutcome::Cancelled { attempts } => {
            bail!("Probe of {} cancelled after {} attempts", target, attempts)
        }
        PollOutcome::Aborted { attempts } => {
            bail!("Probe of {} aborted after {} attempts", target, attempts)
        }
    }
}
