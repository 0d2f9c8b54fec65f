use anyhow::{Context, Result, anyhow};
use std::io::{Read, Write};
use std::process::{Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};
use wait_timeout::ChildExt;

/// A builder for executing external commands with unified error handling
pub struct Cmd<'a> {
    command: &'a str,
    args: Vec<String>,
    envs: Vec<(&'a str, String)>,
    stdin: Option<String>,
    timeout: Option<Duration>,
}

impl<'a> Cmd<'a> {
    /// Create a new command builder
    pub fn new(command: &'a str) -> Self {
        Self {
            command,
            args: Vec::new(),
            envs: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child only
    pub fn env(mut self, key: &'a str, value: impl Into<String>) -> Self {
        self.envs.push((key, value.into()));
        self
    }

    /// Feed the given text to the child's stdin
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Kill the child if it has not exited within `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Execute the command and return its output regardless of exit status.
    /// Only fails if the process could not be spawned or timed out.
    pub fn output(self) -> Result<Output> {
        let Cmd {
            command,
            args,
            envs,
            stdin,
            timeout,
        } = self;
        trace!(command, args = ?args, "cmd:output start");

        let mut cmd = Command::new(command);
        for (key, value) in &envs {
            cmd.env(key, value);
        }
        cmd.args(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().with_context(|| {
            format!("Failed to execute command: {} {}", command, args.join(" "))
        })?;

        // Pipes are serviced on threads while we wait; a full pipe stalls the child.
        let writer = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => Some(thread::spawn(move || {
                // The child may exit before reading everything; that is not our error.
                let _ = pipe.write_all(input.as_bytes());
            })),
            _ => None,
        };
        let stdout_reader = child.stdout.take().map(drain);
        let stderr_reader = child.stderr.take().map(drain);

        let status = match timeout {
            Some(limit) => match child
                .wait_timeout(limit)
                .context("Failed to wait for command")?
            {
                Some(status) => status,
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    debug!(command, timeout_secs = limit.as_secs(), "cmd:output timed out");
                    // Readers are detached: a surviving grandchild may hold the pipes open.
                    return Err(anyhow!(
                        "Command timed out after {}s: {} {}",
                        limit.as_secs(),
                        command,
                        args.join(" ")
                    ));
                }
            },
            None => child
                .wait()
                .with_context(|| format!("Failed to wait for {}", command))?,
        };

        if let Some(writer) = writer {
            let _ = writer.join();
        }
        let output = Output {
            status,
            stdout: collect(stdout_reader, command)?,
            stderr: collect(stderr_reader, command)?,
        };
        trace!(command, status = ?output.status.code(), "cmd:output done");
        Ok(output)
    }

    /// Execute the command and return the output
    /// Returns an error if the command fails (non-zero exit code)
    pub fn run(self) -> Result<Output> {
        let command = self.command;
        let rendered = self.args.join(" ");
        let output = self.output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                command,
                args = %rendered,
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "cmd:run failure"
            );
            return Err(anyhow!(
                "Command failed: {} {}\n{}",
                command,
                rendered,
                stderr.trim()
            ));
        }
        trace!(command, "cmd:run success");
        Ok(output)
    }

    /// Execute the command and return stdout as a trimmed string
    pub fn run_and_capture_stdout(self) -> Result<String> {
        let output = self.run()?;
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }

    /// Execute the command, returning Ok(true) if it succeeds, Ok(false) if it fails
    pub fn run_as_check(self) -> Result<bool> {
        let command = self.command;
        let output = self.output()?;
        let success = output.status.success();
        trace!(command, success, "cmd:check result");
        Ok(success)
    }
}

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<std::io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn collect(
    reader: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
    command: &str,
) -> Result<Vec<u8>> {
    match reader {
        Some(handle) => handle
            .join()
            .map_err(|_| anyhow!("Output reader for {} panicked", command))?
            .with_context(|| format!("Failed to collect output of {}", command)),
        None => Ok(Vec::new()),
    }
}
