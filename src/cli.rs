use std::path::PathBuf;

use crate::command;
use crate::command::args::{CredentialArgs, FleetArgs, LaunchArgs, ProbeFlags, parse_proxy};
use crate::sandbox::profile::{ControlProtocol, OsFamily};
use crate::sandbox::proxy::ProxyUrl;
use crate::sandbox::runtime::RuntimeKind;
use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "deskvm")]
#[command(about = "Launch, readiness-gate and reap containerized desktop VM sandboxes")]
struct Cli {
    /// Container runtime to drive (overrides config)
    #[arg(long, global = true, value_enum)]
    runtime: Option<RuntimeKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a sandbox and wait until its control plane answers
    Up {
        #[arg(value_enum)]
        family: OsFamily,

        /// Container name, unique among active runs. An existing container
        /// with this name is replaced.
        #[arg(long)]
        name: String,

        /// Route guest traffic through this proxy (http, https or socks5)
        #[arg(long, value_parser = parse_proxy)]
        proxy: Option<ProxyUrl>,

        #[command(flatten)]
        launch: LaunchArgs,

        /// Return as soon as the container is started
        #[arg(long)]
        no_wait: bool,

        /// Print the sandbox handle as JSON
        #[arg(long)]
        json: bool,
    },

    /// Wait for a control endpoint to answer, without launching anything
    Probe {
        #[arg(long, value_enum)]
        protocol: ControlProtocol,

        #[arg(long, default_value = "localhost")]
        host: String,

        #[arg(long)]
        port: u16,

        /// Liveness path for HTTP endpoints
        #[arg(long)]
        path: Option<String>,

        #[command(flatten)]
        credentials: CredentialArgs,

        #[command(flatten)]
        probe: ProbeFlags,
    },

    /// List sandboxes created from an image
    #[command(visible_alias = "list")]
    Ls {
        #[command(flatten)]
        fleet: FleetArgs,

        #[arg(long)]
        json: bool,
    },

    /// Stop and remove every sandbox created from an image
    Reap {
        #[command(flatten)]
        fleet: FleetArgs,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        #[arg(long)]
        json: bool,
    },

    /// Force-remove one sandbox by name
    #[command(visible_alias = "remove")]
    Rm { name: String },

    /// Make a guest's control plane use an HTTP proxy
    Inject {
        #[command(subcommand)]
        command: InjectCommands,
    },

    /// Restore a Windows storage directory from its backup
    Revert {
        /// Storage directory to replace. Its sandbox must be removed first.
        #[arg(long, value_hint = clap::ValueHint::DirPath)]
        storage: PathBuf,

        #[arg(long, value_hint = clap::ValueHint::DirPath)]
        backup: PathBuf,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Print the effective launch profile for an OS family
    Profile {
        #[arg(value_enum)]
        family: OsFamily,

        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum InjectCommands {
    /// Patch the control-plane config inside a qcow2 image offline
    Linux {
        #[arg(long, value_parser = parse_proxy)]
        proxy: ProxyUrl,

        /// Disk image to patch in place
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        disk: PathBuf,

        /// File inside the guest holding the proxy assignment
        #[arg(long)]
        guest_path: Option<String>,

        /// Variable to rewrite
        #[arg(long)]
        variable: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Set the system proxy of a running Windows guest. Permanent.
    Windows {
        #[arg(long, value_parser = parse_proxy)]
        proxy: ProxyUrl,

        /// Name of the helper sandbox
        #[arg(long, default_value = "deskvm-inject-windows")]
        name: String,

        #[command(flatten)]
        launch: LaunchArgs,

        /// Copy the storage directory here first (must not exist)
        #[arg(long, required_unless_present = "existing_backup", conflicts_with = "existing_backup")]
        backup: Option<PathBuf>,

        /// A clean copy of the storage directory already lives here
        #[arg(long)]
        existing_backup: Option<PathBuf>,

        /// Guest path of the control-plane source
        #[arg(long)]
        source_path: Option<String>,

        /// Variable to rewrite
        #[arg(long)]
        variable: Option<String>,

        /// Acknowledge the permanent edit without prompting
        #[arg(short, long)]
        yes: bool,

        #[arg(long)]
        json: bool,
    },

    /// Set the network proxy of a macOS guest and extract a new disk image
    Macos {
        #[arg(long, value_parser = parse_proxy)]
        proxy: ProxyUrl,

        /// Name of the helper sandbox
        #[arg(long, default_value = "deskvm-inject-macos")]
        name: String,

        #[command(flatten)]
        launch: LaunchArgs,

        /// Path for the new disk image (must not exist)
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        output: PathBuf,

        /// Network service to configure (repeatable; default: all)
        #[arg(long = "service")]
        services: Vec<String>,

        #[arg(long)]
        json: bool,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let runtime = cli.runtime;

    match cli.command {
        Commands::Up {
            family,
            name,
            proxy,
            launch,
            no_wait,
            json,
        } => command::up::run(
            runtime,
            command::up::UpOptions {
                family,
                name,
                proxy,
                launch,
                no_wait,
                json,
            },
        ),
        Commands::Probe {
            protocol,
            host,
            port,
            path,
            credentials,
            probe,
        } => command::probe::run(
            runtime,
            command::probe::ProbeOptions {
                protocol,
                host,
                port,
                path,
                credentials,
                probe,
            },
        ),
        Commands::Ls { fleet, json } => command::fleet::list(runtime, &fleet, json),
        Commands::Reap { fleet, yes, json } => command::fleet::reap(runtime, &fleet, yes, json),
        Commands::Rm { name } => command::fleet::remove(runtime, &name),
        Commands::Inject { command } => run_inject(runtime, command),
        Commands::Revert {
            storage,
            backup,
            yes,
        } => command::revert::run(&storage, &backup, yes),
        Commands::Profile { family, json } => command::profile::run(family, json),
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    }
}

fn run_inject(runtime: Option<RuntimeKind>, command: InjectCommands) -> Result<()> {
    match command {
        InjectCommands::Linux {
            proxy,
            disk,
            guest_path,
            variable,
            json,
        } => command::inject::linux(
            runtime,
            command::inject::LinuxOptions {
                proxy,
                disk,
                guest_path,
                variable,
                json,
            },
        ),
        InjectCommands::Windows {
            proxy,
            name,
            launch,
            backup,
            existing_backup,
            source_path,
            variable,
            yes,
            json,
        } => command::inject::windows(
            runtime,
            command::inject::WindowsOptions {
                proxy,
                name,
                launch,
                backup,
                existing_backup,
                source_path,
                variable,
                yes,
                json,
            },
        ),
        InjectCommands::Macos {
            proxy,
            name,
            launch,
            output,
            services,
            json,
        } => command::inject::macos(
            runtime,
            command::inject::MacosOptions {
                proxy,
                name,
                launch,
                output,
                services,
                json,
            },
        ),
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    let mut buf = Vec::new();
    generate(shell, &mut cmd, &name, &mut buf);
    print!("{}", String::from_utf8_lossy(&buf));
}
