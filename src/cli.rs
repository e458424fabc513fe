use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Top-level CLI definition for the `firewheel` tool.
#[derive(Debug, Parser)]
#[command(
    name = "firewheel",
    author = "Firewheel Project",
    version,
    about = "Cluster-scale cyber experiment emulation: build experiments and \
             drive their VM schedules.",
    long_about = "Firewheel resolves model components into an experiment, \
                  replicates artifacts across the cluster, and supervises the \
                  schedule inside every VM."
)]
pub struct Cli {
    /// Path to an explicit configuration file. Defaults to searching for `firewheel.toml`.
    #[arg(
        global = true,
        short,
        long = "config",
        value_name = "PATH",
        help = "Override auto-discovery and load configuration from PATH"
    )]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scaffold a new firewheel configuration file.
    Init(InitArgs),
    /// Run the cluster coordination service.
    Server(ServerArgs),
    /// Supervise one VM's schedule (spawned per VM by the launcher).
    Handler(HandlerArgs),
    /// Resolve seed components, run their plugins, and publish schedules.
    Experiment(ExperimentArgs),
    /// Inspect the coordination service and VM registry.
    Status(StatusArgs),
    /// Re-push the local artifact caches to every cluster peer.
    Sync(SyncArgs),
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Overwrite an existing configuration.
    #[arg(long, help = "Overwrite any existing firewheel.toml")]
    pub force: bool,

    /// Hostname seeded into the cluster and coordination sections.
    #[arg(
        long,
        value_name = "HOST",
        help = "Seed the configuration with HOST as the control node"
    )]
    pub hostname: Option<String>,

    /// Write the configuration to this path instead of ./firewheel.toml.
    #[arg(
        short,
        long = "output",
        value_name = "PATH",
        help = "Write the generated configuration to PATH"
    )]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args, Default)]
pub struct ServerArgs {
    /// Override the configured listen port.
    #[arg(long, value_name = "PORT", help = "Listen on PORT instead of grpc.port")]
    pub port: Option<u16>,

    /// Pidfile for the server process.
    #[arg(
        long,
        value_name = "PATH",
        help = "Write the server pid to PATH (defaults under grpc.root_dir)"
    )]
    pub pidfile: Option<PathBuf>,

    /// Logfile for the server process.
    #[arg(
        long,
        value_name = "PATH",
        help = "Append server logs to PATH (defaults under grpc.root_dir)"
    )]
    pub logfile: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct HandlerArgs {
    /// JSON object describing the VM: {"vm_name", "vm_uuid", "engine", "path", ...}.
    #[arg(value_name = "VM_CONFIG")]
    pub vm_config: String,

    /// Seconds between schedule polls.
    #[arg(
        long,
        value_name = "SECONDS",
        default_value = "10",
        help = "Poll the schedule store every SECONDS seconds"
    )]
    pub check_interval: u64,
}

#[derive(Debug, Args)]
pub struct ExperimentArgs {
    /// Seed model components, applied in order.
    #[arg(value_name = "COMPONENT", required = true)]
    pub seeds: Vec<String>,

    /// Model component repository directories.
    #[arg(
        short,
        long = "repository",
        value_name = "DIR",
        help = "Scan DIR for installed model components (repeatable)"
    )]
    pub repositories: Vec<PathBuf>,

    /// Import and resolve without running plugins or uploading artifacts.
    #[arg(long, help = "Check the plan and plugin imports without executing")]
    pub dry_run: bool,
}

#[derive(Debug, Args, Default)]
pub struct StatusArgs {
    /// Also list every VM mapping.
    #[arg(long, help = "Include the full VM registry listing")]
    pub verbose: bool,
}

#[derive(Debug, Args, Default)]
pub struct SyncArgs {}
