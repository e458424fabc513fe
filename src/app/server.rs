use std::path::Path;

use crate::cli::ServerArgs;
use crate::config::Config;
use crate::core::coordination::{serve, ServerOptions};
use crate::core::logs::{Level, LogSink};
use crate::error::Result;

pub fn handle_server(args: ServerArgs, config_path: Option<&Path>) -> Result<()> {
    let config = Config::discover(config_path)?;
    super::apply_umask(&config);
    for warning in &config.warnings {
        eprintln!("Warning: {warning}");
    }

    let root = config.grpc.root_dir.clone();
    let options = ServerOptions {
        hostname: config.grpc.hostname.clone(),
        port: args.port.unwrap_or(config.grpc.port),
        pidfile: args.pidfile.unwrap_or_else(|| root.join("server.pid")),
        logfile: args.logfile.unwrap_or_else(|| root.join("server.log")),
    };

    let log = LogSink::open(
        "coordination-server",
        &options.logfile,
        Level::parse(&config.logging.level),
    )?;
    serve(&options, log)
}
