use std::process::ExitCode;

use clap::{CommandFactory, Parser, error::ErrorKind};

use firewheel::app;
use firewheel::cli::{Cli, Commands};
pub use firewheel::{Error, Result, core};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(64),
            };
        }
    };

    let Cli { config, command } = cli;

    let command = match command {
        Some(cmd) => cmd,
        None => {
            let mut command = Cli::command();
            let _ = command.print_help();
            println!();
            return ExitCode::from(64);
        }
    };

    let exit = match command {
        Commands::Init(args) => app::handle_init(args),
        Commands::Server(args) => app::handle_server(args, config.as_deref()),
        Commands::Handler(args) => app::handle_handler(args, config.as_deref()),
        Commands::Experiment(args) => app::handle_experiment(args, config.as_deref()),
        Commands::Status(args) => app::handle_status(args, config.as_deref()),
        Commands::Sync(args) => app::handle_sync(args, config.as_deref()),
    };

    match exit {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            app::error::exit_code(&err)
        }
    }
}
