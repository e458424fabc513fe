use std::path::Path;

use crate::cli::ExperimentArgs;
use crate::config::Config;
use crate::core::experiment::{launch_experiment, ExperimentOptions};
use crate::core::graph::CapabilityRegistry;
use crate::core::logs::{Level, LogSink};
use crate::core::plugin::PluginRegistry;
use crate::error::Result;

pub fn handle_experiment(args: ExperimentArgs, config_path: Option<&Path>) -> Result<()> {
    handle_experiment_with(
        args,
        config_path,
        &PluginRegistry::new(),
        &CapabilityRegistry::new(),
    )
}

/// Entry point for embedders that register their own plugins and
/// capabilities before launching.
pub fn handle_experiment_with(
    args: ExperimentArgs,
    config_path: Option<&Path>,
    plugins: &PluginRegistry,
    capabilities: &CapabilityRegistry,
) -> Result<()> {
    let config = Config::discover(config_path)?;
    super::apply_umask(&config);
    for warning in &config.warnings {
        eprintln!("Warning: {warning}");
    }

    let log = LogSink::open(
        "experiment",
        &config.logging.root_dir.join(&config.logging.firewheel_log),
        Level::parse(&config.logging.level),
    )?;

    let options = ExperimentOptions {
        seeds: args.seeds.clone(),
        repositories: args.repositories.clone(),
        dry_run: args.dry_run,
    };
    let summary = launch_experiment(&config, plugins, capabilities, &options, &log)?;

    println!("Resolved plan ({} components):", summary.plan.len());
    for name in &summary.plan {
        println!("  {name}");
    }
    for report in &summary.reports {
        let status = if report.errors { "errors" } else { "ok" };
        println!(
            "  {:<30} {status} ({:.2}s)",
            report.model_component, report.seconds
        );
    }
    if args.dry_run {
        println!("Dry run complete; nothing was published.");
    } else {
        println!("Published schedules for {} VM(s).", summary.vms.len());
    }
    Ok(())
}
