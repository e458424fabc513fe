use std::path::Path;

use crate::cli::StatusArgs;
use crate::config::Config;
use crate::core::coordination::CoordinationClient;
use crate::error::Result;

pub fn handle_status(args: StatusArgs, config_path: Option<&Path>) -> Result<()> {
    let config = Config::discover(config_path)?;

    let client = CoordinationClient::connect(
        &config.grpc.hostname,
        config.grpc.port,
        &config.grpc.db,
    )?;
    let (version, uptime, experiment_running) = client.get_info()?;
    let not_ready = client.count_vm_mappings_not_ready()?;

    println!("Coordination server {version} (up {uptime}s)");
    println!(
        "Experiment running: {}",
        if experiment_running { "yes" } else { "no" }
    );
    println!("VMs not ready: {not_ready}");

    if args.verbose {
        let mappings = client.list_vm_mappings()?;
        println!("Registered VMs: {}", mappings.len());
        for mapping in mappings {
            println!(
                "  {:<24} {:<12} time={:<8} uuid={}",
                mapping.server_name, mapping.state, mapping.current_time, mapping.server_uuid
            );
        }
    }
    Ok(())
}
