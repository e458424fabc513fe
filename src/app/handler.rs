use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::HandlerArgs;
use crate::config::Config;
use crate::core::coordination::{Coordination, CoordinationClient};
use crate::core::handler::{EngineDriverFactory, Supervisor, SupervisorConfig};
use crate::core::logs::{Level, LogSink};
use crate::core::schedule_store::{ScheduleDb, ScheduleSource};
use crate::core::store::FileStore;
use crate::core::updater::load_balance_factor;
use crate::error::{Error, Result};

pub fn handle_handler(args: HandlerArgs, config_path: Option<&Path>) -> Result<()> {
    let config = Config::discover(config_path)?;
    super::apply_umask(&config);

    let vm_config = SupervisorConfig::from_json(&args.vm_config)?;
    let factor = load_balance_factor(vm_config.vcpu_commit);

    let log_dir = config.logging.vmr_log_path();
    let driver_log = LogSink::open(
        &vm_config.vm_name,
        &log_dir.join(format!("{}.log", vm_config.vm_name)),
        Level::parse(&config.logging.level),
    )?;

    let client = Arc::new(CoordinationClient::connect(
        &config.grpc.hostname,
        config.grpc.port,
        &config.grpc.db,
    )?);
    let coordination: Arc<dyn Coordination> = client.clone();
    let schedule: Arc<dyn ScheduleSource> = Arc::new(ScheduleDb::new(client));

    let store = Arc::new(FileStore::vm_resources(&config, driver_log.clone())?);
    let factory = Arc::new(EngineDriverFactory::new(
        &vm_config.engine,
        &vm_config.path,
        config.vm_resource_manager.windows_eof_heuristic,
        driver_log,
    ));

    let vm_name = vm_config.vm_name.clone();
    let supervisor = Supervisor::new(
        vm_config,
        config,
        coordination,
        schedule,
        Some(store),
        factory,
        factor,
        Duration::from_secs(args.check_interval),
    )?;

    let exit = supervisor.run()?;
    if exit != 0 {
        return Err(Error::SupervisorFailed {
            vm: vm_name,
            message: format!("supervisor exited with code {exit}"),
        });
    }
    Ok(())
}
