use std::path::Path;

use crate::cli::SyncArgs;
use crate::config::Config;
use crate::core::logs::{Level, LogSink};
use crate::core::store::FileStore;
use crate::error::Result;

/// Re-broadcast every locally cached artifact so peer caches converge after
/// a host joins or recovers.
pub fn handle_sync(_args: SyncArgs, config_path: Option<&Path>) -> Result<()> {
    let config = Config::discover(config_path)?;
    super::apply_umask(&config);

    let log = LogSink::open(
        "sync",
        &config.logging.root_dir.join(&config.logging.cli_log),
        Level::parse(&config.logging.level),
    )?;

    let mut pushed = 0usize;
    for store in [
        FileStore::images(&config, log.clone())?,
        FileStore::vm_resources(&config, log.clone())?,
    ] {
        let entries = store.list("")?;
        for entry in entries.iter().filter(|entry| entry.host == "local") {
            store.broadcast(&entry.name)?;
            pushed += 1;
        }
    }
    println!("Broadcast {pushed} artifact(s) to the cluster.");
    Ok(())
}
