use std::fs;
use std::path::PathBuf;

use crate::cli::InitArgs;
use crate::config::{Config, CONFIG_FILE_NAME};
use crate::error::{Error, Result};

pub fn handle_init(args: InitArgs) -> Result<()> {
    let path = args
        .output
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    if path.exists() && !args.force {
        return Err(Error::AlreadyInitialized { path });
    }

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| Error::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let hostname = args.hostname.unwrap_or_else(|| "localhost".to_string());
    fs::write(&path, Config::template(&hostname)).map_err(|source| Error::WriteConfig {
        path: path.clone(),
        source,
    })?;

    println!("Wrote configuration to {}", path.display());
    println!("Edit the [cluster] and [minimega] sections to match your site.");
    Ok(())
}
