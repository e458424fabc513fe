pub mod error;
pub mod experiment;
pub mod handler;
pub mod init;
pub mod server;
pub mod status;
pub mod sync;

pub use experiment::handle_experiment;
pub use handler::handle_handler;
pub use init::handle_init;
pub use server::handle_server;
pub use status::handle_status;
pub use sync::handle_sync;

use crate::config::Config;

/// Apply the configured umask before any files are created.
pub(crate) fn apply_umask(config: &Config) {
    unsafe {
        libc::umask(config.system.umask as libc::mode_t);
    }
}
