use std::process::ExitCode;

use crate::Error;

pub fn exit_code(err: &Error) -> ExitCode {
    match err {
        Error::AlreadyInitialized { .. } => ExitCode::from(73),
        Error::CreateDir { .. } => ExitCode::from(73),
        Error::WriteConfig { .. } => ExitCode::from(74),
        Error::ReadConfig { .. } => ExitCode::from(74),
        Error::ParseConfig { .. } => ExitCode::from(65),
        Error::InvalidConfig { .. } => ExitCode::from(65),
        Error::ExplicitConfigMissing { .. } => ExitCode::from(66),
        Error::ConfigDiscoveryFailed { .. } => ExitCode::from(66),
        Error::WorkingDirectoryUnavailable { .. } => ExitCode::from(70),
        Error::NotFound { .. } => ExitCode::from(66),
        Error::MissingResource { .. } => ExitCode::from(66),
        Error::MalformedManifest { .. } => ExitCode::from(65),
        Error::DuplicateComponentName { .. } => ExitCode::from(65),
        Error::DependencyCycle { .. }
        | Error::NoDefaultProvider { .. }
        | Error::InvalidDefaultProvider { .. }
        | Error::InfiniteLoop => ExitCode::from(65),
        Error::DecoratorConflict { .. }
        | Error::AlreadyDecorated { .. }
        | Error::NoSuchVertex { .. }
        | Error::ModelComponentImport { .. } => ExitCode::from(70),
        Error::Decompress { .. } | Error::Inconsistent { .. } => ExitCode::from(70),
        Error::Transport { .. } | Error::Timeout { .. } => ExitCode::from(70),
        Error::OutOfRange { .. } | Error::Internal { .. } => ExitCode::from(70),
        Error::SupervisorFailed { .. } => ExitCode::from(1),
        Error::PreflightFailed { .. } => ExitCode::from(70),
        Error::LogReadFailed { .. } => ExitCode::from(74),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn exit_code_matches_expected_values() {
        assert_eq!(
            exit_code(&Error::AlreadyInitialized {
                path: "config".into()
            }),
            ExitCode::from(73)
        );
        assert_eq!(
            exit_code(&Error::ConfigDiscoveryFailed {
                search_root: "root".into()
            }),
            ExitCode::from(66)
        );
        assert_eq!(
            exit_code(&Error::DependencyCycle {
                listing: "a ► b ► a".into()
            }),
            ExitCode::from(65)
        );
        assert_eq!(
            exit_code(&Error::SupervisorFailed {
                vm: "vm-0".into(),
                message: "preload failed".into()
            }),
            ExitCode::from(1)
        );
        assert_eq!(
            exit_code(&Error::LogReadFailed {
                path: "log".into(),
                source: io::Error::new(io::ErrorKind::Other, "err")
            }),
            ExitCode::from(74)
        );
    }
}
