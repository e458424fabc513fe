use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Environment variable that overrides configuration discovery.
pub const CONFIG_ENV_VAR: &str = "FIREWHEEL_CONFIG";

/// Default configuration file name searched for during discovery.
pub const CONFIG_FILE_NAME: &str = "firewheel.toml";

pub const DEFAULT_GRPC_PORT: u16 = 50051;

/// Recognized textual logging levels, ordered least to most severe.
pub const LOG_LEVELS: [&str; 5] = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];

/// Validated firewheel configuration.
///
/// Loaded once at process start, normalized, and passed explicitly into each
/// subsystem constructor. Subsystems never re-read the file during a run.
#[derive(Debug, Clone)]
pub struct Config {
    pub file_path: PathBuf,
    pub logging: LoggingConfig,
    pub system: SystemConfig,
    pub cluster: ClusterConfig,
    pub minimega: MinimegaConfig,
    pub grpc: GrpcConfig,
    pub ssh: SshConfig,
    pub vm_resource_manager: VmResourceManagerConfig,
    /// Mapping from attribute name to the default providing component.
    pub attribute_defaults: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Normalized level: one of `LOG_LEVELS`.
    pub level: String,
    pub root_dir: PathBuf,
    pub vmr_log_dir: PathBuf,
    pub firewheel_log: String,
    pub cli_log: String,
}

impl LoggingConfig {
    /// Directory holding per-VM supervisor logs.
    pub fn vmr_log_path(&self) -> PathBuf {
        self.root_dir.join(&self.vmr_log_dir)
    }

    pub fn debug_enabled(&self) -> bool {
        self.level == "DEBUG"
    }
}

#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub umask: u32,
    pub default_group: Option<String>,
    pub default_output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub control: Vec<String>,
    pub compute: Vec<String>,
}

impl ClusterConfig {
    /// All distinct cluster nodes (control first, then compute).
    pub fn all_nodes(&self) -> Vec<String> {
        let mut nodes = self.control.clone();
        for host in &self.compute {
            if !nodes.contains(host) {
                nodes.push(host.clone());
            }
        }
        nodes
    }

    pub fn head_node(&self) -> Option<&str> {
        self.control.first().map(String::as_str)
    }

    pub fn group(&self, name: &str) -> Option<&[String]> {
        match name {
            "control" => Some(&self.control),
            "compute" => Some(&self.compute),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MinimegaConfig {
    pub base_dir: PathBuf,
    pub files_dir: PathBuf,
    pub install_dir: PathBuf,
    /// Synced to the distinct cluster node count on load.
    pub degree: usize,
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub struct GrpcConfig {
    pub hostname: String,
    pub port: u16,
    pub db: String,
    pub threads: usize,
    pub root_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl GrpcConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.root_dir.join(&self.cache_dir)
    }
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub user: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VmResourceManagerConfig {
    pub default_state: String,
    /// Terminate guest-to-host reads on two identical consecutive chunks
    /// (QGA misses EOF on Windows guests).
    pub windows_eof_heuristic: bool,
}

impl Config {
    /// Load and validate the configuration at `path`.
    pub fn load(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;

        let raw: RawConfig = toml::from_str(&contents).map_err(|source| Error::ParseConfig {
            path: path.to_path_buf(),
            source,
        })?;

        raw.into_validated(path)
    }

    /// Resolve the configuration path: an explicit `--config` value, the
    /// `FIREWHEEL_CONFIG` environment variable, or upward discovery of
    /// `firewheel.toml` from the working directory.
    pub fn discover(explicit: Option<&Path>) -> Result<Config> {
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(Error::ExplicitConfigMissing {
                    path: path.to_path_buf(),
                });
            }
            return Config::load(path);
        }

        if let Ok(env_path) = env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(env_path);
            if !path.is_file() {
                return Err(Error::ExplicitConfigMissing { path });
            }
            return Config::load(&path);
        }

        let cwd = env::current_dir().map_err(|source| Error::WorkingDirectoryUnavailable {
            source,
        })?;
        let mut dir = cwd.as_path();
        loop {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                return Config::load(&candidate);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => return Err(Error::ConfigDiscoveryFailed { search_root: cwd }),
            }
        }
    }

    /// Render a starter configuration for `firewheel init`.
    pub fn template(hostname: &str) -> String {
        format!(
            "[logging]\n\
             level = \"INFO\"\n\
             root_dir = \"/tmp/firewheel\"\n\
             vmr_log_dir = \"vm_resource_logs\"\n\
             firewheel_log = \"firewheel.log\"\n\
             cli_log = \"cli.log\"\n\
             \n\
             [system]\n\
             umask = \"0o22\"\n\
             default_output_dir = \"/tmp/firewheel/output\"\n\
             \n\
             [cluster]\n\
             control = [\"{hostname}\"]\n\
             compute = [\"{hostname}\"]\n\
             \n\
             [minimega]\n\
             base_dir = \"/tmp/minimega\"\n\
             files_dir = \"/tmp/minimega/files\"\n\
             install_dir = \"/opt/minimega\"\n\
             namespace = \"firewheel\"\n\
             \n\
             [grpc]\n\
             hostname = \"{hostname}\"\n\
             port = {DEFAULT_GRPC_PORT}\n\
             db = \"prod\"\n\
             threads = 2\n\
             root_dir = \"/tmp/firewheel\"\n\
             cache_dir = \"grpc_cache\"\n\
             \n\
             [ssh]\n\
             \n\
             [vm_resource_manager]\n\
             default_state = \"uninitialized\"\n\
             \n\
             [attribute_defaults]\n"
        )
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    logging: RawLogging,
    #[serde(default)]
    system: RawSystem,
    #[serde(default)]
    cluster: RawCluster,
    #[serde(default)]
    minimega: RawMinimega,
    #[serde(default)]
    grpc: RawGrpc,
    #[serde(default)]
    ssh: RawSsh,
    #[serde(default)]
    vm_resource_manager: RawVmResourceManager,
    #[serde(default)]
    attribute_defaults: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLogging {
    level: Option<toml::Value>,
    root_dir: Option<PathBuf>,
    vmr_log_dir: Option<PathBuf>,
    firewheel_log: Option<String>,
    cli_log: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSystem {
    umask: Option<toml::Value>,
    default_group: Option<String>,
    default_output_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCluster {
    #[serde(default)]
    control: Vec<String>,
    #[serde(default)]
    compute: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMinimega {
    base_dir: Option<PathBuf>,
    files_dir: Option<PathBuf>,
    install_dir: Option<PathBuf>,
    degree: Option<usize>,
    namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGrpc {
    hostname: Option<String>,
    port: Option<u16>,
    db: Option<String>,
    threads: Option<usize>,
    root_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSsh {
    user: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawVmResourceManager {
    default_state: Option<String>,
    windows_eof_heuristic: Option<bool>,
}

impl RawConfig {
    fn into_validated(self, path: &Path) -> Result<Config> {
        let mut warnings = Vec::new();

        let level = normalize_log_level(self.logging.level, path, &mut warnings)?;
        let logging = LoggingConfig {
            level,
            root_dir: self
                .logging
                .root_dir
                .unwrap_or_else(|| PathBuf::from("/tmp/firewheel")),
            vmr_log_dir: self
                .logging
                .vmr_log_dir
                .unwrap_or_else(|| PathBuf::from("vm_resource_logs")),
            firewheel_log: self
                .logging
                .firewheel_log
                .unwrap_or_else(|| "firewheel.log".to_string()),
            cli_log: self.logging.cli_log.unwrap_or_else(|| "cli.log".to_string()),
        };

        let umask = parse_umask(self.system.umask, path)?;
        let system = SystemConfig {
            umask,
            default_group: self.system.default_group,
            default_output_dir: self
                .system
                .default_output_dir
                .unwrap_or_else(|| logging.root_dir.join("output")),
        };

        let cluster = ClusterConfig {
            control: self.cluster.control,
            compute: self.cluster.compute,
        };
        if cluster.control.len() != 1 {
            warnings.push(format!(
                "Expected exactly one control node; found {}. Cluster operations \
                 will use the first entry.",
                cluster.control.len()
            ));
        }

        let node_count = cluster.all_nodes().len().max(1);
        if let Some(declared) = self.minimega.degree {
            if declared != node_count {
                warnings.push(format!(
                    "minimega.degree was {declared} but the cluster has {node_count} \
                     node(s); corrected."
                ));
            }
        }
        let minimega = MinimegaConfig {
            base_dir: self
                .minimega
                .base_dir
                .unwrap_or_else(|| PathBuf::from("/tmp/minimega")),
            files_dir: self
                .minimega
                .files_dir
                .unwrap_or_else(|| PathBuf::from("/tmp/minimega/files")),
            install_dir: self
                .minimega
                .install_dir
                .unwrap_or_else(|| PathBuf::from("/opt/minimega")),
            degree: node_count,
            namespace: self
                .minimega
                .namespace
                .unwrap_or_else(|| "firewheel".to_string()),
        };

        let grpc = GrpcConfig {
            hostname: self.grpc.hostname.unwrap_or_else(|| "localhost".to_string()),
            port: self.grpc.port.unwrap_or(DEFAULT_GRPC_PORT),
            db: self.grpc.db.unwrap_or_else(|| "prod".to_string()),
            threads: self.grpc.threads.unwrap_or(2),
            root_dir: self
                .grpc
                .root_dir
                .unwrap_or_else(|| logging.root_dir.clone()),
            cache_dir: self
                .grpc
                .cache_dir
                .unwrap_or_else(|| PathBuf::from("grpc_cache")),
        };
        if grpc.db != "prod" && grpc.db != "test" {
            return Err(Error::InvalidConfig {
                path: path.to_path_buf(),
                message: format!(
                    "grpc.db must be `prod` or `test`, got `{}`.",
                    grpc.db
                ),
            });
        }

        let vm_resource_manager = VmResourceManagerConfig {
            default_state: self
                .vm_resource_manager
                .default_state
                .unwrap_or_else(|| "uninitialized".to_string()),
            windows_eof_heuristic: self
                .vm_resource_manager
                .windows_eof_heuristic
                .unwrap_or(true),
        };

        Ok(Config {
            file_path: path.to_path_buf(),
            logging,
            system,
            cluster,
            minimega,
            grpc,
            ssh: SshConfig {
                user: self.ssh.user,
            },
            vm_resource_manager,
            attribute_defaults: self.attribute_defaults,
            warnings,
        })
    }
}

/// Normalize `logging.level` to an upper-case level name. Integers map onto
/// the nearest standard level; unknown strings are rejected.
fn normalize_log_level(
    value: Option<toml::Value>,
    path: &Path,
    warnings: &mut Vec<String>,
) -> Result<String> {
    let level = match value {
        None => {
            warnings.push("No logging.level configured; defaulting to INFO.".to_string());
            "INFO".to_string()
        }
        Some(toml::Value::Integer(n)) => match n {
            i64::MIN..=10 => "DEBUG".to_string(),
            11..=20 => "INFO".to_string(),
            21..=30 => "WARNING".to_string(),
            31..=40 => "ERROR".to_string(),
            _ => "CRITICAL".to_string(),
        },
        Some(toml::Value::String(s)) => {
            let upper = s.to_uppercase();
            if !LOG_LEVELS.contains(&upper.as_str()) {
                return Err(Error::InvalidConfig {
                    path: path.to_path_buf(),
                    message: format!(
                        "Unknown log level `{s}`. Must be an integer or one of {LOG_LEVELS:?}."
                    ),
                });
            }
            upper
        }
        Some(other) => {
            return Err(Error::InvalidConfig {
                path: path.to_path_buf(),
                message: format!("logging.level must be a string or integer, got `{other}`."),
            });
        }
    };
    Ok(level)
}

/// Accept `umask` as an integer or an octal string (`"0o22"`, `"022"`).
fn parse_umask(value: Option<toml::Value>, path: &Path) -> Result<u32> {
    match value {
        None => Ok(0o22),
        Some(toml::Value::Integer(n)) if n >= 0 => Ok(n as u32),
        Some(toml::Value::String(s)) => {
            let trimmed = s.trim().trim_start_matches("0o");
            u32::from_str_radix(trimmed, 8).map_err(|_| Error::InvalidConfig {
                path: path.to_path_buf(),
                message: format!("system.umask `{s}` is not a valid octal value."),
            })
        }
        Some(other) => Err(Error::InvalidConfig {
            path: path.to_path_buf(),
            message: format!("system.umask must be an integer or octal string, got `{other}`."),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut file = fs::File::create(&path).expect("create config");
        file.write_all(contents.as_bytes()).expect("write config");
        (dir, path)
    }

    #[test]
    fn template_round_trips() {
        let (_dir, path) = write_config(&Config::template("cluster-head"));
        let config = Config::load(&path).expect("load template");
        assert_eq!(config.logging.level, "INFO");
        assert_eq!(config.cluster.control, vec!["cluster-head".to_string()]);
        assert_eq!(config.grpc.port, DEFAULT_GRPC_PORT);
        assert_eq!(config.minimega.degree, 1);
        assert!(config.vm_resource_manager.windows_eof_heuristic);
    }

    #[test]
    fn degree_is_synced_to_node_count() {
        let (_dir, path) = write_config(
            "[cluster]\n\
             control = [\"head\"]\n\
             compute = [\"head\", \"c1\", \"c2\"]\n\
             [minimega]\n\
             degree = 9\n",
        );
        let config = Config::load(&path).expect("load");
        assert_eq!(config.minimega.degree, 3);
        assert!(
            config
                .warnings
                .iter()
                .any(|w| w.contains("minimega.degree"))
        );
    }

    #[test]
    fn numeric_and_string_log_levels_normalize() {
        let (_dir, path) = write_config("[logging]\nlevel = 10\n");
        assert_eq!(Config::load(&path).expect("load").logging.level, "DEBUG");

        let (_dir, path) = write_config("[logging]\nlevel = \"warning\"\n");
        assert_eq!(Config::load(&path).expect("load").logging.level, "WARNING");

        let (_dir, path) = write_config("[logging]\nlevel = \"chatty\"\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn umask_accepts_octal_strings() {
        let (_dir, path) = write_config("[system]\numask = \"0o27\"\n");
        assert_eq!(Config::load(&path).expect("load").system.umask, 0o27);

        let (_dir, path) = write_config("[system]\numask = 18\n");
        assert_eq!(Config::load(&path).expect("load").system.umask, 18);
    }

    #[test]
    fn multiple_control_nodes_warn() {
        let (_dir, path) = write_config("[cluster]\ncontrol = [\"a\", \"b\"]\n");
        let config = Config::load(&path).expect("load");
        assert!(config.warnings.iter().any(|w| w.contains("control node")));
        assert_eq!(config.cluster.head_node(), Some("a"));
    }

    #[test]
    fn env_override_points_discovery_at_file() {
        let (_dir, path) = write_config(&Config::template("envhost"));
        temp_env::with_var(CONFIG_ENV_VAR, Some(path.as_os_str()), || {
            let config = Config::discover(None).expect("discover via env");
            assert_eq!(config.cluster.control, vec!["envhost".to_string()]);
        });
    }

    #[test]
    fn invalid_db_rejected() {
        let (_dir, path) = write_config("[grpc]\ndb = \"staging\"\n");
        assert!(matches!(
            Config::load(&path),
            Err(Error::InvalidConfig { .. })
        ));
    }
}
