use std::path::PathBuf;

use thiserror::Error;

/// Convenient result alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Firewheel library error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "A firewheel configuration already exists at {path}. \
         Re-run with --force to overwrite the generated file."
    )]
    AlreadyInitialized { path: PathBuf },
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write configuration file at {path}: {source}")]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read configuration file at {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Configuration at {path} could not be parsed: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Configuration validation failed for {path}: {message}")]
    InvalidConfig { path: PathBuf, message: String },
    #[error("The configuration path {path} does not exist or is not readable.")]
    ExplicitConfigMissing { path: PathBuf },
    #[error(
        "No firewheel configuration found while searching upward from {search_root}. \
         Run `firewheel init` first or provide a path with --config."
    )]
    ConfigDiscoveryFailed { search_root: PathBuf },
    #[error("Failed to determine the current working directory: {source}")]
    WorkingDirectoryUnavailable {
        #[source]
        source: std::io::Error,
    },
    #[error("`{name}` was not found in the {store} store.")]
    NotFound { store: String, name: String },
    #[error("Failed to unpack `{name}`: {message}")]
    Decompress { name: String, message: String },
    #[error(
        "Broadcast of `{name}` did not converge: {message}. \
         The cluster caches may hold divergent copies."
    )]
    Inconsistent { name: String, message: String },
    #[error("Transport failure talking to {peer}: {message}")]
    Transport { peer: String, message: String },
    #[error("Timed out after {seconds}s waiting for {operation}.")]
    Timeout { operation: String, seconds: u64 },
    #[error(
        "Unsatisfiable: circular dependency relationship(s) found.\n\
         Simple cycles:\n{listing}"
    )]
    DependencyCycle { listing: String },
    #[error("{message}")]
    NoDefaultProvider { message: String },
    #[error("{message}")]
    InvalidDefaultProvider { message: String },
    #[error("Apparent infinite loop building the dependency graph.")]
    InfiniteLoop,
    #[error("Decorator conflict on `{attribute}` while applying `{capability}`.")]
    DecoratorConflict {
        capability: String,
        attribute: String,
    },
    #[error("Capability `{capability}` has already been applied to this instance.")]
    AlreadyDecorated { capability: String },
    #[error("Vertex {id} has been deleted and can no longer be used.")]
    NoSuchVertex { id: u64 },
    #[error("Failed to load model component `{component}`:\n{}", detail.join("\n"))]
    ModelComponentImport {
        component: String,
        detail: Vec<String>,
    },
    #[error("Malformed MANIFEST in model component at {path}: {message}")]
    MalformedManifest { path: PathBuf, message: String },
    #[error(
        "Model component name `{name}` appears in more than one repository \
         ({first} and {second})."
    )]
    DuplicateComponentName {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("Model component `{component}` is missing resource {path}.")]
    MissingResource { component: String, path: PathBuf },
    #[error("Coordination server rejected the request: {detail}")]
    OutOfRange { detail: String },
    #[error("Coordination server fault: {detail}")]
    Internal { detail: String },
    #[error("Failed to launch supervisor for VM `{vm}`: {message}")]
    SupervisorFailed { vm: String, message: String },
    #[error("Preflight failed: {message}")]
    PreflightFailed { message: String },
    #[error("Failed to read logs at {path}: {source}")]
    LogReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Timeout { .. })
    }
}
