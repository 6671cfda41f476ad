//! Error types for the dispatch layer and its configuration

use hil_channel::ChannelError;
use thiserror::Error;

/// Errors raised while building or running auxiliaries
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A linked auxiliary does not declare the proxy capability
    #[error("auxiliary {alias} is not proxy-capable")]
    NotProxyCapable {
        /// Alias of the offending auxiliary
        alias: String,
    },

    /// A proxy-capable auxiliary exposes no virtual channel queues
    #[error("auxiliary {alias} is proxy-capable but has no proxy link")]
    MissingProxyLink {
        /// Alias of the offending auxiliary
        alias: String,
    },

    /// A configured connector name is not defined
    #[error("unknown connector: {0}")]
    UnknownConnector(String),

    /// The traffic trace file could not be created
    #[error("cannot create trace file {}: {source}", .path.display())]
    TraceFile {
        /// Requested trace file
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration entry missing or of the wrong kind
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Channel operation failed
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Errors raised while loading a harness configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration is not valid JSON for the expected schema
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// An `ENV{NAME}` placeholder names an unset variable
    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    /// No auxiliary with this name is configured
    #[error("unknown auxiliary: {0}")]
    UnknownAuxiliary(String),

    /// The auxiliary exists but has a different kind
    #[error("auxiliary {name} is not a {expected} auxiliary")]
    WrongKind {
        /// Auxiliary name
        name: String,
        /// Kind that was asked for
        expected: &'static str,
    },
}
