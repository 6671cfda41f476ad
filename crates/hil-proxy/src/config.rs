//! Harness configuration
//!
//! A JSON document names the connectors (physical or virtual channels) and
//! the auxiliaries using them:
//!
//! ```json
//! {
//!   "connectors": {
//!     "uart": { "type": "serial", "port": "ENV{HIL_PORT}", "baud_rate": 115200 },
//!     "proxy_a": { "type": "proxy" },
//!     "proxy_b": { "type": "proxy" }
//!   },
//!   "auxiliaries": {
//!     "proxy_aux": { "type": "proxy", "connector": "uart", "aux_list": ["aux_a", "aux_b"] },
//!     "aux_a": { "type": "communication", "connector": "proxy_a" },
//!     "aux_b": { "type": "communication", "connector": "proxy_b" }
//!   }
//! }
//! ```
//!
//! A proxy auxiliary with `"trace": true` logs every frame and command; with
//! `trace_dir` and/or `trace_name` set it also writes them to a trace file
//! (`<trace_dir or .>/<trace_name or proxy_trace.log>`). A serial connector
//! with a `log_port` captures the target's log output while it is open.
//!
//! Any string value containing `ENV{NAME}` is replaced by the value of the
//! environment variable `NAME`, cast to an integer (decimal or `0x` hex) or
//! a boolean when it looks like one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hil_channel::{
    Channel, LogCapture, SerialConfig, SerialLogSource, SerialTransport, VirtualChannel,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::communication::CommunicationAuxiliary;
use crate::engine::{DispatchEngine, EngineConfig};
use crate::error::{ConfigError, ProxyError};
use crate::registry::AliasResolver;

fn default_receive_timeout_ms() -> u64 {
    10
}

fn default_command_poll_ms() -> u64 {
    10
}

/// Trace file name used when only `trace_dir` is configured
pub const DEFAULT_TRACE_NAME: &str = "proxy_trace.log";

/// A named channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorConfig {
    /// Serial port
    Serial(SerialConfig),
    /// Virtual channel for a proxied auxiliary
    Proxy,
}

/// Dispatch engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAuxiliaryConfig {
    /// Connector used as the physical channel
    pub connector: String,
    /// Aliases of the auxiliaries to link, in link order
    #[serde(default)]
    pub aux_list: Vec<String>,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_command_poll_ms")]
    pub command_poll_ms: u64,
    /// Log every frame and command
    #[serde(default)]
    pub trace: bool,
    /// Directory of the trace file
    #[serde(default)]
    pub trace_dir: Option<PathBuf>,
    /// File name of the trace file
    #[serde(default)]
    pub trace_name: Option<String>,
}

impl ProxyAuxiliaryConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            command_poll: Duration::from_millis(self.command_poll_ms),
            trace: self.trace,
            trace_file: self.trace_file(),
        }
    }

    /// Trace file path, when tracing to a file is configured
    pub fn trace_file(&self) -> Option<PathBuf> {
        if !self.trace || (self.trace_dir.is_none() && self.trace_name.is_none()) {
            return None;
        }
        let dir = self.trace_dir.clone().unwrap_or_else(|| PathBuf::from("."));
        Some(dir.join(self.trace_name.as_deref().unwrap_or(DEFAULT_TRACE_NAME)))
    }
}

/// Raw message auxiliary settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicationAuxiliaryConfig {
    pub connector: String,
}

/// A named auxiliary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuxiliaryConfig {
    Proxy(ProxyAuxiliaryConfig),
    Communication(CommunicationAuxiliaryConfig),
}

/// A channel built from a [`ConnectorConfig`]
#[derive(Debug, Clone)]
pub enum BuiltConnector {
    Physical(Arc<Channel>),
    Virtual(VirtualChannel),
}

impl BuiltConnector {
    /// The guarded channel, whatever its kind
    pub fn channel(&self) -> Arc<Channel> {
        match self {
            BuiltConnector::Physical(channel) => Arc::clone(channel),
            BuiltConnector::Virtual(virtual_channel) => Arc::clone(virtual_channel.channel()),
        }
    }
}

/// Whole harness configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub connectors: BTreeMap<String, ConnectorConfig>,
    #[serde(default)]
    pub auxiliaries: BTreeMap<String, AuxiliaryConfig>,
}

impl HarnessConfig {
    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "loading harness configuration");
        Self::from_json_str(&text)
    }

    /// Parse a configuration document, resolving `ENV{NAME}` placeholders
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Self::from_json_str_with(text, |name| std::env::var(name).ok())
    }

    /// Parse a configuration document with a custom variable lookup
    pub fn from_json_str_with(
        text: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut value: Value = serde_json::from_str(text)?;
        substitute_env(&mut value, &lookup)?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn proxy_auxiliary(&self, name: &str) -> Result<&ProxyAuxiliaryConfig, ConfigError> {
        match self.auxiliary(name)? {
            AuxiliaryConfig::Proxy(config) => Ok(config),
            _ => Err(ConfigError::WrongKind {
                name: name.to_string(),
                expected: "proxy",
            }),
        }
    }

    pub fn communication_auxiliary(
        &self,
        name: &str,
    ) -> Result<&CommunicationAuxiliaryConfig, ConfigError> {
        match self.auxiliary(name)? {
            AuxiliaryConfig::Communication(config) => Ok(config),
            _ => Err(ConfigError::WrongKind {
                name: name.to_string(),
                expected: "communication",
            }),
        }
    }

    /// Build the channel of connector `name`
    ///
    /// Every call builds a fresh, closed channel.
    pub fn build_connector(&self, name: &str) -> Result<BuiltConnector, ProxyError> {
        let config = self
            .connectors
            .get(name)
            .ok_or_else(|| ProxyError::UnknownConnector(name.to_string()))?;
        Ok(match config {
            ConnectorConfig::Serial(serial) => {
                let transport = SerialTransport::new(serial.clone());
                let channel = match &serial.log_port {
                    Some(log_port) => Channel::new(
                        name,
                        LogCapture::new(
                            name,
                            transport,
                            SerialLogSource::new(log_port.clone(), serial.baud_rate),
                        ),
                    ),
                    None => Channel::new(name, transport),
                };
                BuiltConnector::Physical(Arc::new(channel))
            }
            ConnectorConfig::Proxy => BuiltConnector::Virtual(VirtualChannel::new(name)),
        })
    }

    /// Build communication auxiliary `name` over its connector
    pub fn build_communication(&self, name: &str) -> Result<CommunicationAuxiliary, ProxyError> {
        let config = self.communication_auxiliary(name)?;
        Ok(match self.build_connector(&config.connector)? {
            BuiltConnector::Physical(channel) => CommunicationAuxiliary::new(name, channel),
            BuiltConnector::Virtual(channel) => {
                CommunicationAuxiliary::over_virtual(name, &channel)
            }
        })
    }

    /// Build dispatch engine `name`, resolving its linked auxiliaries
    pub fn build_engine(
        &self,
        name: &str,
        resolver: &dyn AliasResolver,
    ) -> Result<DispatchEngine, ProxyError> {
        let config = self.proxy_auxiliary(name)?;
        let physical = self.build_connector(&config.connector)?.channel();
        DispatchEngine::from_config(name, config, physical, resolver)
    }

    fn auxiliary(&self, name: &str) -> Result<&AuxiliaryConfig, ConfigError> {
        self.auxiliaries
            .get(name)
            .ok_or_else(|| ConfigError::UnknownAuxiliary(name.to_string()))
    }
}

/// Name of the first `ENV{NAME}` placeholder in `s`
fn env_placeholder(s: &str) -> Option<&str> {
    let start = s.find("ENV{")? + 4;
    let len = s[start..].find('}')?;
    let name = &s[start..start + len];
    let valid = !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    valid.then_some(name)
}

/// Cast an environment value the way a YAML scalar would read
fn cast_env_value(raw: String) -> Value {
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(n) = raw.parse::<u64>() {
            return Value::from(n);
        }
    }
    if let Some(hex) = raw.strip_prefix("0x") {
        if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            if let Ok(n) = u64::from_str_radix(hex, 16) {
                return Value::from(n);
            }
        }
    }
    match raw.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw),
    }
}

fn substitute_env(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            if let Some(name) = env_placeholder(s) {
                let raw = lookup(name).ok_or_else(|| ConfigError::MissingEnv(name.to_string()))?;
                debug!("replaced environment variable {name}");
                *value = cast_env_value(raw);
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_env(item, lookup)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute_env(item, lookup)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    const CONFIG: &str = r#"{
        "connectors": {
            "uart": { "type": "serial", "port": "ENV{HIL_PORT}", "baud_rate": 9600 },
            "proxy_a": { "type": "proxy" },
            "proxy_b": { "type": "proxy" }
        },
        "auxiliaries": {
            "proxy_aux": {
                "type": "proxy",
                "connector": "uart",
                "aux_list": ["aux_a", "aux_b"],
                "trace": "ENV{HIL_TRACE}"
            },
            "aux_a": { "type": "communication", "connector": "proxy_a" },
            "aux_b": { "type": "communication", "connector": "proxy_b" }
        }
    }"#;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "HIL_PORT" => Some("/dev/ttyUSB3".into()),
            "HIL_TRACE" => Some("True".into()),
            "HIL_BAUD" => Some("115200".into()),
            "HIL_ID" => Some("0x7E0".into()),
            "HIL_SIGNED" => Some("0x+1F".into()),
            "HIL_BARE" => Some("0x".into()),
            _ => None,
        }
    }

    #[test]
    fn test_parse_with_env_substitution() {
        let config = HarnessConfig::from_json_str_with(CONFIG, lookup).unwrap();

        assert_eq!(
            config.connectors["uart"],
            ConnectorConfig::Serial(SerialConfig {
                port: "/dev/ttyUSB3".into(),
                baud_rate: 9600,
                layout: None,
                log_port: None,
            })
        );
        let proxy = config.proxy_auxiliary("proxy_aux").unwrap();
        assert_eq!(proxy.aux_list, vec!["aux_a", "aux_b"]);
        assert!(proxy.trace);
        assert_eq!(proxy.engine_config().receive_timeout, Duration::from_millis(10));
    }

    #[test]
    fn test_env_values_are_cast() {
        let mut value = serde_json::json!({
            "baud": "ENV{HIL_BAUD}",
            "ids": ["ENV{HIL_ID}"],
            "port": "ENV{HIL_PORT}",
            "plain": "no placeholder"
        });
        substitute_env(&mut value, &lookup).unwrap();

        assert_eq!(value["baud"], 115_200);
        assert_eq!(value["ids"][0], 0x7E0);
        assert_eq!(value["port"], "/dev/ttyUSB3");
        assert_eq!(value["plain"], "no placeholder");
    }

    #[test]
    fn test_malformed_hex_stays_a_string() {
        let mut value = serde_json::json!({
            "signed": "ENV{HIL_SIGNED}",
            "bare": "ENV{HIL_BARE}",
        });
        substitute_env(&mut value, &lookup).unwrap();

        assert_eq!(value["signed"], "0x+1F");
        assert_eq!(value["bare"], "0x");
    }

    #[test]
    fn test_trace_file_path() {
        let mut proxy: ProxyAuxiliaryConfig =
            serde_json::from_str(r#"{"connector": "uart", "trace": true}"#).unwrap();
        assert_eq!(proxy.trace_file(), None);

        proxy.trace_name = Some("mysuperlog".into());
        assert_eq!(proxy.trace_file(), Some(PathBuf::from("./mysuperlog")));

        proxy.trace_dir = Some(PathBuf::from("/tmp/hil"));
        proxy.trace_name = None;
        assert_eq!(
            proxy.engine_config().trace_file,
            Some(PathBuf::from("/tmp/hil").join(DEFAULT_TRACE_NAME))
        );

        proxy.trace = false;
        assert_eq!(proxy.trace_file(), None);
    }

    #[test]
    fn test_build_engine_writes_trace_file() {
        let dir = tempfile::tempdir().unwrap();
        let text = CONFIG.replace(
            r#""trace": "ENV{HIL_TRACE}""#,
            &format!(
                r#""trace": true, "trace_dir": {}, "trace_name": "proxy.log""#,
                serde_json::to_string(dir.path()).unwrap()
            ),
        );
        let config = HarnessConfig::from_json_str_with(&text, lookup).unwrap();
        let registry = Registry::new();

        let engine = config.build_engine("proxy_aux", &registry).unwrap();
        assert_eq!(engine.config().trace_file, Some(dir.path().join("proxy.log")));
        assert!(dir.path().join("proxy.log").exists());
    }

    #[test]
    fn test_serial_log_port_is_parsed() {
        let config = HarnessConfig::from_json_str_with(
            r#"{"connectors": {"uart": {"type": "serial", "port": "/dev/ttyUSB0", "log_port": "/dev/ttyUSB1"}}}"#,
            lookup,
        )
        .unwrap();

        let ConnectorConfig::Serial(serial) = &config.connectors["uart"] else {
            panic!("expected a serial connector");
        };
        assert_eq!(serial.log_port.as_deref(), Some("/dev/ttyUSB1"));
        assert!(!config.build_connector("uart").unwrap().channel().is_open());
    }

    #[test]
    fn test_missing_env_is_an_error() {
        let result = HarnessConfig::from_json_str_with(r#"{"connectors": {"uart": {"type": "serial", "port": "ENV{NOPE}"}}}"#, lookup);
        assert!(matches!(result, Err(ConfigError::MissingEnv(name)) if name == "NOPE"));
    }

    #[test]
    fn test_auxiliary_lookup_errors() {
        let config = HarnessConfig::from_json_str_with(CONFIG, lookup).unwrap();

        assert!(matches!(
            config.proxy_auxiliary("aux_a"),
            Err(ConfigError::WrongKind { expected: "proxy", .. })
        ));
        assert!(matches!(
            config.communication_auxiliary("ghost"),
            Err(ConfigError::UnknownAuxiliary(_))
        ));
        assert!(matches!(
            config.build_connector("ghost"),
            Err(ProxyError::UnknownConnector(_))
        ));
    }

    #[test]
    fn test_build_engine_links_configured_auxiliaries() {
        let config = HarnessConfig::from_json_str_with(CONFIG, lookup).unwrap();
        let registry = Registry::new();
        for name in ["aux_a", "aux_b"] {
            registry.register(Arc::new(config.build_communication(name).unwrap()));
        }

        let engine = config.build_engine("proxy_aux", &registry).unwrap();
        let aliases: Vec<&str> = engine.linked().iter().map(|l| l.alias()).collect();
        assert_eq!(aliases, vec!["aux_a", "aux_b"]);
        assert!(engine.config().trace);
        assert!(!engine.physical().is_open());
    }
}
