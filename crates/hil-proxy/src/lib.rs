//! HIL Proxy Dispatch
//!
//! This crate lets several independent test auxiliaries share one physical
//! channel. Each linked auxiliary talks through its own
//! [`VirtualChannel`](hil_channel::VirtualChannel) and perceives a private,
//! ordered, bidirectional stream.
//!
//! # Architecture
//!
//! - [`AuxiliaryWorker`] runs any [`Auxiliary`] on a dedicated tokio task,
//!   driven by typed [`AuxCommand`]s and stopped through a [`StopSignal`]
//! - [`DispatchEngine`] is the auxiliary owning the physical channel: it
//!   fans received frames out to every linked channel and writes queued
//!   commands, echoing each one to the other linked channels
//! - [`Registry`] resolves configuration aliases to [`LinkedAuxiliary`]
//!   instances
//! - [`HarnessConfig`] builds connectors, auxiliaries and engines from JSON
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hil_proxy::{AuxiliaryWorker, HarnessConfig, Registry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! hil_proxy::init_logging();
//! let config = HarnessConfig::load("harness.json")?;
//!
//! let registry = Registry::new();
//! let aux_a = config.build_communication("aux_a")?;
//! registry.register(Arc::new(aux_a.clone()));
//!
//! let engine = config.build_engine("proxy_aux", &registry)?;
//! let proxy = AuxiliaryWorker::spawn(engine);
//! let aux = AuxiliaryWorker::spawn(aux_a.clone());
//! proxy.create_instance().await;
//! aux.create_instance().await;
//!
//! aux_a.send_message(&[0x01, 0x02], None).await?;
//!
//! aux.stop().await;
//! proxy.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod communication;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod registry;

pub use communication::CommunicationAuxiliary;
pub use config::{
    AuxiliaryConfig, BuiltConnector, CommunicationAuxiliaryConfig, ConnectorConfig,
    HarnessConfig, ProxyAuxiliaryConfig,
};
pub use engine::{DispatchEngine, EngineConfig, LinkedChannel, TRACE_TARGET};
pub use error::{ConfigError, ProxyError};
pub use lifecycle::{AuxCommand, AuxState, Auxiliary, AuxiliaryWorker, StopSignal, DEFAULT_COMMAND_WAIT};
pub use logging::{init_logging, trace_file_dispatch};
pub use registry::{AliasResolver, LinkedAuxiliary, Registry};
