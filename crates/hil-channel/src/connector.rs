//! Connector lifecycle
//!
//! A [`Connector`] is anything that must be opened before use and closed
//! afterwards. [`ConnectorScope`] ties that pair to a lexical scope: the
//! connector is opened on entry and released when the scope is closed or
//! dropped.

use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ChannelError;

/// Open/close lifecycle shared by every connector
#[async_trait]
pub trait Connector: Send + Sync {
    /// Alias used in logs
    fn name(&self) -> &str;

    /// Initialise the connector
    async fn open(&self) -> Result<(), ChannelError>;

    /// Close the connector, freeing its resources
    async fn close(&self) -> Result<(), ChannelError>;
}

/// An open connector that is closed again when the scope ends
///
/// Prefer [`ConnectorScope::close`], which reports the close result. If the
/// scope is dropped instead, the close is spawned onto the current tokio
/// runtime and its outcome is only logged.
pub struct ConnectorScope<C: Connector + 'static> {
    connector: Arc<C>,
    armed: bool,
}

impl<C: Connector + 'static> ConnectorScope<C> {
    /// Open `connector` and bind it to a new scope
    ///
    /// If the open fails no scope is created, so nothing will close the
    /// connector on the caller's behalf.
    pub async fn enter(connector: Arc<C>) -> Result<Self, ChannelError> {
        connector.open().await?;
        debug!(connector = connector.name(), "entered connector scope");
        Ok(Self {
            connector,
            armed: true,
        })
    }

    /// Close the connector and end the scope
    pub async fn close(mut self) -> Result<(), ChannelError> {
        self.armed = false;
        self.connector.close().await
    }
}

impl<C: Connector + 'static> Deref for ConnectorScope<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.connector
    }
}

impl<C: Connector + 'static> Drop for ConnectorScope<C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let connector = Arc::clone(&self.connector);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = connector.close().await {
                        warn!(connector = connector.name(), "close on scope exit failed: {}", e);
                    }
                });
            }
            Err(_) => {
                warn!(
                    connector = connector.name(),
                    "connector scope dropped outside a runtime; connector left open"
                );
            }
        }
    }
}
