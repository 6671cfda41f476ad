//! Alias resolution for linked auxiliaries

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use hil_channel::{Channel, ProxyLink};
use tracing::debug;

/// An auxiliary that can be attached to a dispatch engine
pub trait LinkedAuxiliary: Send + Sync {
    fn alias(&self) -> &str;

    /// Whether this auxiliary may be multiplexed
    fn is_proxy_capable(&self) -> bool;

    /// The channel this auxiliary talks through
    fn channel(&self) -> Arc<Channel>;

    /// Engine-side queues of the auxiliary's virtual channel, if it has one
    fn proxy_link(&self) -> Option<ProxyLink>;
}

/// Maps configuration aliases to live auxiliaries
pub trait AliasResolver {
    fn resolve(&self, alias: &str) -> Option<Arc<dyn LinkedAuxiliary>>;
}

/// In-memory alias registry
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Arc<dyn LinkedAuxiliary>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("aliases", &self.aliases())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `aux` under its alias, replacing any previous entry
    pub fn register(&self, aux: Arc<dyn LinkedAuxiliary>) {
        let alias = aux.alias().to_string();
        debug!(%alias, "auxiliary registered");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alias, aux);
    }

    pub fn unregister(&self, alias: &str) -> Option<Arc<dyn LinkedAuxiliary>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(alias)
    }

    /// Registered aliases, sorted
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        aliases.sort();
        aliases
    }
}

impl AliasResolver for Registry {
    fn resolve(&self, alias: &str) -> Option<Arc<dyn LinkedAuxiliary>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(alias)
            .cloned()
    }
}
