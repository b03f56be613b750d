use std::collections::HashMap;
use std::sync::Arc;

use crate::{Scheme, Transport, TransportError};

/// Binds endpoint schemes to transports.
///
/// The SPI itself never interprets schemes; the application builds a registry
/// with the adapters it links and the RPC core resolves dial/bind through it.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<Scheme, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a scheme to a transport, replacing any previous binding.
    pub fn register(mut self, scheme: Scheme, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(scheme, transport);
        self
    }

    /// The transport bound to a scheme, or `INVALID_ARGUMENT`.
    pub fn get(&self, scheme: Scheme) -> Result<Arc<dyn Transport>, TransportError> {
        self.transports.get(&scheme).cloned().ok_or_else(|| {
            TransportError::invalid_argument(format!("no transport registered for scheme {scheme}"))
        })
    }

    pub fn schemes(&self) -> impl Iterator<Item = Scheme> + '_ {
        self.transports.keys().copied()
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("schemes", &self.transports.keys().collect::<Vec<_>>())
            .finish()
    }
}
