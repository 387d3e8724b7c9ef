//! Packet interceptors.
//!
//! Interceptors see every stanza twice per direction: before processing,
//! where they may reject it, and after processing, where they can only
//! observe it.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::PacketRejected;
use crate::session::ClientSession;
use crate::stanza::Stanza;

/// Hook run around stanza processing.
pub trait PacketInterceptor: Send + Sync {
    /// Inspect `stanza`.
    ///
    /// `session` is the local session the stanza came from (incoming) or is
    /// delivered to (outgoing). Returning `Err` before processing stops it;
    /// the result is ignored once the stanza has been processed.
    fn intercept(
        &self,
        stanza: &Stanza,
        session: Option<&Arc<ClientSession>>,
        incoming: bool,
        processed: bool,
    ) -> Result<(), PacketRejected>;
}

/// Ordered collection of interceptors owned by the server context.
#[derive(Default)]
pub struct InterceptorManager {
    interceptors: RwLock<Vec<Arc<dyn PacketInterceptor>>>,
}

impl InterceptorManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, interceptor: Arc<dyn PacketInterceptor>) {
        self.interceptors.write().push(interceptor);
    }

    /// Remove an interceptor previously added. Returns whether it was found.
    pub fn remove(&self, interceptor: &Arc<dyn PacketInterceptor>) -> bool {
        let mut interceptors = self.interceptors.write();
        let before = interceptors.len();
        interceptors.retain(|i| !Arc::ptr_eq(i, interceptor));
        interceptors.len() != before
    }

    pub fn len(&self) -> usize {
        self.interceptors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.read().is_empty()
    }

    /// Run every interceptor in registration order.
    ///
    /// Before processing the first rejection wins. After processing all
    /// interceptors run and rejections are only logged.
    pub fn invoke(
        &self,
        stanza: &Stanza,
        session: Option<&Arc<ClientSession>>,
        incoming: bool,
        processed: bool,
    ) -> Result<(), PacketRejected> {
        let interceptors: Vec<Arc<dyn PacketInterceptor>> = self.interceptors.read().clone();
        for interceptor in interceptors {
            if let Err(rejected) = interceptor.intercept(stanza, session, incoming, processed) {
                if processed {
                    warn!(%rejected, kind = stanza.name(), "Interceptor rejected an already processed stanza");
                    continue;
                }
                debug!(%rejected, kind = stanza.name(), incoming, "Stanza rejected by interceptor");
                return Err(rejected);
            }
        }
        Ok(())
    }
}
