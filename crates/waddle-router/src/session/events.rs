//! Session lifecycle events.

use std::sync::Arc;

use parking_lot::RwLock;

use super::ClientSession;

/// Observer of client session lifecycle.
pub trait SessionEventListener: Send + Sync {
    fn session_created(&self, _session: &Arc<ClientSession>) {}

    fn session_destroyed(&self, _session: &Arc<ClientSession>) {}

    fn anonymous_session_created(&self, _session: &Arc<ClientSession>) {}

    fn anonymous_session_destroyed(&self, _session: &Arc<ClientSession>) {}

    fn resource_bound(&self, _session: &Arc<ClientSession>) {}
}

/// Fans lifecycle events out to registered listeners.
#[derive(Default)]
pub struct SessionEventDispatcher {
    listeners: RwLock<Vec<Arc<dyn SessionEventListener>>>,
}

impl SessionEventDispatcher {
    pub fn add_listener(&self, listener: Arc<dyn SessionEventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SessionEventListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub(crate) fn created(&self, session: &Arc<ClientSession>) {
        for listener in self.snapshot() {
            if session.is_anonymous() {
                listener.anonymous_session_created(session);
            } else {
                listener.session_created(session);
            }
        }
    }

    pub(crate) fn destroyed(&self, session: &Arc<ClientSession>) {
        for listener in self.snapshot() {
            if session.is_anonymous() {
                listener.anonymous_session_destroyed(session);
            } else {
                listener.session_destroyed(session);
            }
        }
    }

    pub(crate) fn resource_bound(&self, session: &Arc<ClientSession>) {
        for listener in self.snapshot() {
            listener.resource_bound(session);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn SessionEventListener>> {
        self.listeners.read().clone()
    }
}
