use server_api::ApiContext;

use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) presence: PresenceTracker,
}

impl AppState {
    pub(crate) fn new(api: ApiContext) -> Self {
        Self {
            api,
            registry: ConnectionRegistry::default(),
            presence: PresenceTracker::default(),
        }
    }
}
