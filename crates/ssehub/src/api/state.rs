//! Application state shared across handlers.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::hub::Hub;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub server: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(hub: Hub, server: ServerConfig) -> Self {
        Self {
            hub,
            server: Arc::new(server),
        }
    }
}
