use crate::api::{Api, HttpApi};
use crate::connection::ConnectionManager;
use crate::coordinator::FetchCoordinator;
use crate::store::Store;
use crate::transport::{Transport, WsTransport};
use gbcms_core::{ClientConfig, ClientError};
use std::sync::Arc;
use tracing::info;

/// Process-wide client state.
///
/// Built once when the application starts and handed to consumers by
/// reference. `logout` is the teardown: it drops the real-time connection and
/// returns every resource to `idle`.
pub struct Session {
    config: ClientConfig,
    store: Store,
    connection: ConnectionManager,
    coordinator: FetchCoordinator,
}

impl Session {
    pub fn start(config: ClientConfig, token: Option<String>) -> Result<Self, ClientError> {
        let api = HttpApi::new(&config)?.with_bearer_token(token);
        Ok(Self::with_parts(config, Arc::new(api), Arc::new(WsTransport::new())))
    }

    pub fn with_parts(
        config: ClientConfig,
        api: Arc<dyn Api>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let store = Store::new();
        let connection = ConnectionManager::new(config.clone(), transport, store.clone());
        let coordinator = FetchCoordinator::new(api, store.clone(), config.request_timeout);
        info!(api = %config.api_url, ws = %config.ws_url, "session_started");
        Self {
            config,
            store,
            connection,
            coordinator,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }

    pub fn logout(&self) {
        self.connection.disconnect();
        self.store.reset();
        info!("session_logout");
    }
}
