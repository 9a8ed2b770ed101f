//! One-stop wiring of the client core.
//!
//! `HubClient` builds the credential store, refresh coordinator, live update
//! channel, session and API client from a [`Config`] and hands out the
//! pieces UI layers need.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::api::{ApiClient, RequestExecutor};
use crate::auth::{
    CredentialStore, FileStorage, HttpTokenIssuer, KeyringStorage, MemoryStorage,
    RefreshCoordinator, SecretStorage, SessionManager, TokenIssuer,
};
use crate::config::{Config, StorageKind};
use crate::realtime::{ChannelManager, Connector, WsConnector};

pub struct HubClient {
    config: Arc<Config>,
    store: Arc<CredentialStore>,
    refresh: RefreshCoordinator,
    channel: ChannelManager,
    session: Arc<SessionManager>,
    api: ApiClient,
}

impl HubClient {
    /// Build a client talking HTTP and WebSocket to the configured backend.
    pub fn new(config: Config) -> Result<Self> {
        let storage = Self::storage_for(&config)?;
        let http = ApiClient::http_client(&config)?;
        let issuer = Arc::new(HttpTokenIssuer::new(
            http.clone(),
            config.url(&config.refresh_path),
        ));
        let connector = Arc::new(WsConnector::new(
            config.ws_url.clone(),
            config.request_timeout(),
        ));
        Ok(Self::from_parts(config, storage, http, issuer, connector))
    }

    /// Build a client from explicit parts, e.g. an in-process issuer or
    /// connector.
    pub fn from_parts(
        config: Config,
        storage: Box<dyn SecretStorage>,
        http: reqwest::Client,
        issuer: Arc<dyn TokenIssuer>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(CredentialStore::new(storage));
        let refresh = RefreshCoordinator::new(
            issuer,
            Arc::clone(&store),
            config.refresh_retry.policy(),
            config.credential_ttl(),
        );
        let channel = ChannelManager::new(
            connector,
            Arc::clone(&store),
            config.reconnect.policy(),
            config.ping_interval(),
        );
        let session = Arc::new(SessionManager::new(
            Arc::clone(&store),
            refresh.clone(),
            channel.clone(),
        ));
        let executor = RequestExecutor::new(
            Arc::clone(&store),
            refresh.clone(),
            Arc::clone(&session),
            config.request_retry.policy(),
        );
        let api = ApiClient::new(http, Arc::clone(&config), executor, Arc::clone(&session));

        Self {
            config,
            store,
            refresh,
            channel,
            session,
            api,
        }
    }

    /// Pick the durable storage named by the config.
    pub fn storage_for(config: &Config) -> Result<Box<dyn SecretStorage>> {
        Ok(match config.storage {
            StorageKind::Keyring => Box::new(KeyringStorage::new()),
            StorageKind::File => Box::new(FileStorage::new(config.cache_dir()?)),
            StorageKind::Memory => Box::new(MemoryStorage::new()),
        })
    }

    /// Restore the saved session, if any. Call once at startup.
    pub async fn restore(&self) -> Result<bool> {
        let restored = self.session.restore().await?;
        info!(restored, "Client started");
        Ok(restored)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn channel(&self) -> &ChannelManager {
        &self.channel
    }

    pub fn refresh(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::refresh::testing::ScriptedIssuer;
    use crate::auth::UserIdentity;
    use crate::realtime::connector::testing::MockConnector;
    use crate::realtime::{ConnectionState, Topic};

    #[tokio::test(start_paused = true)]
    async fn test_wired_components_share_state() {
        let (connector, accepted) = MockConnector::new();
        let issuer = Arc::new(ScriptedIssuer::issuing("tok-2"));
        let client = HubClient::from_parts(
            Config::default(),
            Box::new(MemoryStorage::new()),
            reqwest::Client::new(),
            issuer.clone(),
            Arc::new(connector),
        );

        let user = UserIdentity {
            id: "5".into(),
            email: "kim@example.com".into(),
            display_name: None,
            role: None,
        };
        client.session().set_session(user, "tok-1").await.unwrap();
        client
            .channel()
            .subscribe(Topic::global("notifications"), |_| {})
            .await;
        let mut server = accepted.lock().await.recv().await.expect("connection");
        assert_eq!(server.next_message().await.unwrap()["data"]["token"], "tok-1");

        assert_eq!(client.refresh().get_valid_credential().await.as_deref(), Ok("tok-2"));
        assert_eq!(client.store().token().await.as_deref(), Some("tok-2"));
        assert_eq!(issuer.calls(), 1);

        client.session().clear_session().await;
        assert_eq!(client.channel().state(), ConnectionState::Closed);
        assert!(client.store().token().await.is_none());

        // Cache was invalidated along with the session
        client.refresh().get_valid_credential().await.unwrap();
        assert_eq!(issuer.calls(), 2);
    }

    #[test]
    fn test_storage_for_memory() {
        let config = Config {
            storage: StorageKind::Memory,
            ..Config::default()
        };
        let storage = HubClient::storage_for(&config).unwrap();
        storage.set("k", "v").unwrap();
        assert_eq!(storage.get("k").unwrap().as_deref(), Some("v"));
    }
}
