use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::refresh::RefreshCoordinator;
use super::token;
use super::CredentialStore;
use crate::realtime::{ChannelManager, ConnectionState};
use crate::utils::id_string;

/// Minimal profile of the signed-in user, persisted next to the credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub email: String,
    #[serde(default, alias = "name")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub is_authenticated: bool,
    pub user: Option<UserIdentity>,
}

/// Process-wide session state.
///
/// The only ways in or out of a session are [`set_session`](Self::set_session)
/// and [`clear_session`](Self::clear_session); everything else reads.
pub struct SessionManager {
    state: watch::Sender<Session>,
    store: Arc<CredentialStore>,
    refresh: RefreshCoordinator,
    channel: ChannelManager,
}

impl SessionManager {
    pub fn new(
        store: Arc<CredentialStore>,
        refresh: RefreshCoordinator,
        channel: ChannelManager,
    ) -> Self {
        let (state, _) = watch::channel(Session::default());
        Self {
            state,
            store,
            refresh,
            channel,
        }
    }

    pub fn current(&self) -> Session {
        self.state.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated
    }

    pub fn user(&self) -> Option<UserIdentity> {
        self.state.borrow().user.clone()
    }

    /// Current bearer credential, if signed in.
    pub async fn credential(&self) -> Option<String> {
        self.store.token().await
    }

    /// Change notifications for UI layers.
    pub fn watch(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    /// Sign in: persist the credential and profile, mark the session
    /// authenticated and bring the live update channel up on the new identity.
    pub async fn set_session(&self, user: UserIdentity, credential: &str) -> Result<()> {
        // A refresh still running for the previous identity must not land
        self.refresh.invalidate().await;
        self.store
            .set_token(credential)
            .await
            .context("Failed to store credential")?;
        self.store
            .set_user(&user)
            .await
            .context("Failed to store user profile")?;

        info!(user_id = %user.id, "Session established");
        self.state.send_replace(Session {
            is_authenticated: true,
            user: Some(user),
        });

        if self.channel.state() == ConnectionState::Open {
            self.channel.reauthenticate().await;
        } else {
            self.channel.connect().await;
        }
        Ok(())
    }

    /// Sign out: forget the credential, its cached copy, the live connection
    /// and every subscription. Safe to call when already signed out.
    pub async fn clear_session(&self) {
        let previous = self.state.send_replace(Session::default());
        if previous.is_authenticated {
            info!("Session cleared");
        }

        // Invalidate first so an in-flight refresh can't write the
        // credential back after the store is cleared
        self.refresh.invalidate().await;
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "Failed to remove stored credential");
        }
        self.channel.disconnect().await;
    }

    /// Restore a persisted session at startup.
    ///
    /// Returns `true` when a live credential and profile were found. Expired
    /// or partial leftovers are cleared.
    pub async fn restore(&self) -> Result<bool> {
        self.store.load().await?;

        let token = self.store.token().await;
        let user = self.store.user().await;
        match (token, user) {
            (Some(token), Some(user)) if !token::is_expired(&token) => {
                info!(user_id = %user.id, "Restored saved session");
                self.state.send_replace(Session {
                    is_authenticated: true,
                    user: Some(user),
                });
                self.channel.connect().await;
                Ok(true)
            }
            (None, None) => {
                debug!("No saved session");
                Ok(false)
            }
            _ => {
                debug!("Discarding expired or incomplete saved session");
                self.clear_session().await;
                Ok(false)
            }
        }
    }
}
