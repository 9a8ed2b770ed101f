//! VisaHub client core.
//!
//! The resilient, authenticated communication layer the VisaHub UI clients
//! ride on: credential storage, single-flight credential refresh, a request
//! executor that recovers from expiry and retries timeouts, and a live update
//! channel that reconnects and re-subscribes on its own.

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod realtime;
pub mod utils;

pub use api::{ApiClient, ApiError, RequestExecutor, RetryPolicy};
pub use auth::{CredentialStore, RefreshCoordinator, Session, SessionManager, UserIdentity};
pub use client::HubClient;
pub use config::Config;
pub use realtime::{ChannelManager, ConnectionState, Topic};
