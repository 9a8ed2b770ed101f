//! Authentication module for managing user sessions and credentials.
//!
//! This module provides:
//! - `CredentialStore`: the current bearer credential, persisted through a
//!   `SecretStorage` backend (OS keychain, session file, or memory)
//! - `RefreshCoordinator`: credential cache plus single-flight refresh
//! - `SessionManager`: the process-wide signed-in/signed-out state
//!
//! Credentials are JWTs; their claims are read (never verified) to size the
//! cache and to discard expired sessions at startup.

pub mod credentials;
pub mod refresh;
pub mod session;
pub mod token;

pub use credentials::{CredentialStore, FileStorage, KeyringStorage, MemoryStorage, SecretStorage};
pub use refresh::{
    HttpTokenIssuer, RefreshCoordinator, RefreshError, RefreshMetricsSnapshot, TokenIssuer,
};
pub use session::{Session, SessionManager, UserIdentity};
pub use token::TokenClaims;
