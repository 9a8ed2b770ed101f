use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use keyring::Entry;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::session::UserIdentity;

const SERVICE_NAME: &str = "visahub";

/// Storage key holding the bearer credential
pub const TOKEN_KEY: &str = "auth_token";

/// Storage key holding the JSON-encoded user profile
pub const USER_KEY: &str = "user_profile";

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Durable key/value storage for session secrets.
pub trait SecretStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// OS keychain storage.
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Use a different keychain service name, e.g. one per backend.
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStorage for KeyringStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve secret from keychain"),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store secret in keychain")
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete secret from keychain"),
        }
    }
}

/// Plain JSON file in the cache directory.
///
/// Used where no keychain is available (CI boxes, containers).
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            path: cache_dir.join(SESSION_FILE),
        }
    }

    fn read_all(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents =
            std::fs::read_to_string(&self.path).context("Failed to read session file")?;
        serde_json::from_str(&contents).context("Failed to parse session file")
    }

    fn write_all(&self, values: &HashMap<String, String>) -> Result<()> {
        if values.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, contents).context("Failed to write session file")
    }
}

impl SecretStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.read_all()?;
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut values = self.read_all()?;
        if values.remove(key).is_some() {
            self.write_all(&values)?;
        }
        Ok(())
    }
}

/// In-process storage; nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory storage lock poisoned"))
    }
}

impl SecretStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.values()?.remove(key);
        Ok(())
    }
}

/// Holds the current bearer credential and the signed-in user's profile.
///
/// Values live in memory for fast reads and are written through to the
/// backing [`SecretStorage`] so a session survives a restart.
pub struct CredentialStore {
    storage: Box<dyn SecretStorage>,
    token: RwLock<Option<String>>,
    user: RwLock<Option<UserIdentity>>,
}

impl CredentialStore {
    pub fn new(storage: Box<dyn SecretStorage>) -> Self {
        Self {
            storage,
            token: RwLock::new(None),
            user: RwLock::new(None),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStorage::new()))
    }

    /// Reload the persisted credential and profile into memory.
    ///
    /// A profile that no longer parses is dropped rather than failing startup.
    pub async fn load(&self) -> Result<()> {
        let token = self.storage.get(TOKEN_KEY)?;
        let user = match self.storage.get(USER_KEY)? {
            Some(raw) => match serde_json::from_str::<UserIdentity>(&raw) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable stored user profile");
                    let _ = self.storage.delete(USER_KEY);
                    None
                }
            },
            None => None,
        };
        debug!(
            has_token = token.is_some(),
            has_user = user.is_some(),
            "Credential store loaded"
        );
        *self.token.write().await = token;
        *self.user.write().await = user;
        Ok(())
    }

    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    pub async fn set_token(&self, token: &str) -> Result<()> {
        *self.token.write().await = Some(token.to_string());
        self.storage.set(TOKEN_KEY, token)
    }

    pub async fn user(&self) -> Option<UserIdentity> {
        self.user.read().await.clone()
    }

    pub async fn set_user(&self, user: &UserIdentity) -> Result<()> {
        *self.user.write().await = Some(user.clone());
        let raw = serde_json::to_string(user)?;
        self.storage.set(USER_KEY, &raw)
    }

    /// Forget the credential and profile, in memory and on disk.
    pub async fn clear(&self) -> Result<()> {
        *self.token.write().await = None;
        *self.user.write().await = None;
        self.storage.delete(TOKEN_KEY)?;
        self.storage.delete(USER_KEY)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserIdentity {
        UserIdentity {
            id: "u-1".to_string(),
            email: "ana@example.com".to_string(),
            display_name: Some("Ana".to_string()),
            role: None,
        }
    }

    #[tokio::test]
    async fn test_store_round_trips_through_storage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialStore::new(Box::new(FileStorage::new(dir.path().to_path_buf())));
        store.set_token("tok-1").await.unwrap();
        store.set_user(&user()).await.unwrap();

        let reloaded = CredentialStore::new(Box::new(FileStorage::new(dir.path().to_path_buf())));
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.token().await.as_deref(), Some("tok-1"));
        assert_eq!(reloaded.user().await, Some(user()));
    }

    #[tokio::test]
    async fn test_clear_removes_session_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialStore::new(Box::new(FileStorage::new(dir.path().to_path_buf())));
        store.set_token("tok-1").await.unwrap();
        assert!(dir.path().join(SESSION_FILE).exists());

        store.clear().await.unwrap();
        assert!(store.token().await.is_none());
        assert!(!dir.path().join(SESSION_FILE).exists());
    }

    #[tokio::test]
    async fn test_unreadable_profile_is_dropped() {
        let storage = MemoryStorage::new();
        storage.set(TOKEN_KEY, "tok").unwrap();
        storage.set(USER_KEY, "{not json").unwrap();
        let store = CredentialStore::new(Box::new(storage));

        store.load().await.unwrap();
        assert_eq!(store.token().await.as_deref(), Some("tok"));
        assert!(store.user().await.is_none());
    }

    #[test]
    fn test_file_storage_missing_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::new(dir.path().to_path_buf());
        assert_eq!(storage.get(TOKEN_KEY).unwrap(), None);
        storage.delete(TOKEN_KEY).unwrap();
    }
}
