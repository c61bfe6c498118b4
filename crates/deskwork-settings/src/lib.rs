use anyhow::Result;
use deskwork_core::AppSettings;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

pub const KEYRING_SERVICE: &str = "deskwork";

/// Keys that older settings files stored in plain text.
const LEGACY_SECRET_KEYS: &[&str] = &["api_key", "openai_api_key"];

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secure store unavailable for provider '{provider}': {message}")]
    Backend { provider: String, message: String },
}

/// OS-level credential storage, keyed by provider name.
pub trait SecretBackend: Send + Sync {
    fn get(&self, provider: &str) -> std::result::Result<Option<String>, SecretError>;
    fn set(&self, provider: &str, credential: &str) -> std::result::Result<(), SecretError>;
    fn clear(&self, provider: &str) -> std::result::Result<(), SecretError>;
}

pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
        }
    }

    fn entry(&self, provider: &str) -> std::result::Result<keyring::Entry, SecretError> {
        keyring::Entry::new(&self.service, &format!("{provider}_api_key"))
            .map_err(|e| backend_error(provider, e))
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn backend_error(provider: &str, err: keyring::Error) -> SecretError {
    SecretError::Backend {
        provider: provider.to_string(),
        message: err.to_string(),
    }
}

impl SecretBackend for KeyringBackend {
    fn get(&self, provider: &str) -> std::result::Result<Option<String>, SecretError> {
        match self.entry(provider)?.get_password() {
            Ok(value) if value.is_empty() => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(backend_error(provider, e)),
        }
    }

    fn set(&self, provider: &str, credential: &str) -> std::result::Result<(), SecretError> {
        if credential.is_empty() {
            return self.clear(provider);
        }
        self.entry(provider)?
            .set_password(credential)
            .map_err(|e| backend_error(provider, e))
    }

    fn clear(&self, provider: &str) -> std::result::Result<(), SecretError> {
        match self.entry(provider)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(backend_error(provider, e)),
        }
    }
}

/// Process-local backend for tests and headless runs.
#[derive(Default)]
pub struct MemorySecretBackend {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySecretBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretBackend for MemorySecretBackend {
    fn get(&self, provider: &str) -> std::result::Result<Option<String>, SecretError> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(provider).cloned())
    }

    fn set(&self, provider: &str, credential: &str) -> std::result::Result<(), SecretError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        if credential.is_empty() {
            values.remove(provider);
        } else {
            values.insert(provider.to_string(), credential.to_string());
        }
        Ok(())
    }

    fn clear(&self, provider: &str) -> std::result::Result<(), SecretError> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(provider);
        Ok(())
    }
}

/// Shared, lock-protected settings service.
///
/// Readers take a [`snapshot`](Self::snapshot); writers are serialized and
/// persisted to the data directory. Credentials go through the
/// [`SecretBackend`] and never touch the settings file.
pub struct SettingsStore {
    data_dir: Option<PathBuf>,
    settings: RwLock<AppSettings>,
    secrets: Arc<dyn SecretBackend>,
}

impl SettingsStore {
    pub fn open(data_dir: &Path, secrets: Arc<dyn SecretBackend>) -> Result<Self> {
        let settings = AppSettings::load(data_dir)?;
        let store = Self {
            data_dir: Some(data_dir.to_path_buf()),
            settings: RwLock::new(settings),
            secrets,
        };
        store.migrate_legacy_secrets()?;
        Ok(store)
    }

    /// Settings that are never written to disk.
    pub fn in_memory(settings: AppSettings, secrets: Arc<dyn SecretBackend>) -> Self {
        Self {
            data_dir: None,
            settings: RwLock::new(settings),
            secrets,
        }
    }

    pub fn snapshot(&self) -> AppSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn update<F>(&self, apply: F) -> Result<AppSettings>
    where
        F: FnOnce(&mut AppSettings),
    {
        let mut guard = self.settings.write().unwrap_or_else(|e| e.into_inner());
        let mut next = guard.clone();
        apply(&mut next);
        if let Some(dir) = &self.data_dir {
            next.save(dir)?;
        }
        *guard = next.clone();
        Ok(next)
    }

    pub fn replace(&self, settings: AppSettings) -> Result<()> {
        self.update(|current| *current = settings)?;
        Ok(())
    }

    pub fn credential(&self, provider: &str) -> std::result::Result<Option<String>, SecretError> {
        self.secrets.get(provider)
    }

    pub fn set_credential(
        &self,
        provider: &str,
        credential: &str,
    ) -> std::result::Result<(), SecretError> {
        self.secrets.set(provider, credential)
    }

    pub fn clear_credential(&self, provider: &str) -> std::result::Result<(), SecretError> {
        self.secrets.clear(provider)
    }

    /// Credential for the currently selected provider.
    pub fn active_credential(&self) -> std::result::Result<Option<String>, SecretError> {
        let provider = self.snapshot().provider;
        self.secrets.get(&provider)
    }

    // Moves plain-text keys left by older settings files into the secure
    // store and rewrites the file without them.
    fn migrate_legacy_secrets(&self) -> Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let path = AppSettings::data_settings_path(dir);
        if !path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&path)?;
        let mut value: serde_json::Value = serde_json::from_str(&raw)?;
        let Some(object) = value.as_object_mut() else {
            return Ok(());
        };
        let mut found = None;
        let mut touched = false;
        for key in LEGACY_SECRET_KEYS {
            if let Some(old) = object.remove(*key) {
                touched = true;
                if let Some(text) = old.as_str().filter(|s| !s.is_empty()) {
                    found.get_or_insert_with(|| text.to_string());
                }
            }
        }
        if !touched {
            return Ok(());
        }
        if let Some(secret) = found {
            let provider = self.snapshot().provider;
            self.secrets.set(&provider, &secret)?;
        }
        fs::write(&path, serde_json::to_vec_pretty(&value)?)?;
        Ok(())
    }
}
