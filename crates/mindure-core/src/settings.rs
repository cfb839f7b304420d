use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Shortest credential accepted when saving one.
pub const MIN_CREDENTIAL_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("API key is empty")]
    EmptyCredential,
    #[error("API key is too short (expected at least 20 characters)")]
    CredentialTooShort,
    #[error("API key was rejected by the classifier endpoint")]
    CredentialRejected,
    #[error("no API key configured")]
    NotConfigured,
    #[error("failed to persist settings: {0}")]
    Persist(String),
}

/// The two user-controlled knobs. Read as a snapshot at the start of every
/// decision cycle; later changes apply to the next cycle.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, alias = "isEnabled")]
    pub enabled: bool,
    #[serde(default, alias = "groqApiKey")]
    pub credential: String,
}

impl Settings {
    pub fn new(enabled: bool, credential: impl Into<String>) -> Self {
        Self {
            enabled,
            credential: credential.into(),
        }
    }

    pub fn has_credential(&self) -> bool {
        !self.credential.trim().is_empty()
    }

    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(credential) = &patch.credential {
            self.credential = credential.clone();
        }
    }
}

// Keeps the key out of logs.
impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("enabled", &self.enabled)
            .field("has_credential", &self.has_credential())
            .finish()
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SettingsPatch {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl SettingsPatch {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            credential: None,
        }
    }

    pub fn credential(credential: impl Into<String>) -> Self {
        Self {
            enabled: None,
            credential: Some(credential.into()),
        }
    }
}

/// Trim a user-entered credential and check it looks like a key.
pub fn validate_credential(raw: &str) -> Result<String, SettingsError> {
    let key = raw.trim();
    if key.is_empty() {
        return Err(SettingsError::EmptyCredential);
    }
    if key.chars().count() < MIN_CREDENTIAL_LEN {
        return Err(SettingsError::CredentialTooShort);
    }
    Ok(key.to_string())
}

/// Process-wide settings with change notification.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Current snapshot.
    async fn get(&self) -> Result<Settings, SettingsError>;

    /// Apply a partial update and return the resulting snapshot.
    async fn set(&self, patch: SettingsPatch) -> Result<Settings, SettingsError>;

    /// Re-read from the backing medium. Stores without one just return the
    /// current snapshot.
    async fn reload(&self) -> Result<Settings, SettingsError> {
        self.get().await
    }

    /// Receiver that observes every change.
    fn subscribe(&self) -> watch::Receiver<Settings>;
}

/// In-process store with no persistence.
pub struct MemorySettingsStore {
    tx: watch::Sender<Settings>,
}

impl MemorySettingsStore {
    pub fn new(initial: Settings) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self) -> Result<Settings, SettingsError> {
        Ok(self.tx.borrow().clone())
    }

    async fn set(&self, patch: SettingsPatch) -> Result<Settings, SettingsError> {
        self.tx.send_modify(|settings| settings.apply(&patch));
        let current = self.tx.borrow().clone();
        tracing::info!(
            enabled = current.enabled,
            has_credential = current.has_credential(),
            "settings updated"
        );
        Ok(current)
    }

    fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }
}
