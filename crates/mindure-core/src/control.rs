use crate::engine::{Decision, DecisionEngine};
use crate::page::PageDescriptor;
use crate::settings::{validate_credential, SettingsError, SettingsPatch, SettingsStore};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Status {
    pub enabled: bool,
    pub has_credential: bool,
}

/// Handles the control messages sent by the popup and options pages.
#[derive(Clone)]
pub struct Controller {
    settings: Arc<dyn SettingsStore>,
    engine: DecisionEngine,
}

impl Controller {
    pub fn new(settings: Arc<dyn SettingsStore>, engine: DecisionEngine) -> Self {
        Self { settings, engine }
    }

    /// Turn the focus guard on or off. Enabling without a key is refused so
    /// the UI can revert its switch.
    pub async fn toggle_enabled(&self, enabled: bool) -> Result<bool, SettingsError> {
        if enabled && !self.settings.get().await?.has_credential() {
            return Err(SettingsError::NotConfigured);
        }
        let updated = self.settings.set(SettingsPatch::enabled(enabled)).await?;
        tracing::info!(enabled = updated.enabled, "focus guard toggled");
        Ok(updated.enabled)
    }

    /// Current status, re-read from the backing store first.
    pub async fn status(&self) -> Result<Status, SettingsError> {
        let settings = self.settings.reload().await?;
        Ok(Status {
            enabled: settings.enabled,
            has_credential: settings.has_credential(),
        })
    }

    pub async fn reload_settings(&self) -> Result<(), SettingsError> {
        let settings = self.settings.reload().await?;
        tracing::info!(
            enabled = settings.enabled,
            has_credential = settings.has_credential(),
            "settings reloaded"
        );
        Ok(())
    }

    /// Evaluate a page supplied directly by the caller.
    pub async fn evaluate_now(&self, page: &PageDescriptor) -> Result<Decision, SettingsError> {
        let settings = self.settings.get().await?;
        Ok(self.engine.evaluate(page, &settings).await)
    }

    /// Validate a user-entered key, probe it against the endpoint and store
    /// it. Nothing is stored if either check fails.
    pub async fn set_credential(&self, raw: &str) -> Result<(), SettingsError> {
        let credential = validate_credential(raw)?;
        if !self.engine.verify_credential(&credential).await {
            return Err(SettingsError::CredentialRejected);
        }
        self.settings
            .set(SettingsPatch::credential(credential))
            .await?;
        tracing::info!("API key saved");
        Ok(())
    }
}
