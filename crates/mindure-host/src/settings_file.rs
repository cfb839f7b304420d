use async_trait::async_trait;
use mindure_core::{Settings, SettingsError, SettingsPatch, SettingsStore};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// Settings persisted as a small JSON file.
///
/// The file is re-read when it changes on disk, so edits made by another
/// process (or by hand) reach subscribers without a restart. A missing or
/// unreadable file reads as disabled with no key.
pub struct FileSettingsStore {
    path: PathBuf,
    tx: watch::Sender<Settings>,
    write_lock: tokio::sync::Mutex<()>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileSettingsStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let initial = read_settings(&path);
        tracing::info!(
            path = %path.display(),
            enabled = initial.enabled,
            has_credential = initial.has_credential(),
            "settings loaded"
        );
        let (tx, _) = watch::channel(initial);
        Self {
            path,
            tx,
            write_lock: tokio::sync::Mutex::new(()),
            watcher: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start following external modifications of the settings file.
    pub fn watch(self: &Arc<Self>) {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let store = Arc::downgrade(self);
        let file_name = self.path.file_name().map(|n| n.to_os_string());

        let watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let Ok(event) = res else { return };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            let ours = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if let (true, Some(store)) = (ours, store.upgrade()) {
                store.publish(read_settings(&store.path));
            }
        });

        let mut watcher = match watcher {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(error = %e, "failed to start settings watcher");
                return;
            }
        };
        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            tracing::warn!(error = %e, dir = %dir.display(), "failed to watch settings directory");
            return;
        }

        *self.watcher.lock() = Some(watcher);
        tracing::info!("settings file watcher started");
    }

    /// Push `settings` to subscribers if it differs from what they have.
    fn publish(&self, settings: Settings) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == settings {
                false
            } else {
                *current = settings;
                true
            }
        });
        if changed {
            let current = self.tx.borrow();
            tracing::info!(
                enabled = current.enabled,
                has_credential = current.has_credential(),
                "settings changed"
            );
        }
        changed
    }

    async fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        let json = serde_json::to_vec_pretty(settings)
            .map_err(|e| SettingsError::Persist(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| SettingsError::Persist(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SettingsError::Persist(e.to_string()))
    }
}

fn read_settings(path: &Path) -> Settings {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            tracing::error!(error = %e, path = %path.display(), "unreadable settings file, using defaults");
            Settings::default()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
        Err(e) => {
            tracing::error!(error = %e, path = %path.display(), "failed to read settings file");
            Settings::default()
        }
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn get(&self) -> Result<Settings, SettingsError> {
        Ok(self.tx.borrow().clone())
    }

    async fn set(&self, patch: SettingsPatch) -> Result<Settings, SettingsError> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.tx.borrow().clone();
        next.apply(&patch);
        self.persist(&next).await?;
        self.publish(next.clone());
        Ok(next)
    }

    async fn reload(&self) -> Result<Settings, SettingsError> {
        let path = self.path.clone();
        let settings = tokio::task::spawn_blocking(move || read_settings(&path))
            .await
            .map_err(|e| SettingsError::Persist(e.to_string()))?;
        self.publish(settings.clone());
        Ok(settings)
    }

    fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }
}
