//! Navigation coordinator.
//!
//! Turns navigation events into block/allow actions. Each event runs one
//! cycle: settings snapshot, page inspection, evaluation, and a block call
//! when the page is judged distracting. Collaborator failures abort that one
//! cycle and are only logged.

use crate::engine::{Decision, DecisionEngine};
use crate::page::PageDescriptor;
use crate::settings::SettingsStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How long to wait for a tab's content script before giving up on a cycle.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Browser tab identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("no content script attached to tab {0}")]
    Unavailable(TabId),
    #[error("tab {0} did not answer within {1:?}")]
    Timeout(TabId, Duration),
    #[error("tab {tab} returned an unusable reply: {reason}")]
    BadReply { tab: TabId, reason: String },
}

/// Reads a [`PageDescriptor`] from the page shown in a tab.
#[async_trait]
pub trait PageInspector: Send + Sync {
    /// `Ok(None)` when the tab answered but has nothing to describe.
    async fn page_info(&self, tab: TabId) -> Result<Option<PageDescriptor>, CollaboratorError>;
}

/// Covers a tab's page with the block overlay. Must be idempotent.
#[async_trait]
pub trait Blocker: Send + Sync {
    async fn block(&self, tab: TabId) -> Result<(), CollaboratorError>;
}

/// Navigation events the coordinator reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NavigationEvent {
    /// A document finished loading. Only `frame == 0` (top level) counts.
    PageLoaded {
        tab: TabId,
        #[serde(default)]
        frame: u64,
    },
    /// Same-document route change observed by the content script.
    UrlChanged { tab: TabId, url: String },
}

impl NavigationEvent {
    pub fn tab(&self) -> TabId {
        match self {
            Self::PageLoaded { tab, .. } | Self::UrlChanged { tab, .. } => *tab,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Subframe,
    SameUrl,
    Disabled,
    NotConfigured,
    NoPageInfo,
}

/// What one cycle ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    Allowed(Decision),
    Blocked(Decision),
    Aborted,
}

#[derive(Debug, Default)]
struct TabState {
    last_url: Option<String>,
    seq: u64,
}

pub struct NavigationCoordinator {
    settings: Arc<dyn SettingsStore>,
    engine: DecisionEngine,
    inspector: Arc<dyn PageInspector>,
    blocker: Arc<dyn Blocker>,
    reply_timeout: Duration,
    tabs: Mutex<HashMap<TabId, TabState>>,
}

impl NavigationCoordinator {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        engine: DecisionEngine,
        inspector: Arc<dyn PageInspector>,
        blocker: Arc<dyn Blocker>,
    ) -> Self {
        Self {
            settings,
            engine,
            inspector,
            blocker,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            tabs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Forget everything about a closed tab.
    pub fn forget_tab(&self, tab: TabId) {
        self.tabs.lock().remove(&tab);
    }

    pub async fn handle(&self, event: NavigationEvent) -> CycleOutcome {
        let tab = event.tab();
        let outcome = self.run_cycle(event).await;

        match &outcome {
            CycleOutcome::Blocked(d) => {
                tracing::info!(tab = %tab, source = d.source.as_str(), "page blocked")
            }
            CycleOutcome::Allowed(d) => {
                tracing::debug!(tab = %tab, source = d.source.as_str(), "page allowed")
            }
            CycleOutcome::Skipped(reason) => {
                tracing::debug!(tab = %tab, ?reason, "navigation skipped")
            }
            CycleOutcome::Aborted => {}
        }
        outcome
    }

    async fn run_cycle(&self, event: NavigationEvent) -> CycleOutcome {
        let tab = event.tab();
        match &event {
            NavigationEvent::PageLoaded { frame, .. } if *frame != 0 => {
                return CycleOutcome::Skipped(SkipReason::Subframe);
            }
            NavigationEvent::UrlChanged { url, .. } => {
                let tabs = self.tabs.lock();
                let last_url = tabs.get(&tab).and_then(|s| s.last_url.as_deref());
                if last_url == Some(url.as_str()) {
                    return CycleOutcome::Skipped(SkipReason::SameUrl);
                }
            }
            NavigationEvent::PageLoaded { .. } => {}
        }

        let settings = match self.settings.get().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "could not read settings, skipping cycle");
                return CycleOutcome::Aborted;
            }
        };
        if !settings.enabled {
            return CycleOutcome::Skipped(SkipReason::Disabled);
        }
        if !settings.has_credential() {
            return CycleOutcome::Skipped(SkipReason::NotConfigured);
        }

        let seq = self.next_seq(tab);

        let page = match self.bounded(tab, self.inspector.page_info(tab)).await {
            Ok(Some(page)) => page,
            Ok(None) => return CycleOutcome::Skipped(SkipReason::NoPageInfo),
            Err(e) => {
                tracing::warn!(tab = %tab, error = %e, "page inspector unavailable");
                return CycleOutcome::Aborted;
            }
        };
        // A URL only counts as seen once the inspector has described it, so
        // skipped or aborted cycles are retried on the next event.
        let seen_url = match &event {
            NavigationEvent::UrlChanged { url, .. } => url.clone(),
            NavigationEvent::PageLoaded { .. } => page.url.clone(),
        };
        self.tabs.lock().entry(tab).or_default().last_url = Some(seen_url);

        let decision = self.engine.evaluate(&page, &settings).await;

        if self.current_seq(tab) != seq {
            // Still applied; a newer navigation will issue its own decision.
            tracing::debug!(tab = %tab, seq, "applying decision from superseded navigation");
        }

        if !decision.is_blocked() {
            return CycleOutcome::Allowed(decision);
        }

        match self.bounded(tab, self.blocker.block(tab)).await {
            Ok(()) => CycleOutcome::Blocked(decision),
            Err(e) => {
                tracing::warn!(tab = %tab, error = %e, "blocker unavailable");
                CycleOutcome::Aborted
            }
        }
    }

    async fn bounded<T>(
        &self,
        tab: TabId,
        call: impl Future<Output = Result<T, CollaboratorError>>,
    ) -> Result<T, CollaboratorError> {
        tokio::time::timeout(self.reply_timeout, call)
            .await
            .map_err(|_| CollaboratorError::Timeout(tab, self.reply_timeout))?
    }

    fn next_seq(&self, tab: TabId) -> u64 {
        let mut tabs = self.tabs.lock();
        let state = tabs.entry(tab).or_default();
        state.seq += 1;
        state.seq
    }

    fn current_seq(&self, tab: TabId) -> u64 {
        self.tabs.lock().get(&tab).map(|s| s.seq).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classifier, ClassifyError};
    use crate::settings::{MemorySettingsStore, Settings, SettingsPatch};
    use mindure_cache::DecisionCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedClassifier(bool);

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(
            &self,
            _page: &PageDescriptor,
            _credential: &str,
        ) -> Result<bool, ClassifyError> {
            Ok(self.0)
        }
    }

    #[derive(Default)]
    struct FakeTab {
        page: Option<PageDescriptor>,
        hang: bool,
        detached: bool,
        inspections: AtomicUsize,
        blocks: AtomicUsize,
    }

    #[async_trait]
    impl PageInspector for FakeTab {
        async fn page_info(&self, tab: TabId) -> Result<Option<PageDescriptor>, CollaboratorError> {
            self.inspections.fetch_add(1, Ordering::SeqCst);
            if self.detached {
                return Err(CollaboratorError::Unavailable(tab));
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(self.page.clone())
        }
    }

    #[async_trait]
    impl Blocker for FakeTab {
        async fn block(&self, _tab: TabId) -> Result<(), CollaboratorError> {
            self.blocks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn page(title: &str) -> PageDescriptor {
        PageDescriptor::new(title, "https://example.com/feed", "example.com")
    }

    fn setup(
        verdict: bool,
        settings: Settings,
        tab: FakeTab,
    ) -> (NavigationCoordinator, Arc<FakeTab>, Arc<MemorySettingsStore>) {
        let tab = Arc::new(tab);
        let store = Arc::new(MemorySettingsStore::new(settings));
        let engine = DecisionEngine::new(
            DecisionCache::with_defaults(),
            Box::new(FixedClassifier(verdict)),
        );
        let coordinator = NavigationCoordinator::new(
            store.clone(),
            engine,
            tab.clone(),
            tab.clone(),
        )
        .with_reply_timeout(Duration::from_millis(50));
        (coordinator, tab, store)
    }

    fn enabled() -> Settings {
        Settings::new(true, "gsk_0123456789abcdefghij")
    }

    fn loaded(frame: u64) -> NavigationEvent {
        NavigationEvent::PageLoaded {
            tab: TabId(7),
            frame,
        }
    }

    #[tokio::test]
    async fn distracting_page_is_blocked() {
        let tab = FakeTab {
            page: Some(page("Feed")),
            ..FakeTab::default()
        };
        let (coordinator, tab, _) = setup(false, enabled(), tab);

        let outcome = coordinator.handle(loaded(0)).await;
        assert!(matches!(outcome, CycleOutcome::Blocked(_)));
        assert_eq!(tab.blocks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn educational_page_is_left_alone() {
        let tab = FakeTab {
            page: Some(page("Docs")),
            ..FakeTab::default()
        };
        let (coordinator, tab, _) = setup(true, enabled(), tab);

        let outcome = coordinator.handle(loaded(0)).await;
        assert!(matches!(outcome, CycleOutcome::Allowed(_)));
        assert_eq!(tab.blocks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subframes_are_ignored() {
        let (coordinator, tab, _) = setup(false, enabled(), FakeTab::default());

        let outcome = coordinator.handle(loaded(3)).await;
        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::Subframe));
        assert_eq!(tab.inspections.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_does_no_page_work() {
        let (coordinator, tab, _) =
            setup(false, Settings::new(false, "gsk_0123456789abcdefghij"), FakeTab::default());

        let outcome = coordinator.handle(loaded(0)).await;
        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::Disabled));
        assert_eq!(tab.inspections.load(Ordering::SeqCst), 0);
        assert_eq!(tab.blocks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn settings_are_read_fresh_per_event() {
        let tab = FakeTab {
            page: Some(page("Feed")),
            ..FakeTab::default()
        };
        let (coordinator, tab, store) = setup(false, enabled(), tab);

        store.set(SettingsPatch::enabled(false)).await.unwrap();
        assert_eq!(
            coordinator.handle(loaded(0)).await,
            CycleOutcome::Skipped(SkipReason::Disabled)
        );

        store.set(SettingsPatch::enabled(true)).await.unwrap();
        assert!(matches!(
            coordinator.handle(loaded(0)).await,
            CycleOutcome::Blocked(_)
        ));
        assert_eq!(tab.blocks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unconfigured_does_no_page_work() {
        let (coordinator, tab, _) = setup(false, Settings::new(true, ""), FakeTab::default());

        assert_eq!(
            coordinator.handle(loaded(0)).await,
            CycleOutcome::Skipped(SkipReason::NotConfigured)
        );
        assert_eq!(tab.inspections.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn detached_tab_aborts_cycle() {
        let tab = FakeTab {
            detached: true,
            ..FakeTab::default()
        };
        let (coordinator, tab, _) = setup(false, enabled(), tab);

        assert_eq!(coordinator.handle(loaded(0)).await, CycleOutcome::Aborted);
        assert_eq!(tab.blocks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unresponsive_tab_times_out() {
        let tab = FakeTab {
            hang: true,
            ..FakeTab::default()
        };
        let (coordinator, _, _) = setup(false, enabled(), tab);

        assert_eq!(coordinator.handle(loaded(0)).await, CycleOutcome::Aborted);
    }

    #[tokio::test]
    async fn missing_page_info_skips() {
        let (coordinator, tab, _) = setup(false, enabled(), FakeTab::default());

        assert_eq!(
            coordinator.handle(loaded(0)).await,
            CycleOutcome::Skipped(SkipReason::NoPageInfo)
        );
        assert_eq!(tab.blocks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repeated_url_change_is_ignored() {
        let tab = FakeTab {
            page: Some(page("Feed")),
            ..FakeTab::default()
        };
        let (coordinator, tab, _) = setup(false, enabled(), tab);

        assert!(matches!(
            coordinator.handle(changed("https://example.com/a")).await,
            CycleOutcome::Blocked(_)
        ));
        assert_eq!(
            coordinator.handle(changed("https://example.com/a")).await,
            CycleOutcome::Skipped(SkipReason::SameUrl)
        );
        assert!(matches!(
            coordinator.handle(changed("https://example.com/b")).await,
            CycleOutcome::Blocked(_)
        ));
        assert_eq!(tab.inspections.load(Ordering::SeqCst), 2);
    }

    fn changed(url: &str) -> NavigationEvent {
        NavigationEvent::UrlChanged {
            tab: TabId(7),
            url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn url_change_is_retried_after_inspector_timeout() {
        let tab = FakeTab {
            hang: true,
            ..FakeTab::default()
        };
        let (coordinator, tab, _) = setup(false, enabled(), tab);

        assert_eq!(
            coordinator.handle(changed("https://example.com/a")).await,
            CycleOutcome::Aborted
        );
        assert_eq!(
            coordinator.handle(changed("https://example.com/a")).await,
            CycleOutcome::Aborted
        );
        assert_eq!(tab.inspections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn url_change_is_evaluated_once_enabled() {
        let tab = FakeTab {
            page: Some(page("Feed")),
            ..FakeTab::default()
        };
        let (coordinator, tab, store) =
            setup(false, Settings::new(false, "gsk_0123456789abcdefghij"), tab);

        assert_eq!(
            coordinator.handle(changed("https://example.com/a")).await,
            CycleOutcome::Skipped(SkipReason::Disabled)
        );

        store.set(SettingsPatch::enabled(true)).await.unwrap();
        assert!(matches!(
            coordinator.handle(changed("https://example.com/a")).await,
            CycleOutcome::Blocked(_)
        ));
        assert_eq!(tab.blocks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_deserialize_from_wire_format() {
        let loaded: NavigationEvent =
            serde_json::from_str(r#"{"kind":"page_loaded","tab":3}"#).unwrap();
        assert_eq!(loaded, NavigationEvent::PageLoaded { tab: TabId(3), frame: 0 });

        let changed: NavigationEvent =
            serde_json::from_str(r#"{"kind":"url_changed","tab":3,"url":"https://a.test/"}"#)
                .unwrap();
        assert_eq!(changed.tab(), TabId(3));
    }
}
