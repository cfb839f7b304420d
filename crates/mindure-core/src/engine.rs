//! Decision engine.
//!
//! One evaluation walks `SettingsCheck -> CacheLookup -> (hit | classify)`:
//!
//! - disabled or unconfigured settings resolve to "allow" without touching
//!   the cache or the network;
//! - a live cache entry resolves without a network call;
//! - otherwise the classifier is called, with at most one call in flight per
//!   [`CacheKey`]; later callers for the same key await the first call.
//!
//! Transport failures resolve to "allow" and are never cached. Every label
//! the endpoint does return (including unrecognized ones) is cached.

use crate::classifier::Classifier;
use crate::page::{CacheKey, PageDescriptor};
use crate::settings::Settings;
use arc_swap::ArcSwap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use mindure_cache::DecisionCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Why an evaluation resolved the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionSource {
    Disabled,
    NoCredential,
    Cache,
    Classified,
    TransportError,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::NoCredential => "no-credential",
            Self::Cache => "cache",
            Self::Classified => "classified",
            Self::TransportError => "transport-error",
        }
    }
}

/// Final result of one evaluation. `verdict == true` means allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub verdict: bool,
    pub source: DecisionSource,
}

impl Decision {
    fn allow(source: DecisionSource) -> Self {
        Self {
            verdict: true,
            source,
        }
    }

    pub fn is_blocked(&self) -> bool {
        !self.verdict
    }
}

/// Shared result of one classifier call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Classified(bool),
    TransportError,
}

type InflightCall = Shared<BoxFuture<'static, Resolution>>;

enum Lookup {
    Hit(bool),
    Pending(InflightCall),
}

struct EngineInner {
    cache: ArcSwap<DecisionCache>,
    classifier: ArcSwap<Box<dyn Classifier>>,
    inflight: Mutex<HashMap<CacheKey, InflightCall>>,
    /// Last key evaluated per streaming-video URL. Used to drop a blocked
    /// verdict once the same URL shows up under a new title.
    video_keys: Mutex<HashMap<String, CacheKey>>,
}

/// Cheap to clone; clones share cache, classifier and in-flight registry.
#[derive(Clone)]
pub struct DecisionEngine {
    inner: Arc<EngineInner>,
}

impl DecisionEngine {
    pub fn new(cache: DecisionCache, classifier: Box<dyn Classifier>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                cache: ArcSwap::from_pointee(cache),
                classifier: ArcSwap::from_pointee(classifier),
                inflight: Mutex::new(HashMap::new()),
                video_keys: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn cache(&self) -> Arc<DecisionCache> {
        self.inner.cache.load_full()
    }

    /// Swap in a new cache. Calls already in flight finish writing into the
    /// cache they started with.
    pub fn replace_cache(&self, cache: DecisionCache) {
        self.inner.cache.store(Arc::new(cache));
    }

    pub fn replace_classifier(&self, classifier: Box<dyn Classifier>) {
        self.inner.classifier.store(Arc::new(classifier));
    }

    pub async fn verify_credential(&self, credential: &str) -> bool {
        let classifier = self.inner.classifier.load_full();
        classifier.verify_credential(credential).await
    }

    /// Number of distinct keys with a classifier call outstanding.
    pub fn inflight(&self) -> usize {
        self.inner.inflight.lock().len()
    }

    /// Evaluate `page` against a settings snapshot taken by the caller.
    pub async fn evaluate(&self, page: &PageDescriptor, settings: &Settings) -> Decision {
        let decision = self.resolve(page, settings).await;
        metrics::counter!("mindure_decisions_total", "source" => decision.source.as_str())
            .increment(1);
        tracing::info!(
            url = %page.url,
            verdict = if decision.verdict { "allow" } else { "block" },
            source = decision.source.as_str(),
            "page evaluated"
        );
        decision
    }

    async fn resolve(&self, page: &PageDescriptor, settings: &Settings) -> Decision {
        if !settings.enabled {
            return Decision::allow(DecisionSource::Disabled);
        }
        if !settings.has_credential() {
            tracing::warn!("no API key configured, allowing page");
            return Decision::allow(DecisionSource::NoCredential);
        }

        let key = page.cache_key();
        let cache = self.inner.cache.load_full();

        if page.is_streaming_video() {
            self.drop_stale_video_blocks(&cache, &key);
        }

        if let Some(entry) = cache.get(key.as_str()) {
            tracing::debug!(key = %key, verdict = entry.verdict, "cache HIT");
            return Decision {
                verdict: entry.verdict,
                source: DecisionSource::Cache,
            };
        }

        let call = match self.join_or_start(key, page, &settings.credential, cache) {
            Lookup::Hit(verdict) => {
                return Decision {
                    verdict,
                    source: DecisionSource::Cache,
                }
            }
            Lookup::Pending(call) => call,
        };

        match call.await {
            Resolution::Classified(verdict) => Decision {
                verdict,
                source: DecisionSource::Classified,
            },
            Resolution::TransportError => Decision::allow(DecisionSource::TransportError),
        }
    }

    /// Blocked verdicts on video pages are not allowed to stick: drop the
    /// blocked entry for this key, and for the key previously seen at the same
    /// URL if the title has since changed.
    fn drop_stale_video_blocks(&self, cache: &DecisionCache, key: &CacheKey) {
        let previous = self
            .inner
            .video_keys
            .lock()
            .insert(key.url().to_string(), key.clone());

        if let Some(previous) = previous.filter(|p| p != key) {
            if cache.invalidate_if_blocked(previous.as_str()) {
                tracing::debug!(key = %previous, "dropped blocked verdict for retitled video");
            }
        }
        if cache.invalidate_if_blocked(key.as_str()) {
            tracing::debug!(key = %key, "dropped blocked video verdict before lookup");
        }
    }

    fn join_or_start(
        &self,
        key: CacheKey,
        page: &PageDescriptor,
        credential: &str,
        cache: Arc<DecisionCache>,
    ) -> Lookup {
        let mut inflight = self.inner.inflight.lock();

        if let Some(call) = inflight.get(&key) {
            tracing::debug!(key = %key, "joining in-flight classification");
            return Lookup::Pending(call.clone());
        }

        // A call for this key may have finished between the caller's cache
        // lookup and taking the lock. Finished calls write the cache before
        // leaving the registry, so checking again here is enough.
        if let Some(entry) = cache.get(key.as_str()) {
            return Lookup::Hit(entry.verdict);
        }

        let call = self
            .classify_task(key.clone(), page.clone(), credential.to_string(), cache)
            .boxed()
            .shared();
        inflight.insert(key, call.clone());
        Lookup::Pending(call)
    }

    fn classify_task(
        &self,
        key: CacheKey,
        page: PageDescriptor,
        credential: String,
        cache: Arc<DecisionCache>,
    ) -> impl std::future::Future<Output = Resolution> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let classifier = self.inner.classifier.load_full();

        async move {
            let start = Instant::now();
            tracing::debug!(key = %key, "cache MISS → classifier");

            let resolution = match classifier.classify(&page, &credential).await {
                Ok(verdict) => {
                    cache.put(key.as_str(), verdict);
                    Resolution::Classified(verdict)
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        url = %page.url,
                        latency_ms = start.elapsed().as_millis() as u64,
                        "classifier unavailable, allowing page"
                    );
                    Resolution::TransportError
                }
            };

            inner.inflight.lock().remove(&key);
            resolution
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassifyError;
    use async_trait::async_trait;
    use mindure_cache::{ManualClock, DEFAULT_TTL};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Scripted classifier that counts calls and can be held open.
    struct FakeClassifier {
        calls: Arc<AtomicUsize>,
        reply: Result<bool, u16>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl Classifier for FakeClassifier {
        async fn classify(
            &self,
            _page: &PageDescriptor,
            _credential: &str,
        ) -> Result<bool, ClassifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.reply.map_err(|status| ClassifyError::Status {
                status,
                body: String::new(),
            })
        }
    }

    struct Harness {
        engine: DecisionEngine,
        calls: Arc<AtomicUsize>,
        clock: Arc<ManualClock>,
    }

    fn harness(reply: Result<bool, u16>, gate: Option<Arc<Notify>>) -> Harness {
        let calls = Arc::new(AtomicUsize::new(0));
        let clock = Arc::new(ManualClock::new());
        let cache = DecisionCache::new("unbounded", 0, DEFAULT_TTL, clock.clone()).unwrap();
        let classifier = FakeClassifier {
            calls: Arc::clone(&calls),
            reply,
            gate,
        };
        Harness {
            engine: DecisionEngine::new(cache, Box::new(classifier)),
            calls,
            clock,
        }
    }

    fn configured() -> Settings {
        Settings::new(true, "gsk_0123456789abcdefghij")
    }

    fn docs_page() -> PageDescriptor {
        PageDescriptor::new("std - Rust", "https://doc.rust-lang.org/std/", "doc.rust-lang.org")
    }

    fn video(title: &str, channel: &str) -> PageDescriptor {
        PageDescriptor::new(title, "https://youtube.com/watch?v=y", "youtube.com")
            .with_video_channel(channel)
    }

    #[tokio::test]
    async fn disabled_allows_without_cache_or_classifier() {
        let h = harness(Ok(false), None);
        let decision = h
            .engine
            .evaluate(&docs_page(), &Settings::new(false, "gsk_0123456789abcdefghij"))
            .await;

        assert_eq!(decision, Decision::allow(DecisionSource::Disabled));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.engine.cache().stats().misses, 0);
        assert!(h.engine.cache().is_empty());
    }

    #[tokio::test]
    async fn missing_credential_is_config_outcome() {
        let h = harness(Ok(false), None);
        let decision = h.engine.evaluate(&docs_page(), &Settings::new(true, "")).await;

        assert_eq!(decision, Decision::allow(DecisionSource::NoCredential));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_evaluation_hits_cache() {
        let h = harness(Ok(true), None);
        let first = h.engine.evaluate(&docs_page(), &configured()).await;
        let second = h.engine.evaluate(&docs_page(), &configured()).await;

        assert_eq!(first.source, DecisionSource::Classified);
        assert_eq!(second.source, DecisionSource::Cache);
        assert!(second.verdict);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_triggers_reclassification() {
        let h = harness(Ok(true), None);
        h.engine.evaluate(&docs_page(), &configured()).await;

        h.clock.advance(DEFAULT_TTL + Duration::from_secs(1));
        let decision = h.engine.evaluate(&docs_page(), &configured()).await;

        assert_eq!(decision.source, DecisionSource::Classified);
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transport_failure_allows_and_is_not_cached() {
        let h = harness(Err(500), None);
        let decision = h.engine.evaluate(&docs_page(), &configured()).await;

        assert_eq!(decision, Decision::allow(DecisionSource::TransportError));
        assert!(h.engine.cache().get(docs_page().cache_key().as_str()).is_none());
        assert_eq!(h.engine.inflight(), 0);
    }

    #[tokio::test]
    async fn blocked_video_is_reclassified_under_new_title() {
        let h = harness(Ok(false), None);
        let old = video("I Survived 100 Days", "MrBeast");
        let key = old.cache_key();

        assert!(h.engine.evaluate(&old, &configured()).await.is_blocked());
        assert_eq!(h.engine.cache().get(key.as_str()).map(|e| e.verdict), Some(false));

        let retitled = video("Linear Algebra Lecture 1", "MrBeast");
        let decision = h.engine.evaluate(&retitled, &configured()).await;

        assert_eq!(decision.source, DecisionSource::Classified);
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        assert!(h.engine.cache().get(key.as_str()).is_none());
    }

    #[tokio::test]
    async fn blocked_video_verdict_never_served_from_cache() {
        let h = harness(Ok(false), None);
        let page = video("I Survived 100 Days", "MrBeast");

        h.engine.evaluate(&page, &configured()).await;
        let again = h.engine.evaluate(&page, &configured()).await;

        assert_eq!(again.source, DecisionSource::Classified);
        assert!(again.is_blocked());
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn allowed_video_stays_cached() {
        let h = harness(Ok(true), None);
        let page = video("Intro to Algorithms - MIT Lecture", "MIT OpenCourseWare");

        h.engine.evaluate(&page, &configured()).await;
        let again = h.engine.evaluate(&page, &configured()).await;

        assert_eq!(again.source, DecisionSource::Cache);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn blocked_non_video_page_stays_cached() {
        let h = harness(Ok(false), None);
        let page = PageDescriptor::new("Feed", "https://twitter.com/home", "twitter.com");

        h.engine.evaluate(&page, &configured()).await;
        let again = h.engine.evaluate(&page, &configured()).await;

        assert_eq!(again.source, DecisionSource::Cache);
        assert!(again.is_blocked());
    }

    #[tokio::test]
    async fn concurrent_evaluations_share_one_call() {
        let gate = Arc::new(Notify::new());
        let h = harness(Ok(false), Some(Arc::clone(&gate)));
        let settings = configured();
        let page = docs_page();

        let first = h.engine.evaluate(&page, &settings);
        let second = h.engine.evaluate(&page, &settings);
        let release = async {
            // Let both evaluations register before the classifier answers.
            while h.calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            tokio::task::yield_now().await;
            assert_eq!(h.engine.inflight(), 1);
            gate.notify_one();
        };

        let (a, b, ()) = tokio::join!(first, second, release);

        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
        assert!(a.is_blocked());
        assert_eq!(h.engine.inflight(), 0);
    }

    #[tokio::test]
    async fn different_keys_classify_independently() {
        let h = harness(Ok(true), None);
        let docs = docs_page();
        let other = PageDescriptor::new("crates.io", "https://crates.io/", "crates.io");
        let settings = configured();

        let (a, b) = tokio::join!(
            h.engine.evaluate(&docs, &settings),
            h.engine.evaluate(&other, &settings)
        );

        assert_eq!(a.source, DecisionSource::Classified);
        assert_eq!(b.source, DecisionSource::Classified);
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn scenario_lecture_is_allowed_and_cached() {
        let h = harness(Ok(true), None);
        let page = video("Intro to Algorithms - MIT Lecture", "MIT OpenCourseWare");
        let page = PageDescriptor {
            url: "https://youtube.com/watch?v=x".into(),
            ..page
        };

        let decision = h.engine.evaluate(&page, &configured()).await;
        assert!(decision.verdict);
        assert_eq!(
            h.engine.cache().get(page.cache_key().as_str()).map(|e| e.verdict),
            Some(true)
        );
    }

    #[test]
    fn source_serializes_kebab_case() {
        let json = serde_json::to_string(&Decision::allow(DecisionSource::TransportError)).unwrap();
        assert_eq!(json, r#"{"verdict":true,"source":"transport-error"}"#);
        assert_eq!(DecisionSource::NoCredential.as_str(), "no-credential");
    }
}
