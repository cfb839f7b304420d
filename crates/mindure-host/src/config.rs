use mindure_cache::{DecisionCache, SystemClock};
use mindure_core::{ChatClassifier, ClassifierConfig, DecisionEngine};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_policy")]
    pub policy: String,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettingsConfig {
    #[serde(default = "default_settings_path")]
    pub path: PathBuf,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn build(&self) -> Result<DecisionCache, mindure_cache::CacheError> {
        DecisionCache::new(&self.policy, self.capacity, self.ttl(), Arc::new(SystemClock))
    }
}

impl BridgeConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            capacity: default_capacity(),
            ttl_seconds: default_ttl(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: default_reply_timeout_ms(),
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            path: default_settings_path(),
        }
    }
}

/// Compare old and new config, apply what can change at runtime.
///
/// - TTL changed → updated in place, entries kept
/// - Policy or capacity changed → cache rebuilt (entries dropped)
/// - Classifier changed → new client swapped in; in-flight calls finish on the old one
/// - Listen address, bridge timeout, settings path → WARN, restart required
///
/// Returns the config that is actually live afterwards: sections that were
/// rejected or need a restart keep their old values, so the next reload is
/// compared against what is running.
pub fn diff_and_apply(old: &Config, new: &Config, engine: &DecisionEngine) -> Config {
    let mut live = new.clone();

    if old.server.listen_addr != new.server.listen_addr
        || old.bridge.reply_timeout_ms != new.bridge.reply_timeout_ms
        || old.settings.path != new.settings.path
    {
        tracing::warn!("server, bridge or settings change detected — ignoring. Restart to apply");
        live.server = old.server.clone();
        live.bridge = old.bridge.clone();
        live.settings = old.settings.clone();
    }

    let rebuild = old.cache.policy != new.cache.policy || old.cache.capacity != new.cache.capacity;

    if rebuild {
        match new.cache.build() {
            Ok(cache) => {
                engine.replace_cache(cache);
                tracing::info!(
                    old_policy = %old.cache.policy,
                    new_policy = %new.cache.policy,
                    capacity = new.cache.capacity,
                    "config reloaded: cache policy changed. Cache cleared."
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "config reloaded: invalid cache settings, keeping old cache");
                live.cache = old.cache.clone();
            }
        }
    } else if old.cache.ttl_seconds != new.cache.ttl_seconds {
        engine.cache().set_ttl(new.cache.ttl());
        tracing::info!(
            old = old.cache.ttl_seconds,
            new = new.cache.ttl_seconds,
            "config reloaded: TTL changed"
        );
    }

    if old.classifier != new.classifier {
        match ChatClassifier::new(new.classifier.clone()) {
            Ok(classifier) => {
                engine.replace_classifier(Box::new(classifier));
                tracing::info!(
                    endpoint = %new.classifier.endpoint,
                    model = %new.classifier.model,
                    "config reloaded: classifier changed"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "config reloaded: failed to build classifier, keeping old one");
                live.classifier = old.classifier.clone();
            }
        }
    }

    live
}

fn default_listen_addr() -> String {
    "127.0.0.1:7878".to_string()
}
fn default_policy() -> String {
    "unbounded".to_string()
}
fn default_capacity() -> usize {
    10_000
}
fn default_ttl() -> u64 {
    3600
}
fn default_reply_timeout_ms() -> u64 {
    5000
}
fn default_settings_path() -> PathBuf {
    PathBuf::from("settings.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindure_core::PageDescriptor;

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:7878");
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.cache.ttl(), Duration::from_secs(3600));
        assert_eq!(config.classifier.model, "llama3-8b-8192");
        assert_eq!(config.bridge.reply_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            policy = "lru"
            capacity = 256

            [classifier]
            endpoint = "http://127.0.0.1:3000/openai/v1/chat/completions"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.policy, "lru");
        assert_eq!(config.cache.ttl_seconds, 3600);
        assert_eq!(config.classifier.max_tokens, 10);
        assert!(config.classifier.endpoint.starts_with("http://127.0.0.1:3000"));
        assert_eq!(config.cache.build().unwrap().capacity(), Some(256));
    }

    #[test]
    fn unknown_policy_fails_to_build() {
        let cache = CacheConfig {
            policy: "sieve".into(),
            ..CacheConfig::default()
        };
        assert!(cache.build().is_err());
    }

    #[tokio::test]
    async fn ttl_change_keeps_entries_policy_change_clears() {
        let old = Config::default();
        let engine = DecisionEngine::new(
            old.cache.build().unwrap(),
            Box::new(ChatClassifier::new(old.classifier.clone()).unwrap()),
        );
        let key = PageDescriptor::new("t", "https://a.test/", "a.test").cache_key();
        engine.cache().put(key.as_str(), true);

        let mut new = old.clone();
        new.cache.ttl_seconds = 600;
        diff_and_apply(&old, &new, &engine);
        assert_eq!(engine.cache().ttl(), Duration::from_secs(600));
        assert!(engine.cache().get(key.as_str()).is_some());

        let mut newer = new.clone();
        newer.cache.policy = "lru".into();
        diff_and_apply(&new, &newer, &engine);
        assert_eq!(engine.cache().name(), "LRU");
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn rejected_cache_section_is_not_remembered() {
        let old = Config::default();
        let engine = DecisionEngine::new(
            old.cache.build().unwrap(),
            Box::new(ChatClassifier::new(old.classifier.clone()).unwrap()),
        );
        let key = PageDescriptor::new("t", "https://a.test/", "a.test").cache_key();
        engine.cache().put(key.as_str(), true);

        let mut broken = old.clone();
        broken.cache.policy = "sieve".into();
        let live = diff_and_apply(&old, &broken, &engine);
        assert_eq!(live.cache.policy, "unbounded");

        // Reverting the file matches what is running: nothing is rebuilt.
        let live = diff_and_apply(&live, &old, &engine);
        assert_eq!(live.cache.policy, "unbounded");
        assert!(engine.cache().get(key.as_str()).is_some());
    }
}
