use serde::{Deserialize, Serialize};
use std::fmt;

/// Hosts whose watch pages carry volatile per-video metadata.
const STREAMING_VIDEO_HOSTS: &[&str] = &["youtube.com", "youtu.be"];

/// Separator between the URL and title inside a [`CacheKey`]. Control
/// characters cannot appear in a valid URL, so the split is unambiguous.
const KEY_SEPARATOR: char = '\u{1f}';

/// What the page inspector reports about the page in a tab.
///
/// Produced fresh for every navigation event and never modified afterwards.
/// Field names on the wire are camelCase; the `youtube*` spellings used by
/// older content scripts are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDescriptor {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub meta_description: String,
    pub domain: String,
    #[serde(
        default,
        alias = "youtubeChannel",
        skip_serializing_if = "Option::is_none"
    )]
    pub video_channel: Option<String>,
    #[serde(
        default,
        alias = "youtubeDescription",
        skip_serializing_if = "Option::is_none"
    )]
    pub video_description: Option<String>,
}

impl PageDescriptor {
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            meta_description: String::new(),
            domain: domain.into(),
            video_channel: None,
            video_description: None,
        }
    }

    pub fn with_meta_description(mut self, meta: impl Into<String>) -> Self {
        self.meta_description = meta.into();
        self
    }

    pub fn with_video_channel(mut self, channel: impl Into<String>) -> Self {
        self.video_channel = Some(channel.into());
        self
    }

    pub fn with_video_description(mut self, description: impl Into<String>) -> Self {
        self.video_description = Some(description.into());
        self
    }

    /// Whether this page lives on a streaming-video host (the host itself or
    /// any subdomain of it, e.g. `m.youtube.com`).
    pub fn is_streaming_video(&self) -> bool {
        is_streaming_video_domain(&self.domain)
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.url, &self.title)
    }
}

pub fn is_streaming_video_domain(domain: &str) -> bool {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    STREAMING_VIDEO_HOSTS.iter().any(|host| {
        domain == *host
            || domain
                .strip_suffix(host)
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

/// Identity of a page for memoization: URL plus title.
///
/// The title is part of the key because single-page apps re-render
/// different content under one URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(url: &str, title: &str) -> Self {
        let mut key = String::with_capacity(url.len() + title.len() + 1);
        key.push_str(url);
        key.push(KEY_SEPARATOR);
        key.push_str(title);
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The URL half of the key.
    pub fn url(&self) -> &str {
        self.0
            .split_once(KEY_SEPARATOR)
            .map(|(url, _)| url)
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.split_once(KEY_SEPARATOR) {
            Some((url, title)) => write!(f, "{url} [{title}]"),
            None => f.write_str(&self.0),
        }
    }
}

impl From<&PageDescriptor> for CacheKey {
    fn from(page: &PageDescriptor) -> Self {
        page.cache_key()
    }
}
