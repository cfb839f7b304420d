//! Chat-completion classifier.
//!
//! Turns a [`PageDescriptor`] into a single-turn prompt, posts it to an
//! OpenAI-compatible `chat/completions` endpoint and reads back one of two
//! labels. Anything other than the educational label counts as distracting.
//! Only failures to get a 2xx answer at all surface as [`ClassifyError`].

use crate::page::PageDescriptor;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::{Duration, Instant};

pub const EDUCATIONAL_LABEL: &str = "educational";
pub const DISTRACTING_LABEL: &str = "distracting";

/// Words in a video's title or description that count as an explicit
/// learning signal.
pub const EDUCATIONAL_SIGNALS: &[&str] = &[
    "learn",
    "tutorial",
    "lecture",
    "course",
    "lesson",
    "explained",
    "how to",
    "documentary",
];

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("classifier request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("classifier returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Anything that can label a page. `Ok(true)` means educational.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, page: &PageDescriptor, credential: &str)
        -> Result<bool, ClassifyError>;

    /// Check that the endpoint accepts `credential`. Used before saving a new
    /// key. Classifiers that cannot check keys reject every key.
    async fn verify_credential(&self, _credential: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_endpoint() -> String {
    "https://api.groq.com/openai/v1/chat/completions".to_string()
}
fn default_model() -> String {
    "llama3-8b-8192".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> u32 {
    10
}
fn default_timeout_ms() -> u64 {
    15_000
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Default, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// reqwest-backed [`Classifier`] for OpenAI-compatible endpoints.
pub struct ChatClassifier {
    client: Client,
    config: ClassifierConfig,
}

impl ChatClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self, ClassifyError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    async fn complete(
        &self,
        prompt: &str,
        credential: &str,
        max_tokens: u32,
    ) -> Result<String, ClassifyError> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
            max_tokens,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(credential)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifyError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.text().await?)
    }
}

#[async_trait]
impl Classifier for ChatClassifier {
    async fn classify(
        &self,
        page: &PageDescriptor,
        credential: &str,
    ) -> Result<bool, ClassifyError> {
        let start = Instant::now();
        let prompt = build_prompt(page);

        let result = self
            .complete(&prompt, credential, self.config.max_tokens)
            .await;
        metrics::histogram!("mindure_classifier_latency_seconds")
            .record(start.elapsed().as_secs_f64());

        let body = match result {
            Ok(body) => body,
            Err(e) => {
                metrics::counter!("mindure_classifier_calls_total", "outcome" => "error")
                    .increment(1);
                return Err(e);
            }
        };

        let label = extract_label(&body);
        let verdict = is_educational(label.as_deref());
        metrics::counter!(
            "mindure_classifier_calls_total",
            "outcome" => if verdict { "educational" } else { "distracting" }
        )
        .increment(1);

        let recognized = label
            .as_deref()
            .is_some_and(|l| matches!(normalize(l).as_str(), EDUCATIONAL_LABEL | DISTRACTING_LABEL));
        if !recognized {
            tracing::warn!(
                url = %page.url,
                label = ?label,
                "unrecognized classifier label, treating as distracting"
            );
        }

        tracing::debug!(
            url = %page.url,
            label = ?label,
            verdict,
            latency_ms = start.elapsed().as_millis() as u64,
            "page classified"
        );

        Ok(verdict)
    }

    async fn verify_credential(&self, credential: &str) -> bool {
        match self.complete("Test message", credential, 5).await {
            Ok(_) => true,
            Err(e) => {
                tracing::info!(error = %e, "credential probe failed");
                false
            }
        }
    }
}

/// Pull `choices[0].message.content` out of a response body. Bodies that
/// don't decode yield `None`.
fn extract_label(body: &str) -> Option<String> {
    let parsed: ChatCompletionResponse = serde_json::from_str(body).ok()?;
    parsed
        .choices
        .into_iter()
        .next()?
        .message?
        .content
}

fn normalize(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Verdict for a raw label: educational only on an exact (trimmed,
/// case-insensitive) match.
pub fn is_educational(label: Option<&str>) -> bool {
    label.is_some_and(|l| normalize(l) == EDUCATIONAL_LABEL)
}

/// Build the single-turn classification prompt for `page`.
pub fn build_prompt(page: &PageDescriptor) -> String {
    let mut prompt = String::with_capacity(1536);

    prompt.push_str(
        "Decide whether this webpage is educational/productive or distracting.\n\n",
    );
    let _ = writeln!(prompt, "Title: {}", page.title);
    let _ = writeln!(prompt, "URL: {}", page.url);
    let _ = writeln!(prompt, "Meta Description: {}", page.meta_description);

    if page.is_streaming_video() {
        if let Some(channel) = page.video_channel.as_deref() {
            let _ = writeln!(prompt, "Video Channel: {channel}");
            if let Some(description) = page.video_description.as_deref() {
                let _ = writeln!(prompt, "Video Description: {description}");
            }
        }
    }

    prompt.push_str(
        "\nEDUCATIONAL/PRODUCTIVE includes:\n\
         - Learning platforms (Khan Academy, Coursera, edX and similar)\n\
         - Reference and documentation sites, programming resources\n\
         - Research papers and academic content\n\
         - Professional development resources\n\
         - Work-related tools and platforms\n\
         \nDISTRACTING includes:\n\
         - Social media (Facebook, Instagram, Twitter, TikTok)\n\
         - General entertainment and streaming video (non-educational videos, Netflix, games)\n\
         - Shopping sites unrelated to work\n\
         - Forums for casual discussion\n\
         - Memes and other time-wasting content\n",
    );

    let _ = write!(
        prompt,
        "\nFor a video page, answer EDUCATIONAL only if the title, description or channel \
         gives an explicit learning signal (for example: {}) or the channel is a known \
         educational channel. Without such a signal, answer DISTRACTING.\n",
        EDUCATIONAL_SIGNALS
            .iter()
            .map(|s| format!("\"{s}\""))
            .collect::<Vec<_>>()
            .join(", ")
    );

    prompt.push_str("\nRespond with exactly one word: \"EDUCATIONAL\" or \"DISTRACTING\".");
    prompt
}
