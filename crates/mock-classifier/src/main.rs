//! Local stand-in for the chat-completion classifier endpoint.
//!
//! Labels a prompt by looking for learning signals in its title, channel and
//! description lines. Good enough to drive the host end to end without an
//! API key.

use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use mindure_core::classifier::EDUCATIONAL_SIGNALS;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Channels treated as educational regardless of title.
const KNOWN_CHANNELS: &[&str] = &[
    "mit opencourseware",
    "khan academy",
    "3blue1brown",
    "crashcourse",
    "computerphile",
];

/// Hosts treated as educational regardless of title.
const KNOWN_HOSTS: &[&str] = &[
    "docs.rs",
    "doc.rust-lang.org",
    "developer.mozilla.org",
    "stackoverflow.com",
    "github.com",
    "arxiv.org",
    "khanacademy.org",
    "coursera.org",
    "edx.org",
    "wikipedia.org",
];

#[derive(Deserialize)]
struct ChatRequest {
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

/// Value of the first `Name: value` line in the prompt.
fn field<'a>(prompt: &'a str, name: &str) -> Option<&'a str> {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
        .map(str::trim)
}

fn label(prompt: &str) -> &'static str {
    let title = field(prompt, "Title").unwrap_or_default().to_lowercase();
    let url = field(prompt, "URL").unwrap_or_default().to_lowercase();
    let channel = field(prompt, "Video Channel").map(str::to_lowercase);
    let description = field(prompt, "Video Description")
        .unwrap_or_default()
        .to_lowercase();

    let signal = EDUCATIONAL_SIGNALS
        .iter()
        .any(|s| title.contains(s) || description.contains(s));
    let known_channel = channel
        .as_deref()
        .is_some_and(|c| KNOWN_CHANNELS.iter().any(|k| c.contains(k)));
    let known_host = KNOWN_HOSTS.iter().any(|h| url.contains(h));

    if signal || known_channel || known_host {
        "EDUCATIONAL"
    } else {
        "DISTRACTING"
    }
}

async fn chat_completions(headers: HeaderMap, Json(body): Json<ChatRequest>) -> (StatusCode, Json<Value>) {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer ") && v.len() > "Bearer ".len());
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": { "message": "missing bearer token" } })),
        );
    }

    // Simulate inference latency (20-120ms)
    let delay = rand::thread_rng().gen_range(20..=120);
    tokio::time::sleep(Duration::from_millis(delay)).await;

    let prompt = body
        .messages
        .last()
        .map(|m| m.content.as_str())
        .unwrap_or_default();
    let content = if prompt == "Test message" {
        "OK"
    } else {
        label(prompt)
    };

    tracing::info!(label = content, latency_ms = delay, "completion served");

    (
        StatusCode::OK,
        Json(json!({
            "id": format!("chatcmpl-mock-{}", rand::thread_rng().gen::<u32>()),
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }],
        })),
    )
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let app = Router::new()
        .route("/openai/v1/chat/completions", post(chat_completions))
        .route("/health", get(health));

    let addr = "127.0.0.1:3000";
    tracing::info!(addr, "mock classifier starting");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind to {addr}: {e}"));
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindure_core::classifier::build_prompt;
    use mindure_core::PageDescriptor;

    #[test]
    fn lecture_from_known_channel_is_educational() {
        let page = PageDescriptor::new(
            "Intro to Algorithms - MIT Lecture",
            "https://youtube.com/watch?v=x",
            "youtube.com",
        )
        .with_video_channel("MIT OpenCourseWare");
        assert_eq!(label(&build_prompt(&page)), "EDUCATIONAL");
    }

    #[test]
    fn entertainment_video_is_distracting() {
        let page = PageDescriptor::new(
            "I Survived 100 Days",
            "https://youtube.com/watch?v=y",
            "youtube.com",
        )
        .with_video_channel("MrBeast");
        assert_eq!(label(&build_prompt(&page)), "DISTRACTING");
    }

    #[test]
    fn prompt_boilerplate_does_not_leak_into_signal() {
        // The instructions themselves mention every signal word.
        let page = PageDescriptor::new("Home", "https://shop.example/", "shop.example");
        assert_eq!(label(&build_prompt(&page)), "DISTRACTING");
    }

    #[test]
    fn field_extraction() {
        let prompt = "Title: A: B\nURL: https://x.test/\n";
        assert_eq!(field(prompt, "Title"), Some("A: B"));
        assert_eq!(field(prompt, "Video Channel"), None);
    }
}
