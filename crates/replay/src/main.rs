use clap::Parser;
use futures_util::stream::{self, StreamExt};
use mindure_core::PageDescriptor;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Replays recorded page descriptors against a running host's evaluate endpoint.
#[derive(Parser)]
#[command(name = "replay")]
struct Args {
    /// Host base URL
    #[arg(long, default_value = "http://127.0.0.1:7878")]
    host_url: String,

    /// JSON-lines file, one page descriptor per line
    #[arg(long)]
    file: PathBuf,

    /// Number of evaluations in flight at once
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Replay the whole file this many times (repeats should hit the cache)
    #[arg(long, default_value_t = 1)]
    passes: u32,
}

#[derive(Debug, Deserialize)]
struct EvaluateResponse {
    #[serde(default)]
    verdict: Option<bool>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse a JSON-lines file, skipping blank lines and `#` comments.
fn parse_pages(contents: &str) -> Result<Vec<PageDescriptor>, String> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| format!("line {}: {e}", n + 1))
        })
        .collect()
}

async fn evaluate(client: &Client, host_url: &str, page: &PageDescriptor) -> Result<EvaluateResponse, String> {
    let url = format!("{}/api/evaluate", host_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .json(&serde_json::json!({ "page_info": page }))
        .send()
        .await
        .map_err(|e| e.to_string())?;
    response
        .json::<EvaluateResponse>()
        .await
        .map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let contents = match std::fs::read_to_string(&args.file) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, file = %args.file.display(), "failed to read replay file");
            std::process::exit(1);
        }
    };
    let pages = match parse_pages(&contents) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "invalid replay file");
            std::process::exit(1);
        }
    };

    let client = match Client::builder().timeout(Duration::from_secs(30)).build() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to build HTTP client");
            std::process::exit(1);
        }
    };

    tracing::info!(
        host = %args.host_url,
        pages = pages.len(),
        passes = args.passes,
        concurrency = args.concurrency,
        "replay starting"
    );

    let mut by_source: BTreeMap<String, u64> = BTreeMap::new();
    let mut blocked = 0u64;
    let mut failed = 0u64;
    let start = Instant::now();

    for pass in 1..=args.passes {
        let results: Vec<_> = stream::iter(pages.iter())
            .map(|page| {
                let client = &client;
                let host_url = args.host_url.as_str();
                async move { (page, evaluate(client, host_url, page).await) }
            })
            .buffered(args.concurrency.max(1))
            .collect()
            .await;

        for (page, result) in results {
            match result {
                Ok(EvaluateResponse {
                    verdict: Some(verdict),
                    source,
                    ..
                }) => {
                    let source = source.unwrap_or_else(|| "unknown".to_string());
                    tracing::info!(
                        pass,
                        url = %page.url,
                        title = %page.title,
                        verdict = if verdict { "allow" } else { "block" },
                        source = %source,
                        "evaluated"
                    );
                    if !verdict {
                        blocked += 1;
                    }
                    *by_source.entry(source).or_default() += 1;
                }
                Ok(EvaluateResponse { error, .. }) => {
                    failed += 1;
                    tracing::warn!(url = %page.url, error = ?error, "host refused evaluation");
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(url = %page.url, error = %e, "request failed");
                }
            }
        }
    }

    tracing::info!(
        blocked,
        failed,
        by_source = ?by_source,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "replay finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_lines_with_comments() {
        let contents = r#"
# lecture
{"title":"Intro to Algorithms","url":"https://youtube.com/watch?v=x","domain":"youtube.com","videoChannel":"MIT OpenCourseWare"}

{"title":"Home","url":"https://twitter.com/home","domain":"twitter.com"}
"#;
        let pages = parse_pages(contents).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].video_channel.as_deref(), Some("MIT OpenCourseWare"));
    }

    #[test]
    fn reports_bad_line_number() {
        let err = parse_pages("{\"title\":\"a\"}\n").unwrap_err();
        assert!(err.starts_with("line 1:"));
    }
}
