mod api;
mod bridge;
mod config;
mod settings_file;

use api::{
    credential_handler, evaluate_handler, navigation_handler, reload_handler, stats_handler,
    status_handler, toggle_handler, AppState,
};
use axum::routing::{get, post};
use axum::Router;
use bridge::{ws_tab_handler, TabBridge};
use config::Config;
use mindure_cache::DecisionCache;
use mindure_core::{
    ChatClassifier, Controller, DecisionEngine, NavigationCoordinator, NavigationEvent,
    SettingsStore,
};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use settings_file::FileSettingsStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config_path = std::env::var_os("MINDURE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    // Load config
    let config = if config_path.exists() {
        match Config::load(&config_path) {
            Ok(c) => {
                tracing::info!(path = %config_path.display(), "loaded config");
                c
            }
            Err(e) => {
                tracing::error!(error = %e, path = %config_path.display(), "failed to load config, using defaults");
                Config::default()
            }
        }
    } else {
        tracing::info!(path = %config_path.display(), "no config file found, using defaults");
        Config::default()
    };

    // Install Prometheus metrics recorder
    let prom_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .unwrap_or_else(|e| panic!("failed to install prometheus recorder: {e}"));

    let settings = Arc::new(FileSettingsStore::open(&config.settings.path));
    settings.watch();
    let settings_store: Arc<dyn SettingsStore> = settings.clone();

    let cache = config.cache.build().unwrap_or_else(|e| {
        tracing::error!(error = %e, "invalid cache config, using unbounded cache");
        DecisionCache::with_defaults()
    });
    let classifier = ChatClassifier::new(config.classifier.clone())
        .unwrap_or_else(|e| panic!("failed to build classifier client: {e}"));
    let engine = DecisionEngine::new(cache, Box::new(classifier));

    // Navigation events from HTTP intake and tab sockets share one queue
    let (events_tx, events_rx) = mpsc::unbounded_channel::<NavigationEvent>();
    let bridge = Arc::new(TabBridge::new(events_tx.clone()));

    let coordinator = Arc::new(
        NavigationCoordinator::new(
            Arc::clone(&settings_store),
            engine.clone(),
            bridge.clone(),
            bridge.clone(),
        )
        .with_reply_timeout(config.bridge.reply_timeout()),
    );
    tokio::spawn(dispatch_navigation(events_rx, coordinator));

    let state = Arc::new(AppState {
        controller: Controller::new(settings_store, engine.clone()),
        engine: engine.clone(),
        bridge,
        events: events_tx,
    });

    let app = router(state)
        .route(
            "/metrics",
            get(move || {
                let h = prom_handle.clone();
                async move { h.render() }
            }),
        )
        .layer(TraceLayer::new_for_http());

    let addr = config.server.listen_addr.clone();
    tracing::info!(
        addr = %addr,
        endpoint = %config.classifier.endpoint,
        model = %config.classifier.model,
        policy = %config.cache.policy,
        ttl_seconds = config.cache.ttl_seconds,
        settings = %settings.path().display(),
        "mindure host starting"
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind to {addr}: {e}"));

    // Spawn config file watcher
    spawn_config_watcher(config_path, config, engine);

    // Spawn shutdown signal handler
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "server error");
    }

    tracing::info!("mindure host shut down");
}

/// HTTP and WebSocket routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/toggle", post(toggle_handler))
        .route("/api/status", get(status_handler))
        .route("/api/reload", post(reload_handler))
        .route("/api/evaluate", post(evaluate_handler))
        .route("/api/credential", post(credential_handler))
        .route("/api/navigation", post(navigation_handler))
        .route("/api/stats", get(stats_handler))
        .route("/ws/tab/{tab_id}", get(ws_tab_handler))
        .with_state(state)
}

/// Run each navigation event as its own task so a slow classification on one
/// tab never delays another.
async fn dispatch_navigation(
    mut events: mpsc::UnboundedReceiver<NavigationEvent>,
    coordinator: Arc<NavigationCoordinator>,
) {
    while let Some(event) = events.recv().await {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator.handle(event).await;
        });
    }
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "no SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}

/// Spawn a filesystem watcher on the config file that applies safe changes at runtime.
fn spawn_config_watcher(config_path: PathBuf, initial_config: Config, engine: DecisionEngine) {
    if !Path::new(&config_path).exists() {
        return;
    }
    let current_config = Arc::new(Mutex::new(initial_config));

    let config_path_clone = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                match Config::load(&config_path_clone) {
                    Ok(new_config) => {
                        let mut old = current_config.lock();
                        *old = config::diff_and_apply(&old, &new_config, &engine);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to reload config");
                    }
                }
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, "failed to watch config file");
        return;
    }

    // Leak the watcher so it lives for the process lifetime
    std::mem::forget(watcher);
    tracing::info!("config file watcher started");
}
