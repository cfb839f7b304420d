//! WebSocket bridge to per-tab content scripts.
//!
//! Each content script connects to `/ws/tab/{tab_id}`. The host sends
//! `{"id", "action"}` requests (`getPageInfo`, `blockPage`) and the script
//! answers with the same `id`. Scripts can also push navigation events
//! (`pageLoaded`, `urlChanged`) which are forwarded to the coordinator.

use crate::api::AppState;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use mindure_core::{Blocker, CollaboratorError, NavigationEvent, PageDescriptor, PageInspector, TabId};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Message from a content script: either a reply (has `id`) or an event.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Inbound {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default, alias = "page_info")]
    page_info: Option<PageDescriptor>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    frame: Option<u64>,
}

#[derive(Debug, Default)]
struct Reply {
    page_info: Option<PageDescriptor>,
    success: Option<bool>,
    error: Option<String>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Removes a request's reply slot when the request finishes or is dropped
/// (e.g. by a caller's timeout).
struct PendingSlot {
    pending: Pending,
    id: u64,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

struct TabLink {
    outbound: mpsc::UnboundedSender<String>,
    pending: Pending,
    generation: u64,
}

/// Registry of attached tabs. Implements the page inspector and blocker
/// collaborators by round-tripping requests over each tab's socket.
pub struct TabBridge {
    tabs: Mutex<HashMap<TabId, TabLink>>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
    events: mpsc::UnboundedSender<NavigationEvent>,
}

impl TabBridge {
    pub fn new(events: mpsc::UnboundedSender<NavigationEvent>) -> Self {
        Self {
            tabs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            events,
        }
    }

    pub fn attached(&self) -> usize {
        self.tabs.lock().len()
    }

    /// Register a tab's outbound channel. A reconnect replaces the previous
    /// link; the returned generation lets the old connection detach itself
    /// without clobbering the new one.
    fn attach(&self, tab: TabId, outbound: mpsc::UnboundedSender<String>) -> (u64, Pending) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        self.tabs.lock().insert(
            tab,
            TabLink {
                outbound,
                pending: Arc::clone(&pending),
                generation,
            },
        );
        tracing::debug!(tab = %tab, generation, "tab attached");
        (generation, pending)
    }

    fn detach(&self, tab: TabId, generation: u64) {
        let mut tabs = self.tabs.lock();
        if tabs.get(&tab).is_some_and(|l| l.generation == generation) {
            tabs.remove(&tab);
            tracing::debug!(tab = %tab, "tab detached");
        }
    }

    async fn request(&self, tab: TabId, action: &str) -> Result<Reply, CollaboratorError> {
        let (rx, _slot) = {
            let tabs = self.tabs.lock();
            let link = tabs.get(&tab).ok_or(CollaboratorError::Unavailable(tab))?;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            link.pending.lock().insert(id, tx);
            let slot = PendingSlot {
                pending: Arc::clone(&link.pending),
                id,
            };

            let msg = serde_json::json!({ "id": id, "action": action }).to_string();
            if link.outbound.send(msg).is_err() {
                return Err(CollaboratorError::Unavailable(tab));
            }
            (rx, slot)
        };

        rx.await.map_err(|_| CollaboratorError::Unavailable(tab))
    }

    #[cfg(test)]
    fn pending_len(&self, tab: TabId) -> usize {
        self.tabs
            .lock()
            .get(&tab)
            .map_or(0, |link| link.pending.lock().len())
    }

    /// Route one text frame from a tab.
    fn handle_inbound(&self, tab: TabId, pending: &Pending, text: &str) {
        let inbound: Inbound = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(tab = %tab, error = %e, "ignoring malformed tab message");
                return;
            }
        };

        if let Some(id) = inbound.id {
            if let Some(tx) = pending.lock().remove(&id) {
                // Receiver is gone if the coordinator already timed out.
                let _ = tx.send(Reply {
                    page_info: inbound.page_info,
                    success: inbound.success,
                    error: inbound.error,
                });
            }
            return;
        }

        let event = match (inbound.action.as_deref(), inbound.url) {
            (Some("urlChanged" | "youtubeUrlChanged"), Some(url)) => {
                NavigationEvent::UrlChanged { tab, url }
            }
            (Some("pageLoaded"), _) => NavigationEvent::PageLoaded {
                tab,
                frame: inbound.frame.unwrap_or(0),
            },
            (action, _) => {
                tracing::debug!(tab = %tab, ?action, "ignoring unknown tab message");
                return;
            }
        };
        let _ = self.events.send(event);
    }

    /// Drive one tab's socket until it closes.
    pub async fn serve(self: Arc<Self>, tab: TabId, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (generation, pending) = self.attach(tab, tx);

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(Message::Text(msg.into())).await.is_err() {
                    break; // Tab disconnected
                }
            }
        });

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => self.handle_inbound(tab, &pending, text.as_str()),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(tab = %tab, error = %e, "tab socket error");
                    break;
                }
            }
        }

        self.detach(tab, generation);
        writer.abort();
    }
}

#[async_trait]
impl PageInspector for TabBridge {
    async fn page_info(&self, tab: TabId) -> Result<Option<PageDescriptor>, CollaboratorError> {
        Ok(self.request(tab, "getPageInfo").await?.page_info)
    }
}

#[async_trait]
impl Blocker for TabBridge {
    async fn block(&self, tab: TabId) -> Result<(), CollaboratorError> {
        let reply = self.request(tab, "blockPage").await?;
        match reply.success {
            Some(false) => Err(CollaboratorError::BadReply {
                tab,
                reason: reply.error.unwrap_or_else(|| "block refused".to_string()),
            }),
            _ => Ok(()),
        }
    }
}

/// GET /ws/tab/{tab_id} — content script attach point.
pub async fn ws_tab_handler(
    ws: WebSocketUpgrade,
    Path(tab_id): Path<u64>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let bridge = Arc::clone(&state.bridge);
    ws.on_upgrade(move |socket| bridge.serve(TabId(tab_id), socket))
}
