//! Headless list view-model over a live log query

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::model::{NetworkLog, NetworkLogSummary};
use crate::store::LogStore;

/// Quiet period before a changed search query is applied
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
/// Maximum number of summaries listed
pub const DEFAULT_LIMIT: u64 = 5000;

/// What the log list shows
#[derive(Debug, Clone, PartialEq)]
pub enum FeedState {
    Loading,
    Logs(Vec<NetworkLogSummary>),
    Empty,
    Error(String),
}

/// Result of selecting a log from the list
#[derive(Debug, Clone, PartialEq)]
pub enum SelectedLog {
    Loaded(NetworkLog),
    NotFound(String),
    Error(String),
}

/// Live, searchable list of captured exchanges
pub struct LogFeed {
    store: Arc<dyn LogStore>,
    query: watch::Sender<String>,
    state: watch::Receiver<FeedState>,
    task: JoinHandle<()>,
}

impl LogFeed {
    /// Start listing all logs. Must be called within a tokio runtime.
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self::with_settings(store, DEFAULT_DEBOUNCE, DEFAULT_LIMIT)
    }

    pub fn with_settings(store: Arc<dyn LogStore>, debounce: Duration, limit: u64) -> Self {
        let (query_tx, query_rx) = watch::channel(String::new());
        let (state_tx, state_rx) = watch::channel(FeedState::Loading);

        let task = tokio::spawn(run_feed(store.clone(), query_rx, state_tx, debounce, limit));

        Self {
            store,
            query: query_tx,
            state: state_rx,
            task,
        }
    }

    /// Change the search query; applied once it stops changing
    pub fn set_query(&self, query: impl Into<String>) {
        self.query.send_replace(query.into());
    }

    pub fn query(&self) -> String {
        self.query.borrow().clone()
    }

    pub fn state(&self) -> FeedState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedState> {
        self.state.clone()
    }

    pub async fn select(&self, id: &str) -> SelectedLog {
        match self.store.get_by_id(id).await {
            Ok(Some(log)) => SelectedLog::Loaded(log),
            Ok(None) => SelectedLog::NotFound(id.to_string()),
            Err(e) => SelectedLog::Error(e.to_string()),
        }
    }

    pub async fn clear_all(&self) -> Result<(), StoreError> {
        self.store.clear_all().await
    }
}

impl Drop for LogFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_feed(
    store: Arc<dyn LogStore>,
    mut query_rx: watch::Receiver<String>,
    state_tx: watch::Sender<FeedState>,
    debounce: Duration,
    limit: u64,
) {
    let mut query = query_rx.borrow_and_update().clone();

    loop {
        debug!("Listing logs for query {:?}", query);
        state_tx.send_replace(FeedState::Loading);
        let mut live = store.query_filtered(&query, limit);

        // Follow the live query until the search query changes
        loop {
            tokio::select! {
                item = live.next() => match item {
                    Some(Ok(logs)) if logs.is_empty() => {
                        state_tx.send_replace(FeedState::Empty);
                    }
                    Some(Ok(logs)) => {
                        state_tx.send_replace(FeedState::Logs(logs));
                    }
                    Some(Err(e)) => {
                        warn!("Live log query failed: {}", e);
                        state_tx.send_replace(FeedState::Error(e.to_string()));
                    }
                    None => {
                        if query_rx.changed().await.is_err() {
                            return;
                        }
                        break;
                    }
                },
                changed = query_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
            }
        }

        // Debounce: wait for a quiet period
        loop {
            match tokio::time::timeout(debounce, query_rx.changed()).await {
                Err(_) => break,
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return,
            }
        }
        query = query_rx.borrow_and_update().clone();
    }
}
