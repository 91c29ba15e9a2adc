//! Log persistence interface and the in-memory store

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::model::{NetworkLog, NetworkLogSummary};

/// Live result of [`LogStore::query_filtered`]
pub type SummaryStream = BoxStream<'static, Result<Vec<NetworkLogSummary>, StoreError>>;

/// Capacity of the change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Persistence for captured exchanges.
///
/// Filtering matches the query as a substring of the URL, the method or the
/// status code; an empty query matches everything. Results are ordered by
/// request timestamp, most recent first.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Insert a log, replacing any row with the same id
    async fn insert(&self, log: NetworkLog) -> Result<(), StoreError>;

    async fn insert_many(&self, logs: Vec<NetworkLog>) -> Result<(), StoreError> {
        for log in logs {
            self.insert(log).await?;
        }
        Ok(())
    }

    /// Summaries matching `query`, re-emitted every time the store changes.
    ///
    /// The first item is emitted immediately.
    fn query_filtered(&self, query: &str, limit: u64) -> SummaryStream;

    async fn query_page(
        &self,
        query: &str,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<NetworkLog>, StoreError>;

    async fn get_by_id(&self, id: &str) -> Result<Option<NetworkLog>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    async fn clear_all(&self) -> Result<(), StoreError>;

    async fn delete(&self, log: &NetworkLog) -> Result<(), StoreError>;
}

/// Change notifications shared by store implementations
#[derive(Debug, Clone)]
pub(crate) struct ChangeNotifier {
    tx: broadcast::Sender<()>,
}

impl ChangeNotifier {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn notify(&self) {
        // No subscribers is fine
        let _ = self.tx.send(());
    }

    /// Run `fetch` now and again after every change
    pub(crate) fn live_query<F, Fut>(&self, fetch: F) -> SummaryStream
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<NetworkLogSummary>, StoreError>> + Send + 'static,
    {
        // Subscribe before the first fetch so no change is missed
        let changes = self.tx.subscribe();

        stream::unfold(
            (changes, fetch, true),
            |(mut changes, fetch, first)| async move {
                if !first {
                    match changes.recv().await {
                        Ok(()) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("Live query lagged behind {} changes", skipped);
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
                let result = fetch().await;
                Some((result, (changes, fetch, false)))
            },
        )
        .boxed()
    }
}

/// Whether a log matches a filter query
pub(crate) fn matches_query(query: &str, url: &str, method: &str, status: Option<u16>) -> bool {
    if query.is_empty() {
        return true;
    }
    let query = query.to_ascii_lowercase();
    url.to_ascii_lowercase().contains(&query)
        || method.to_ascii_lowercase().contains(&query)
        || status.is_some_and(|s| s.to_string().contains(&query))
}

/// In-memory log store.
///
/// Cheap to clone; clones share the same logs.
#[derive(Clone)]
pub struct MemoryLogStore {
    logs: Arc<RwLock<Vec<NetworkLog>>>,
    changes: ChangeNotifier,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self {
            logs: Arc::new(RwLock::new(Vec::new())),
            changes: ChangeNotifier::new(),
        }
    }

    /// All matching logs, most recent first
    async fn filtered(&self, query: &str) -> Vec<NetworkLog> {
        let logs = self.logs.read().await;
        let mut matching: Vec<NetworkLog> = logs
            .iter()
            .filter(|log| {
                matches_query(
                    query,
                    &log.request_url,
                    &log.request_method,
                    log.response_status_code,
                )
            })
            .cloned()
            .collect();
        // None sorts after every timestamp
        matching.sort_by(|a, b| b.request_timestamp.cmp(&a.request_timestamp));
        matching
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn insert(&self, log: NetworkLog) -> Result<(), StoreError> {
        {
            let mut logs = self.logs.write().await;
            match logs.iter_mut().find(|existing| existing.id == log.id) {
                Some(existing) => *existing = log,
                None => logs.push(log),
            }
        }
        self.changes.notify();
        Ok(())
    }

    fn query_filtered(&self, query: &str, limit: u64) -> SummaryStream {
        let store = self.clone();
        let query = query.to_string();
        self.changes.live_query(move || {
            let store = store.clone();
            let query = query.clone();
            async move {
                Ok(store
                    .filtered(&query)
                    .await
                    .iter()
                    .take(limit as usize)
                    .map(NetworkLog::summary)
                    .collect())
            }
        })
    }

    async fn query_page(
        &self,
        query: &str,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<NetworkLog>, StoreError> {
        Ok(self
            .filtered(query)
            .await
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<NetworkLog>, StoreError> {
        let logs = self.logs.read().await;
        Ok(logs.iter().find(|log| log.id == id).cloned())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.logs.read().await.len() as u64)
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        self.logs.write().await.clear();
        self.changes.notify();
        Ok(())
    }

    async fn delete(&self, log: &NetworkLog) -> Result<(), StoreError> {
        self.logs.write().await.retain(|existing| existing.id != log.id);
        self.changes.notify();
        Ok(())
    }
}
