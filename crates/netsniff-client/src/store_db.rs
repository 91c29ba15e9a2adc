//! Database-backed log store
//!
//! Persists captured exchanges with sea-orm so they survive application
//! restarts. Header multimaps are stored as JSON text.

use async_trait::async_trait;
use netsniff_db::entities::network_log;
use sea_orm::sea_query::{Alias, Expr, LikeExpr, OnConflict};
use sea_orm::{
    Condition, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{HeaderMultimap, NetworkLog, NetworkLogSummary};
use crate::store::{ChangeNotifier, LogStore, SummaryStream};

/// Log store over a sea-orm connection
#[derive(Clone)]
pub struct DbLogStore {
    db: Arc<DatabaseConnection>,
    changes: ChangeNotifier,
}

impl DbLogStore {
    /// Wrap an already migrated connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db: Arc::new(db),
            changes: ChangeNotifier::new(),
        }
    }

    /// Connect to `database_url` and run migrations
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let db = netsniff_db::connect(database_url).await?;
        netsniff_db::migrate(&db).await?;
        Ok(Self::new(db))
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn summaries(
        db: &DatabaseConnection,
        query: &str,
        limit: u64,
    ) -> Result<Vec<NetworkLogSummary>, StoreError> {
        let rows = network_log::Entity::find()
            .select_only()
            .columns(network_log::Column::summary_columns())
            .filter(filter_condition(query))
            .order_by_desc(network_log::Column::RequestTimestamp)
            .limit(limit)
            .into_model::<network_log::Summary>()
            .all(db)
            .await?;

        Ok(rows.into_iter().map(summary_from_row).collect())
    }
}

#[async_trait]
impl LogStore for DbLogStore {
    async fn insert(&self, log: NetworkLog) -> Result<(), StoreError> {
        let id = log.id.clone();
        let model = to_active_model(log)?;

        network_log::Entity::insert(model)
            .on_conflict(
                OnConflict::column(network_log::Column::Id)
                    .update_columns([
                        network_log::Column::RequestUrl,
                        network_log::Column::RequestMethod,
                        network_log::Column::RequestHeaders,
                        network_log::Column::RequestBodyType,
                        network_log::Column::RequestBodyLength,
                        network_log::Column::RequestBody,
                        network_log::Column::RequestTimestamp,
                        network_log::Column::ResponseTimestamp,
                        network_log::Column::ResponseStatusCode,
                        network_log::Column::ResponseHeaders,
                        network_log::Column::ResponseBodyType,
                        network_log::Column::ResponseBodyLength,
                        network_log::Column::ResponseBody,
                        network_log::Column::Protocol,
                        network_log::Column::ErrorDetails,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await?;

        debug!("Log {} written to database", id);
        self.changes.notify();
        Ok(())
    }

    fn query_filtered(&self, query: &str, limit: u64) -> SummaryStream {
        let db = self.db.clone();
        let query = query.to_string();
        self.changes.live_query(move || {
            let db = db.clone();
            let query = query.clone();
            async move { Self::summaries(&db, &query, limit).await }
        })
    }

    async fn query_page(
        &self,
        query: &str,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<NetworkLog>, StoreError> {
        let rows = network_log::Entity::find()
            .filter(filter_condition(query))
            .order_by_desc(network_log::Column::RequestTimestamp)
            .offset(offset)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;

        Ok(rows.into_iter().map(from_model).collect())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<NetworkLog>, StoreError> {
        let row = network_log::Entity::find_by_id(id.to_string())
            .one(self.db.as_ref())
            .await?;
        Ok(row.map(from_model))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(network_log::Entity::find().count(self.db.as_ref()).await?)
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let result = network_log::Entity::delete_many()
            .exec(self.db.as_ref())
            .await?;
        info!("Cleared {} network logs", result.rows_affected);
        self.changes.notify();
        Ok(())
    }

    async fn delete(&self, log: &NetworkLog) -> Result<(), StoreError> {
        network_log::Entity::delete_by_id(log.id.clone())
            .exec(self.db.as_ref())
            .await?;
        self.changes.notify();
        Ok(())
    }
}

/// URL, method or status code containing `query`
fn filter_condition(query: &str) -> Condition {
    if query.is_empty() {
        return Condition::all();
    }

    let status_text = Expr::col(network_log::Column::ResponseStatusCode).cast_as(Alias::new("TEXT"));

    Condition::any()
        .add(Expr::col(network_log::Column::RequestUrl).like(contains_pattern(query)))
        .add(Expr::col(network_log::Column::RequestMethod).like(contains_pattern(query)))
        .add(Expr::expr(status_text).like(contains_pattern(query)))
}

/// `%query%`, with LIKE wildcards inside `query` matched literally
fn contains_pattern(query: &str) -> LikeExpr {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for c in query.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    LikeExpr::new(pattern).escape('\\')
}

fn to_active_model(log: NetworkLog) -> Result<network_log::ActiveModel, StoreError> {
    let response_headers = log
        .response_headers
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    Ok(network_log::ActiveModel {
        id: Set(log.id),
        request_url: Set(log.request_url),
        request_method: Set(log.request_method),
        request_headers: Set(serde_json::to_string(&log.request_headers)?),
        request_body_type: Set(log.request_body_type),
        request_body_length: Set(log.request_body_length),
        request_body: Set(log.request_body),
        request_timestamp: Set(log.request_timestamp),
        response_timestamp: Set(log.response_timestamp),
        response_status_code: Set(log.response_status_code.map(i32::from)),
        response_headers: Set(response_headers),
        response_body_type: Set(log.response_body_type),
        response_body_length: Set(log.response_body_length),
        response_body: Set(log.response_body),
        protocol: Set(log.protocol),
        error_details: Set(log.error_details),
    })
}

fn decode_headers(id: &str, json: &str) -> HeaderMultimap {
    serde_json::from_str(json).unwrap_or_else(|e| {
        debug!("Unreadable headers in log {}: {}", id, e);
        HeaderMultimap::new()
    })
}

fn from_model(model: network_log::Model) -> NetworkLog {
    let request_headers = decode_headers(&model.id, &model.request_headers);
    let response_headers = model
        .response_headers
        .as_deref()
        .map(|json| decode_headers(&model.id, json));

    NetworkLog {
        request_headers,
        response_headers,
        response_status_code: model
            .response_status_code
            .and_then(|s| u16::try_from(s).ok()),
        id: model.id,
        request_url: model.request_url,
        request_method: model.request_method,
        request_body_type: model.request_body_type,
        request_body_length: model.request_body_length,
        request_body: model.request_body,
        request_timestamp: model.request_timestamp,
        response_timestamp: model.response_timestamp,
        response_body_type: model.response_body_type,
        response_body_length: model.response_body_length,
        response_body: model.response_body,
        protocol: model.protocol,
        error_details: model.error_details,
    }
}

fn summary_from_row(row: network_log::Summary) -> NetworkLogSummary {
    NetworkLogSummary {
        id: row.id,
        request_url: row.request_url,
        request_method: row.request_method,
        response_status_code: row.response_status_code.and_then(|s| u16::try_from(s).ok()),
        response_body_type: row.response_body_type,
        request_timestamp: row.request_timestamp,
    }
}

/// Bootstrap for the persistent log store
pub struct NetSniff {
    store: DbLogStore,
}

impl NetSniff {
    /// Open (creating if needed) the log database and run migrations
    pub async fn init(database_url: &str) -> Result<Self, StoreError> {
        let store = DbLogStore::connect(database_url).await?;
        info!("Network log store ready");
        Ok(Self { store })
    }

    /// Handle to the log store
    pub fn dao(&self) -> DbLogStore {
        self.store.clone()
    }
}
