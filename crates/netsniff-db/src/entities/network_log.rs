//! NetworkLog entity: one row per captured request/response exchange

use sea_orm::entity::prelude::*;
use sea_orm::FromQueryResult;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "network_logs")]
pub struct Model {
    /// Exchange identifier (`{epoch_millis}-{random}`)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(column_type = "Text")]
    pub request_url: String,
    pub request_method: String,

    /// JSON-encoded header multimap: {"name": ["value", ...]}
    #[sea_orm(column_type = "Text")]
    pub request_headers: String,

    /// Declared request Content-Type ("" when absent)
    pub request_body_type: String,

    /// Declared request Content-Length (0 when unknown)
    pub request_body_length: i64,

    /// Captured request body, NULL when skipped by policy
    #[sea_orm(column_type = "Text", nullable)]
    pub request_body: Option<String>,

    /// Epoch milliseconds when the request was sent
    pub request_timestamp: Option<i64>,

    /// Epoch milliseconds when the response head arrived
    pub response_timestamp: Option<i64>,

    pub response_status_code: Option<i32>,

    /// JSON-encoded response header multimap
    #[sea_orm(column_type = "Text", nullable)]
    pub response_headers: Option<String>,

    pub response_body_type: Option<String>,
    pub response_body_length: Option<i64>,

    #[sea_orm(column_type = "Text", nullable)]
    pub response_body: Option<String>,

    /// e.g. "HTTP/1.1"
    pub protocol: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_details: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// List-view projection of a row
#[derive(Clone, Debug, PartialEq, FromQueryResult, Serialize, Deserialize)]
pub struct Summary {
    pub id: String,
    pub request_url: String,
    pub request_method: String,
    pub response_status_code: Option<i32>,
    pub response_body_type: Option<String>,
    pub request_timestamp: Option<i64>,
}

impl Column {
    /// Columns selected for [`Summary`] rows
    pub fn summary_columns() -> [Column; 6] {
        [
            Column::Id,
            Column::RequestUrl,
            Column::RequestMethod,
            Column::ResponseStatusCode,
            Column::ResponseBodyType,
            Column::RequestTimestamp,
        ]
    }
}
