//! Network sniffer client library - Public API
//!
//! Attaches to an HTTP client pipeline and records every request/response
//! exchange (metadata and, where the content type allows, bodies) into a
//! log store for later inspection.

pub mod assembler;
pub mod classify;
pub mod config;
pub mod content;
pub mod error;
pub mod exchange;
pub mod feed;
pub mod hooks;
pub mod id;
pub mod model;
pub mod observe;
pub mod pipeline;
pub mod scope;
pub mod store;
#[cfg(feature = "db")]
pub mod store_db;
pub mod transport;

pub use assembler::{LogAssembler, Phase};
pub use classify::{ContentClass, ContentClassifier};
pub use config::{CustomFormatter, CustomPayload, SnifferConfig, SnifferConfigBuilder, TypeHint};
pub use content::{ByteSink, ByteStream, ContentMeta, OutgoingContent};
pub use error::{SnifferError, StoreError, TransportError};
pub use exchange::Exchange;
pub use feed::{FeedState, LogFeed, SelectedLog};
pub use hooks::{ResponseHead, Sniffer, REQUEST_BODY_OMITTED, RESPONSE_BODY_OMITTED};
pub use id::generate_id;
pub use model::{HeaderMultimap, NetworkLog, NetworkLogSummary, RequestEntry, ResponseEntry};
pub use pipeline::{SniffedResponse, SniffingClient, Transport};
pub use scope::SnifferScope;
pub use store::{LogStore, MemoryLogStore, SummaryStream};
#[cfg(feature = "db")]
pub use store_db::{DbLogStore, NetSniff};
pub use transport::{HttpTransport, HttpTransportError};
