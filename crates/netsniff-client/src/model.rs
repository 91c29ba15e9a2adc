//! Captured exchange records

use http::HeaderMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Header name -> values, names and values in the order the transport
/// presented them
pub type HeaderMultimap = IndexMap<String, Vec<String>>;

/// One captured request/response exchange.
///
/// Request fields are known when the request is sent; response fields stay
/// `None` when the exchange failed before a response arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkLog {
    pub id: String,
    pub request_url: String,
    pub request_method: String,
    pub request_headers: HeaderMultimap,
    /// Declared request Content-Type ("" when absent)
    pub request_body_type: String,
    /// Declared request Content-Length (0 when unknown)
    pub request_body_length: i64,
    /// Captured request body (None when skipped by policy)
    pub request_body: Option<String>,

    /// Epoch milliseconds when the request was sent
    pub request_timestamp: Option<i64>,
    /// Epoch milliseconds when the response head arrived
    pub response_timestamp: Option<i64>,
    pub response_status_code: Option<u16>,
    pub response_headers: Option<HeaderMultimap>,
    pub response_body_type: Option<String>,
    pub response_body_length: Option<i64>,
    pub response_body: Option<String>,
    /// e.g. "HTTP/1.1"
    pub protocol: Option<String>,

    /// Set when the exchange failed or was cancelled
    pub error_details: Option<String>,
}

impl NetworkLog {
    /// Whether the exchange ended in an error rather than a response
    pub fn is_failed(&self) -> bool {
        self.error_details.is_some()
    }

    pub fn summary(&self) -> NetworkLogSummary {
        NetworkLogSummary {
            id: self.id.clone(),
            request_url: self.request_url.clone(),
            request_method: self.request_method.clone(),
            response_status_code: self.response_status_code,
            response_body_type: self.response_body_type.clone(),
            request_timestamp: self.request_timestamp,
        }
    }
}

/// List-view projection of a [`NetworkLog`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkLogSummary {
    pub id: String,
    pub request_url: String,
    pub request_method: String,
    pub response_status_code: Option<u16>,
    pub response_body_type: Option<String>,
    pub request_timestamp: Option<i64>,
}

/// Request half of an exchange, staged until the log is assembled
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEntry {
    pub url: String,
    pub method: String,
    pub headers: HeaderMultimap,
    pub body_type: String,
    pub body_length: i64,
    pub body: Option<String>,
    /// Epoch milliseconds when the request entered the pipeline
    pub timestamp: i64,
}

/// Response half of an exchange, staged until the log is assembled
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEntry {
    pub status_code: u16,
    pub headers: HeaderMultimap,
    pub body_type: String,
    pub body_length: i64,
    pub body: Option<String>,
    pub protocol: String,
    pub request_time: i64,
    pub response_time: i64,
}

/// Combine both staged halves into the persisted record
pub(crate) fn assemble(
    id: &str,
    request: RequestEntry,
    response: Option<ResponseEntry>,
    error: Option<String>,
) -> NetworkLog {
    let request_timestamp = Some(
        response
            .as_ref()
            .map(|r| r.request_time)
            .unwrap_or(request.timestamp),
    );

    let mut log = NetworkLog {
        id: id.to_string(),
        request_url: request.url,
        request_method: request.method,
        request_headers: request.headers,
        request_body_type: request.body_type,
        request_body_length: request.body_length,
        request_body: request.body,
        request_timestamp,
        response_timestamp: None,
        response_status_code: None,
        response_headers: None,
        response_body_type: None,
        response_body_length: None,
        response_body: None,
        protocol: None,
        error_details: error,
    };

    if let Some(response) = response {
        log.response_timestamp = Some(response.response_time);
        log.response_status_code = Some(response.status_code);
        log.response_headers = Some(response.headers);
        log.response_body_type = Some(response.body_type);
        log.response_body_length = Some(response.body_length);
        log.response_body = response.body;
        log.protocol = Some(response.protocol);
    }

    log
}

/// Convert an `http` header map into a multimap, keeping value order per name.
///
/// Values that are not visible ASCII are decoded lossily.
pub fn header_multimap(headers: &HeaderMap) -> HeaderMultimap {
    let mut map = HeaderMultimap::new();
    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .map(|v| match v.to_str() {
                Ok(s) => s.to_string(),
                Err(_) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
            })
            .collect();
        map.insert(name.as_str().to_string(), values);
    }
    map
}
