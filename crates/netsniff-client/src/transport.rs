//! HTTP/1.1 transport
//!
//! Uses hyper with a small per-authority connection pool. Only `http://`
//! URLs are supported.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use http::header::{HeaderValue, CONTENT_TYPE, HOST};
use http::uri::{PathAndQuery, Uri};
use http::{Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tracing::debug;

use crate::content::{ByteStream, OutgoingContent};
use crate::error::TransportError;
use crate::hooks::merge_missing_headers;
use crate::pipeline::Transport;

/// Maximum number of pooled connections per authority
const MAX_POOL_SIZE: usize = 10;

type RequestBody = UnsyncBoxBody<Bytes, io::Error>;
type Sender = http1::SendRequest<RequestBody>;

#[derive(Debug, Error)]
pub enum HttpTransportError {
    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),
}

/// Idle connections by authority
#[derive(Default)]
struct Pool {
    idle: Mutex<HashMap<String, Vec<Sender>>>,
}

impl Pool {
    fn checkout(&self, authority: &str) -> Option<Sender> {
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        let senders = idle.get_mut(authority)?;
        while let Some(sender) = senders.pop() {
            if sender.is_ready() {
                debug!("Reusing pooled connection to {}", authority);
                return Some(sender);
            }
            debug!("Discarding stale connection from pool");
        }
        None
    }

    fn checkin(&self, authority: &str, sender: Sender) {
        if sender.is_closed() {
            debug!("Not returning closed connection to pool");
            return;
        }

        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        let senders = idle.entry(authority.to_string()).or_default();
        if senders.len() < MAX_POOL_SIZE {
            senders.push(sender);
            debug!(
                "Returned connection to pool (size: {})",
                senders.len()
            );
        }
    }
}

/// Plain HTTP/1.1 transport over TCP
#[derive(Clone, Default)]
pub struct HttpTransport {
    pool: Arc<Pool>,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn connect(&self, authority: &str) -> Result<Sender, HttpTransportError> {
        if let Some(sender) = self.pool.checkout(authority) {
            return Ok(sender);
        }

        debug!("Creating new connection to {}", authority);
        let stream = TcpStream::connect(authority).await.map_err(|e| {
            HttpTransportError::ConnectionFailed(format!("Failed to connect to {}: {}", authority, e))
        })?;

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| HttpTransportError::ConnectionFailed(format!("HTTP handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Connection closed: {}", e);
            }
        });

        Ok(sender)
    }
}

/// `host:port` to connect to, and the Host header value
fn target(uri: &Uri) -> Result<(String, String), HttpTransportError> {
    match uri.scheme_str() {
        Some("http") => {}
        other => {
            return Err(HttpTransportError::InvalidUrl(format!(
                "unsupported scheme {:?} in {}",
                other.unwrap_or(""),
                uri
            )))
        }
    }

    let authority = uri
        .authority()
        .ok_or_else(|| HttpTransportError::InvalidUrl(format!("missing host in {}", uri)))?;
    let port = authority.port_u16().unwrap_or(80);

    Ok((
        format!("{}:{}", authority.host(), port),
        authority.as_str().to_string(),
    ))
}

fn request_body(content: OutgoingContent, handle: &Handle) -> RequestBody {
    match content {
        OutgoingContent::NoContent { .. } | OutgoingContent::ProtocolUpgrade { .. } => {
            Empty::new().map_err(|never| match never {}).boxed_unsync()
        }
        OutgoingContent::Bytes { bytes, .. } => {
            Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
        }
        streamed => {
            let frames = streamed.into_byte_stream(handle).map_ok(Frame::data);
            StreamBody::new(frames).boxed_unsync()
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: Request<OutgoingContent>,
    ) -> Result<Response<ByteStream>, TransportError> {
        let (mut parts, content) = request.into_parts();
        let (address, host) = target(&parts.uri)?;

        if !parts.headers.contains_key(HOST) {
            let value = HeaderValue::from_str(&host)
                .map_err(|e| HttpTransportError::InvalidUrl(e.to_string()))?;
            parts.headers.insert(HOST, value);
        }
        let meta = content.meta();
        if let Some(content_type) = &meta.content_type {
            if !parts.headers.contains_key(CONTENT_TYPE) {
                let value = HeaderValue::from_str(content_type)
                    .map_err(|e| HttpTransportError::InvalidUrl(e.to_string()))?;
                parts.headers.insert(CONTENT_TYPE, value);
            }
        }
        merge_missing_headers(&mut parts.headers, &meta.headers);

        // Origin-form request target
        let path = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        parts.uri = Uri::from(path);

        let body = request_body(content, &Handle::current());
        let mut sender = self.connect(&address).await?;
        sender
            .ready()
            .await
            .map_err(|e| HttpTransportError::ConnectionFailed(e.to_string()))?;

        let response = sender
            .send_request(Request::from_parts(parts, body))
            .await
            .map_err(|e| HttpTransportError::RequestFailed(format!("Failed to send request: {}", e)))?;

        let (parts, incoming) = response.into_parts();
        let frames = BodyStream::new(incoming);

        // Hand the connection back once the body has been read to the end
        let pool = self.pool.clone();
        let body = stream::unfold(
            (frames, Some(sender), pool, address),
            |(mut frames, mut sender, pool, address)| async move {
                loop {
                    match frames.next().await {
                        Some(Ok(frame)) => {
                            if let Ok(data) = frame.into_data() {
                                return Some((Ok(data), (frames, sender, pool, address)));
                            }
                        }
                        Some(Err(e)) => {
                            let error = io::Error::new(io::ErrorKind::Other, e);
                            return Some((Err(error), (frames, None, pool, address)));
                        }
                        None => {
                            if let Some(sender) = sender.take() {
                                pool.checkin(&address, sender);
                            }
                            return None;
                        }
                    }
                }
            },
        );

        Ok(Response::from_parts(parts, Box::pin(body) as ByteStream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_defaults_port() {
        let uri: Uri = "http://api.test/carts?page=2".parse().unwrap();
        let (address, host) = target(&uri).unwrap();
        assert_eq!(address, "api.test:80");
        assert_eq!(host, "api.test");
    }

    #[test]
    fn test_target_rejects_https() {
        let uri: Uri = "https://api.test/".parse().unwrap();
        assert!(matches!(target(&uri), Err(HttpTransportError::InvalidUrl(_))));
    }

    #[test]
    fn test_target_requires_host() {
        let uri: Uri = "/carts".parse().unwrap();
        assert!(target(&uri).is_err());
    }
}
