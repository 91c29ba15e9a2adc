//! Sniffing HTTP client
//!
//! [`SniffingClient`] wraps a [`Transport`] and runs the [`Sniffer`] hooks
//! around every exchange.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::{HeaderMap, Request, Response, StatusCode, Version};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::config::{CustomPayload, SnifferConfig};
use crate::content::{ByteStream, OutgoingContent};
use crate::error::{SnifferError, TransportError};
use crate::exchange::Exchange;
use crate::hooks::{ResponseHead, Sniffer, EXCHANGE_CANCELLED};
use crate::id::now_millis;
use crate::store::LogStore;

/// Sends requests over the network.
///
/// Implementations own connection handling; the response body is streamed.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: Request<OutgoingContent>,
    ) -> Result<Response<ByteStream>, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(
        &self,
        request: Request<OutgoingContent>,
    ) -> Result<Response<ByteStream>, TransportError> {
        (**self).send(request).await
    }
}

/// HTTP client that records every exchange it performs
pub struct SniffingClient<T> {
    transport: T,
    sniffer: Arc<Sniffer>,
}

impl<T: Transport> SniffingClient<T> {
    pub fn new(transport: T, config: SnifferConfig, store: Arc<dyn LogStore>) -> Self {
        Self {
            transport,
            sniffer: Arc::new(Sniffer::new(config, store)),
        }
    }

    pub fn sniffer(&self) -> &Sniffer {
        &self.sniffer
    }

    /// Send a request with a text or opaque body
    pub async fn send(
        &self,
        request: Request<OutgoingContent>,
    ) -> Result<SniffedResponse, TransportError> {
        self.execute(request, None).await
    }

    /// Send a request whose body is the encoded form of `payload`.
    ///
    /// The typed payload is what gets logged for custom-format content.
    pub async fn send_custom(
        &self,
        request: Request<OutgoingContent>,
        payload: &dyn CustomPayload,
    ) -> Result<SniffedResponse, TransportError> {
        self.execute(request, Some(payload)).await
    }

    async fn execute(
        &self,
        request: Request<OutgoingContent>,
        payload: Option<&dyn CustomPayload>,
    ) -> Result<SniffedResponse, TransportError> {
        let (parts, content) = request.into_parts();
        let exchange = self.sniffer.pre_send(&parts, &content, payload);
        let content = self.sniffer.send_monitoring(&exchange, content);

        // Dropped mid-flight: complete the exchange as cancelled
        let guard = scopeguard::guard((), |_| {
            self.sniffer
                .transport_failed(&exchange, &EXCHANGE_CANCELLED);
        });

        let request_time = now_millis();
        let result = self
            .transport
            .send(Request::from_parts(parts, content))
            .await;
        scopeguard::ScopeGuard::into_inner(guard);

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.sniffer.transport_failed(&exchange, &e);
                return Err(e);
            }
        };

        let (parts, body) = response.into_parts();
        let head = ResponseHead {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            request_time,
            response_time: now_millis(),
        };
        let body = self.sniffer.receive_begin(&exchange, &head, body);

        Ok(SniffedResponse {
            sniffer: self.sniffer.clone(),
            exchange,
            head,
            body: Some(body),
        })
    }

    /// Wait for every pending log write
    pub async fn flush(&self) {
        self.sniffer.scope().idle().await;
    }

    /// Stop logging; pending log writes are abandoned
    pub async fn shutdown(&self) {
        self.sniffer.scope().shutdown().await;
    }
}

/// Response of a sniffed exchange.
///
/// Consuming the body (`bytes`, `text`, `json`, `decode`, `into_body`)
/// completes the exchange; dropping the response unread does too.
pub struct SniffedResponse {
    sniffer: Arc<Sniffer>,
    exchange: Exchange,
    head: ResponseHead,
    body: Option<ByteStream>,
}

impl SniffedResponse {
    /// Log id of this exchange
    pub fn id(&self) -> &str {
        self.exchange.id()
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    fn take_body(&mut self) -> ByteStream {
        self.body
            .take()
            .unwrap_or_else(|| Box::pin(futures::stream::empty::<std::io::Result<Bytes>>()))
    }

    /// Read the body and decode it with `decode`.
    ///
    /// Decoding errors are recorded in the log and returned.
    pub async fn decode<T, F>(mut self, decode: F) -> Result<T, SnifferError>
    where
        F: FnOnce(Bytes) -> Result<T, SnifferError>,
    {
        let body = self.take_body();
        self.sniffer
            .receive_end(&self.exchange, &self.head, async move {
                let bytes = collect_body(body).await?;
                decode(bytes)
            })
            .await
    }

    /// Read and decode a custom-format body, logging the decoded value
    pub async fn decode_custom<T, F>(mut self, decode: F) -> Result<T, SnifferError>
    where
        T: CustomPayload,
        F: FnOnce(Bytes) -> Result<T, SnifferError>,
    {
        let body = self.take_body();
        let sniffer = &self.sniffer;
        let exchange = &self.exchange;
        let head = &self.head;
        sniffer
            .receive_end(exchange, head, async move {
                let bytes = collect_body(body).await?;
                let value = decode(bytes)?;
                sniffer.post_response(exchange, head, &value);
                Ok::<T, SnifferError>(value)
            })
            .await
    }

    pub async fn bytes(self) -> Result<Bytes, SnifferError> {
        self.decode(Ok).await
    }

    pub async fn text(self) -> Result<String, SnifferError> {
        self.decode(|bytes| Ok(String::from_utf8(bytes.to_vec())?))
            .await
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T, SnifferError> {
        self.decode(|bytes| Ok(serde_json::from_slice(&bytes)?))
            .await
    }

    /// Take the raw body stream; the exchange completes when the body's
    /// logging copy ends.
    pub fn into_body(mut self) -> ByteStream {
        let body = self.take_body();
        self.sniffer.release(&self.exchange, &self.head);
        body
    }
}

impl Drop for SniffedResponse {
    fn drop(&mut self) {
        // Body never handed out: nobody else completes this exchange
        if self.body.take().is_some() {
            self.sniffer.release(&self.exchange, &self.head);
        }
    }
}

impl std::fmt::Debug for SniffedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniffedResponse")
            .field("id", &self.exchange.id())
            .field("status", &self.head.status)
            .finish()
    }
}

async fn collect_body(mut body: ByteStream) -> Result<Bytes, SnifferError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLogStore;
    use std::io;
    use std::sync::Mutex;

    /// Replies with a fixed status and body, remembering what it was sent
    struct ScriptedTransport {
        content_type: &'static str,
        body: &'static [u8],
        sent: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            request: Request<OutgoingContent>,
        ) -> Result<Response<ByteStream>, TransportError> {
            let handle = tokio::runtime::Handle::current();
            let mut body = request.into_body().into_byte_stream(&handle);
            let mut sent = Vec::new();
            while let Some(chunk) = body.next().await {
                sent.extend_from_slice(&chunk?);
            }
            self.sent.lock().unwrap().push(sent);

            let items: Vec<io::Result<Bytes>> = vec![Ok(Bytes::from_static(self.body))];
            let stream: ByteStream = Box::pin(futures::stream::iter(items));
            Ok(Response::builder()
                .status(200)
                .header("content-type", self.content_type)
                .body(stream)?)
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn send(
            &self,
            _request: Request<OutgoingContent>,
        ) -> Result<Response<ByteStream>, TransportError> {
            Err(Box::new(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )))
        }
    }

    fn client<T: Transport>(transport: T, store: &Arc<MemoryLogStore>) -> SniffingClient<T> {
        let config = SnifferConfig::builder().build().unwrap();
        SniffingClient::new(transport, config, store.clone())
    }

    #[derive(Debug, PartialEq, serde::Deserialize)]
    struct Cart {
        items: Vec<String>,
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let store = Arc::new(MemoryLogStore::new());
        let client = client(
            ScriptedTransport {
                content_type: "application/json",
                body: br#"{"items":["apple"]}"#,
                sent: Mutex::new(Vec::new()),
            },
            &store,
        );

        let request = Request::post("http://api.test/carts")
            .body(OutgoingContent::bytes("application/json", r#"{"item":"apple"}"#))
            .unwrap();
        let response = client.send(request).await.unwrap();
        let id = response.id().to_string();
        let cart: Cart = response.json().await.unwrap();
        assert_eq!(cart.items, vec!["apple"]);

        client.flush().await;
        let log = store.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(log.request_body.as_deref(), Some(r#"{"item":"apple"}"#));
        assert_eq!(log.response_body.as_deref(), Some(r#"{"items":["apple"]}"#));
        assert_eq!(log.response_status_code, Some(200));
        assert_eq!(
            client.transport.sent.lock().unwrap()[0],
            br#"{"item":"apple"}"#
        );
    }

    #[tokio::test]
    async fn test_transport_error_passes_through() {
        let store = Arc::new(MemoryLogStore::new());
        let client = client(FailingTransport, &store);

        let request = Request::get("http://api.test/carts")
            .body(OutgoingContent::empty())
            .unwrap();
        let err = client.send(request).await.unwrap_err();
        let io_err = err.downcast_ref::<io::Error>().unwrap();
        assert_eq!(io_err.kind(), io::ErrorKind::ConnectionRefused);

        client.flush().await;
        let logs = store.query_page("", 10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].error_details.as_deref(), Some("connection refused"));
        assert_eq!(logs[0].response_status_code, None);
    }

    #[tokio::test]
    async fn test_decode_error_recorded() {
        let store = Arc::new(MemoryLogStore::new());
        let client = client(
            ScriptedTransport {
                content_type: "application/json",
                body: b"not json",
                sent: Mutex::new(Vec::new()),
            },
            &store,
        );

        let request = Request::get("http://api.test/carts")
            .body(OutgoingContent::empty())
            .unwrap();
        let response = client.send(request).await.unwrap();
        let result: Result<Cart, _> = response.json().await;
        assert!(matches!(result, Err(SnifferError::Json(_))));

        client.flush().await;
        let logs = store.query_page("", 10, 0).await.unwrap();
        assert!(logs[0].error_details.is_some());
        assert_eq!(logs[0].response_body.as_deref(), Some("not json"));
    }

    #[tokio::test]
    async fn test_dropped_response_is_logged() {
        let store = Arc::new(MemoryLogStore::new());
        let client = client(
            ScriptedTransport {
                content_type: "image/png",
                body: b"\x89PNG",
                sent: Mutex::new(Vec::new()),
            },
            &store,
        );

        let request = Request::get("http://api.test/logo.png")
            .body(OutgoingContent::empty())
            .unwrap();
        let response = client.send(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        drop(response);

        client.flush().await;
        let logs = store.query_page("", 10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].response_body, None);
        assert_eq!(logs[0].response_body_type.as_deref(), Some("image/png"));
    }

    #[derive(Debug)]
    struct CartMessage {
        id: u8,
    }

    #[tokio::test]
    async fn test_custom_decoder_error_recorded() {
        let store = Arc::new(MemoryLogStore::new());
        let client = client(
            ScriptedTransport {
                content_type: "application/x-protobuf",
                body: b"\x08",
                sent: Mutex::new(Vec::new()),
            },
            &store,
        );

        let request = Request::get("http://api.test/carts/1")
            .body(OutgoingContent::empty())
            .unwrap();
        let result = client
            .send(request)
            .await
            .unwrap()
            .decode_custom(|bytes| match bytes.get(1) {
                Some(id) => Ok(CartMessage { id: *id }),
                None => Err(SnifferError::decode("truncated cart message")),
            })
            .await;
        assert!(matches!(result, Err(SnifferError::Decode(_))));

        client.flush().await;
        let logs = store.query_page("", 10, 0).await.unwrap();
        assert_eq!(
            logs[0].error_details.as_deref(),
            Some("Failed to decode body: truncated cart message")
        );
        assert_eq!(logs[0].response_status_code, Some(200));
        assert_eq!(logs[0].response_body, None);
    }
}
