//! Pipeline hooks
//!
//! A [`Sniffer`] is attached to an HTTP client pipeline through five hooks,
//! called in order for every exchange:
//!
//! 1. [`pre_send`](Sniffer::pre_send): start the exchange, capture custom-format payloads
//! 2. [`send_monitoring`](Sniffer::send_monitoring): fork the outgoing body
//! 3. [`receive_begin`](Sniffer::receive_begin): fork the incoming body
//! 4. [`receive_end`](Sniffer::receive_end): wrap response decoding, complete the exchange
//! 5. [`post_response`](Sniffer::post_response): capture a decoded custom-format response
//!
//! Hooks never fail and never alter what the caller sends or receives.

use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, StatusCode, Version};
use std::fmt::Display;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::assembler::LogAssembler;
use crate::classify::{self, ContentClass};
use crate::config::{CustomPayload, SnifferConfig};
use crate::content::{ByteStream, OutgoingContent};
use crate::exchange::Exchange;
use crate::id::{generate_id, now_millis};
use crate::model::{header_multimap, RequestEntry, ResponseEntry};
use crate::observe::{capture_channel, observe_outgoing, read_text, split_incoming};
use crate::scope::SnifferScope;
use crate::store::LogStore;

/// Stored instead of a request body that could not be decoded
pub const REQUEST_BODY_OMITTED: &str = "[request body omitted]";
/// Stored instead of a response body that could not be decoded
pub const RESPONSE_BODY_OMITTED: &str = "[response body omitted]";

/// Error recorded when an exchange is dropped before it completes
pub(crate) const EXCHANGE_CANCELLED: &str = "exchange cancelled";

/// Response status line and headers, with exchange timing
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    /// Epoch milliseconds when the request was handed to the transport
    pub request_time: i64,
    /// Epoch milliseconds when the response head arrived
    pub response_time: i64,
}

impl ResponseHead {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    fn content_length(&self) -> i64 {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    fn entry(&self, body: Option<String>) -> ResponseEntry {
        ResponseEntry {
            status_code: self.status.as_u16(),
            headers: header_multimap(&self.headers),
            body_type: self.content_type().unwrap_or_default().to_string(),
            body_length: self.content_length(),
            body,
            protocol: format!("{:?}", self.version),
            request_time: self.request_time,
            response_time: self.response_time,
        }
    }
}

/// Captures exchanges into a [`LogStore`]
pub struct Sniffer {
    config: SnifferConfig,
    store: Arc<dyn LogStore>,
}

impl Sniffer {
    pub fn new(config: SnifferConfig, store: Arc<dyn LogStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &SnifferConfig {
        &self.config
    }

    pub fn scope(&self) -> &SnifferScope {
        &self.config.scope
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Capture policy for a content type. Custom content is skipped while
    /// custom capture is disabled.
    fn policy(&self, content_type: Option<&str>) -> ContentClass {
        match self.config.classifier.classify(content_type) {
            ContentClass::Custom if !self.config.custom_capture => ContentClass::Skip,
            class => class,
        }
    }

    /// Render a custom-format payload; a panicking formatter yields `placeholder`
    fn format_custom(&self, payload: &dyn CustomPayload, placeholder: &str) -> String {
        let formatter = &self.config.formatter;
        catch_unwind(AssertUnwindSafe(|| formatter(payload.type_hint(), payload))).unwrap_or_else(
            |_| {
                debug!("Custom formatter panicked for {}", payload.type_hint().type_name);
                placeholder.to_string()
            },
        )
    }

    /// Hook 1: start capturing an exchange.
    ///
    /// For custom-format requests the typed `payload` is formatted here,
    /// before it is encoded.
    pub fn pre_send(
        &self,
        parts: &http::request::Parts,
        content: &OutgoingContent,
        payload: Option<&dyn CustomPayload>,
    ) -> Exchange {
        let content_type = content
            .content_type()
            .or_else(|| parts.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()))
            .map(str::to_string);

        let mut headers = parts.headers.clone();
        merge_missing_headers(&mut headers, &content.meta().headers);

        let request = RequestEntry {
            url: parts.uri.to_string(),
            method: parts.method.to_string(),
            headers: header_multimap(&headers),
            body_type: content_type.clone().unwrap_or_default(),
            body_length: content
                .content_length()
                .and_then(|len| i64::try_from(len).ok())
                .unwrap_or(0),
            body: None,
            timestamp: now_millis(),
        };

        let id = generate_id();
        let assembler = LogAssembler::new(request.clone(), self.store.clone());
        let exchange = Exchange::new(id, request, assembler);
        debug!(
            "Capturing {} {} as {}",
            parts.method,
            parts.uri,
            exchange.id()
        );

        if self.policy(content_type.as_deref()) == ContentClass::Custom {
            if let Some(payload) = payload {
                let body = self.format_custom(payload, REQUEST_BODY_OMITTED);
                exchange
                    .assembler()
                    .save_request(exchange.request_with_body(Some(body)));
                debug!("Request saved for {}", exchange.id());
            }
        }

        exchange
    }

    /// Hook 2: observe the outgoing body. Returns the body to send.
    pub fn send_monitoring(&self, exchange: &Exchange, content: OutgoingContent) -> OutgoingContent {
        if self.policy(exchange.request_content_type()) != ContentClass::Text {
            // Already saved for captured custom payloads
            exchange
                .assembler()
                .save_request(exchange.request_with_body(None));
            return content;
        }

        let scope = self.scope();
        if scope.is_shutdown() {
            exchange.assembler().give_up_request();
            return content;
        }

        let (sink, copy) = capture_channel();
        let content = observe_outgoing(content, sink, scope.handle());

        let charset = exchange.request_content_type().and_then(classify::charset);
        let limit = self.config.max_capture_bytes;
        let task_exchange = exchange.clone();
        let spawned = scope.spawn(async move {
            let body = read_text(copy, charset.as_deref(), limit)
                .await
                .into_body(REQUEST_BODY_OMITTED);
            task_exchange
                .assembler()
                .save_request(task_exchange.request_with_body(body));
            debug!("Request saved for {}", task_exchange.id());
        });
        if !spawned {
            exchange.assembler().give_up_request();
        }

        content
    }

    /// Hook 3: observe the incoming body. Returns the stream the caller reads.
    pub fn receive_begin(
        &self,
        exchange: &Exchange,
        head: &ResponseHead,
        body: ByteStream,
    ) -> ByteStream {
        match self.policy(head.content_type()) {
            // Saved once decoded, by post_response or receive_end
            ContentClass::Custom => body,
            ContentClass::Skip => {
                exchange.assembler().save_response(head.entry(None));
                debug!("Response saved for {}", exchange.id());
                body
            }
            ContentClass::Text => {
                let scope = self.scope();
                if scope.is_shutdown() {
                    exchange.assembler().give_up_response();
                    return body;
                }

                let (primary, copy) = split_incoming(body, scope.handle());

                let charset = head.content_type().and_then(classify::charset);
                let limit = self.config.max_capture_bytes;
                let task_exchange = exchange.clone();
                let task_head = head.clone();
                let spawned = scope.spawn(async move {
                    let body = read_text(copy, charset.as_deref(), limit)
                        .await
                        .into_body(RESPONSE_BODY_OMITTED);
                    task_exchange.assembler().save_response(task_head.entry(body));
                    debug!("Response saved for {}", task_exchange.id());
                });
                if !spawned {
                    exchange.assembler().give_up_response();
                }

                primary
            }
        }
    }

    /// Hook 4: run the response decoding future and complete the exchange.
    ///
    /// A decoding error is recorded and returned unchanged. If the future is
    /// dropped before it finishes, the exchange is completed as cancelled.
    pub async fn receive_end<T, E, F>(
        &self,
        exchange: &Exchange,
        head: &ResponseHead,
        decode: F,
    ) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let guard = scopeguard::guard((), |_| {
            exchange.assembler().record_error(EXCHANGE_CANCELLED);
            exchange.assembler().give_up_response();
            self.complete(exchange);
        });

        let result = decode.await;
        scopeguard::ScopeGuard::into_inner(guard);

        if let Err(e) = &result {
            exchange.assembler().record_error(e.to_string());
        }
        self.release(exchange, head);

        result
    }

    /// Hook 5: capture a decoded custom-format response
    pub fn post_response(&self, exchange: &Exchange, head: &ResponseHead, payload: &dyn CustomPayload) {
        if self.policy(head.content_type()) != ContentClass::Custom {
            return;
        }

        let body = self.format_custom(payload, RESPONSE_BODY_OMITTED);
        exchange.assembler().save_response(head.entry(Some(body)));
        debug!("Response saved for {}", exchange.id());
        self.complete(exchange);
    }

    /// Complete an exchange whose transport failed before any response
    pub fn transport_failed(&self, exchange: &Exchange, error: &dyn Display) {
        debug!("Exchange {} failed: {}", exchange.id(), error);
        exchange.assembler().record_error(error.to_string());
        exchange.assembler().give_up_response();
        self.complete(exchange);
    }

    /// Complete an exchange whose response is handed over without decoding
    pub(crate) fn release(&self, exchange: &Exchange, head: &ResponseHead) {
        if self.policy(head.content_type()) == ContentClass::Custom {
            // No decoded payload arrived through post_response
            exchange.assembler().save_response(head.entry(None));
        }
        self.complete(exchange);
    }

    /// Write the log once both halves are terminal
    fn complete(&self, exchange: &Exchange) {
        let task_exchange = exchange.clone();
        let spawned = self.scope().spawn(async move {
            let id = task_exchange.id();
            match task_exchange.assembler().finish(id).await {
                Ok(true) => debug!("Exchange {} logged", id),
                Ok(false) => {}
                Err(e) => warn!("Failed to save network log {}: {}", id, e),
            }
        });
        if !spawned {
            debug!("Exchange {} not logged, sniffer scope is shut down", exchange.id());
        }
    }
}

/// Add every value of each header in `extra` whose name `headers` lacks
pub(crate) fn merge_missing_headers(headers: &mut HeaderMap, extra: &HeaderMap) {
    for name in extra.keys() {
        if headers.contains_key(name) {
            continue;
        }
        for value in extra.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentMeta;
    use crate::model::NetworkLog;
    use crate::store::MemoryLogStore;
    use bytes::Bytes;
    use futures::StreamExt;
    use http::header::{HeaderValue, ACCEPT, LINK};
    use std::io;

    #[derive(Debug)]
    struct CartMessage {
        id: u32,
    }

    fn sniffer(store: &Arc<MemoryLogStore>, custom_capture: bool) -> Sniffer {
        let config = SnifferConfig::builder()
            .custom_capture(custom_capture)
            .custom_formatter(|_, payload| match payload.as_any().downcast_ref::<CartMessage>() {
                Some(cart) => format!("cart {}", cart.id),
                None => panic!("unexpected payload"),
            })
            .build()
            .unwrap();
        Sniffer::new(config, store.clone())
    }

    fn request_parts(method: &str, uri: &str) -> http::request::Parts {
        let (parts, _) = http::Request::builder()
            .method(method)
            .uri(uri)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    fn head(content_type: Option<&str>) -> ResponseHead {
        let mut headers = HeaderMap::new();
        if let Some(content_type) = content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        }
        ResponseHead {
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers,
            request_time: 10,
            response_time: 20,
        }
    }

    fn body(bytes: &'static [u8]) -> ByteStream {
        let items: Vec<io::Result<Bytes>> = vec![Ok(Bytes::from_static(bytes))];
        Box::pin(futures::stream::iter(items))
    }

    async fn only_log(sniffer: &Sniffer, store: &MemoryLogStore) -> NetworkLog {
        sniffer.scope().idle().await;
        let mut logs = store.query_page("", 10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        logs.remove(0)
    }

    #[tokio::test]
    async fn test_text_exchange() {
        let store = Arc::new(MemoryLogStore::new());
        let sniffer = sniffer(&store, true);

        let parts = request_parts("POST", "http://api.test/orders");
        let content = OutgoingContent::bytes("application/json", r#"{"qty":2}"#);
        let exchange = sniffer.pre_send(&parts, &content, None);
        let _sent = sniffer.send_monitoring(&exchange, content);

        let head = head(Some("application/json"));
        let mut primary = sniffer.receive_begin(&exchange, &head, body(br#"{"ok":true}"#));
        let decoded: Result<Bytes, io::Error> = sniffer
            .receive_end(&exchange, &head, async move { primary.next().await.unwrap() })
            .await;
        assert_eq!(decoded.unwrap(), Bytes::from_static(br#"{"ok":true}"#));

        let log = only_log(&sniffer, &store).await;
        assert_eq!(log.id, exchange.id());
        assert_eq!(log.request_body.as_deref(), Some(r#"{"qty":2}"#));
        assert_eq!(log.request_body_length, 9);
        assert_eq!(log.response_body.as_deref(), Some(r#"{"ok":true}"#));
        assert_eq!(log.protocol.as_deref(), Some("HTTP/1.1"));
        assert_eq!(log.request_timestamp, Some(10));
        assert_eq!(log.response_timestamp, Some(20));
    }

    #[tokio::test]
    async fn test_undecodable_response_uses_placeholder() {
        let store = Arc::new(MemoryLogStore::new());
        let sniffer = sniffer(&store, true);

        let parts = request_parts("GET", "http://api.test/text");
        let content = OutgoingContent::empty();
        let exchange = sniffer.pre_send(&parts, &content, None);
        let _ = sniffer.send_monitoring(&exchange, content);

        let head = head(Some("text/plain"));
        let primary = sniffer.receive_begin(&exchange, &head, body(b"\xff\xfe\xfd"));
        let _: Result<Vec<io::Result<Bytes>>, io::Error> = sniffer
            .receive_end(&exchange, &head, async move {
                let chunks: Vec<io::Result<Bytes>> = primary.collect().await;
                Ok::<_, io::Error>(chunks)
            })
            .await;

        let log = only_log(&sniffer, &store).await;
        assert_eq!(log.request_body, None);
        assert_eq!(log.response_body.as_deref(), Some(RESPONSE_BODY_OMITTED));
    }

    #[tokio::test]
    async fn test_custom_exchange() {
        let store = Arc::new(MemoryLogStore::new());
        let sniffer = sniffer(&store, true);

        let parts = request_parts("POST", "http://api.test/carts");
        let content = OutgoingContent::bytes("application/x-protobuf", vec![8, 1]);
        let exchange = sniffer.pre_send(&parts, &content, Some(&CartMessage { id: 1 }));
        let _ = sniffer.send_monitoring(&exchange, content);

        let head = head(Some("application/x-protobuf"));
        let primary = sniffer.receive_begin(&exchange, &head, body(&[8, 2]));
        let result: Result<CartMessage, io::Error> = sniffer
            .receive_end(&exchange, &head, async {
                drop(primary);
                let cart = CartMessage { id: 2 };
                sniffer.post_response(&exchange, &head, &cart);
                Ok::<_, io::Error>(cart)
            })
            .await;
        assert_eq!(result.unwrap().id, 2);

        let log = only_log(&sniffer, &store).await;
        assert_eq!(log.request_body.as_deref(), Some("cart 1"));
        assert_eq!(log.response_body.as_deref(), Some("cart 2"));
    }

    #[tokio::test]
    async fn test_custom_capture_disabled_skips_bodies() {
        let store = Arc::new(MemoryLogStore::new());
        let sniffer = sniffer(&store, false);

        let parts = request_parts("POST", "http://api.test/carts");
        let content = OutgoingContent::bytes("application/x-protobuf", vec![8, 1]);
        let exchange = sniffer.pre_send(&parts, &content, Some(&CartMessage { id: 1 }));
        let _ = sniffer.send_monitoring(&exchange, content);

        let head = head(Some("application/x-protobuf"));
        let _primary = sniffer.receive_begin(&exchange, &head, body(&[8, 2]));
        let _: Result<(), io::Error> = sniffer
            .receive_end(&exchange, &head, async { Ok::<(), io::Error>(()) })
            .await;

        let log = only_log(&sniffer, &store).await;
        assert_eq!(log.request_body, None);
        assert_eq!(log.response_body, None);
        assert_eq!(log.response_status_code, Some(200));
    }

    #[tokio::test]
    async fn test_formatter_panic_uses_placeholder() {
        let store = Arc::new(MemoryLogStore::new());
        let sniffer = sniffer(&store, true);

        let parts = request_parts("POST", "http://api.test/carts");
        let content = OutgoingContent::bytes("application/protobuf", vec![1]);
        let exchange = sniffer.pre_send(&parts, &content, Some(&"not a cart"));
        let _ = sniffer.send_monitoring(&exchange, content);
        sniffer.transport_failed(&exchange, &"connection reset");

        let log = only_log(&sniffer, &store).await;
        assert_eq!(log.request_body.as_deref(), Some(REQUEST_BODY_OMITTED));
    }

    #[tokio::test]
    async fn test_decode_error_is_recorded_and_returned() {
        let store = Arc::new(MemoryLogStore::new());
        let sniffer = sniffer(&store, true);

        let parts = request_parts("GET", "http://api.test/carts");
        let content = OutgoingContent::empty();
        let exchange = sniffer.pre_send(&parts, &content, None);
        let _ = sniffer.send_monitoring(&exchange, content);

        let head = head(Some("application/json"));
        let _primary = sniffer.receive_begin(&exchange, &head, body(b"not json"));
        let result: Result<(), String> = sniffer
            .receive_end(&exchange, &head, async { Err::<(), String>("expected value at line 1".to_string()) })
            .await;
        assert_eq!(result.unwrap_err(), "expected value at line 1");

        let log = only_log(&sniffer, &store).await;
        assert_eq!(log.error_details.as_deref(), Some("expected value at line 1"));
        assert_eq!(log.response_status_code, Some(200));
    }

    #[tokio::test]
    async fn test_cancelled_decode_completes_exchange() {
        let store = Arc::new(MemoryLogStore::new());
        let sniffer = sniffer(&store, true);

        let parts = request_parts("GET", "http://api.test/slow");
        let content = OutgoingContent::empty();
        let exchange = sniffer.pre_send(&parts, &content, None);
        let _ = sniffer.send_monitoring(&exchange, content);

        let head = head(Some("application/json"));
        let pending: ByteStream = Box::pin(futures::stream::pending::<io::Result<Bytes>>());
        let primary = sniffer.receive_begin(&exchange, &head, pending);

        let decode = sniffer.receive_end(&exchange, &head, async move {
            let mut primary = primary;
            primary.next().await.transpose()
        });
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(20), decode).await;
        assert!(timed_out.is_err());

        let log = only_log(&sniffer, &store).await;
        assert_eq!(log.error_details.as_deref(), Some(EXCHANGE_CANCELLED));
        assert_eq!(log.response_status_code, None);
    }

    #[tokio::test]
    async fn test_repeated_content_headers_keep_every_value() {
        let store = Arc::new(MemoryLogStore::new());
        let sniffer = sniffer(&store, true);

        let mut meta = ContentMeta::with_content_type("text/plain");
        meta.headers
            .append(LINK, HeaderValue::from_static("<a>; rel=a"));
        meta.headers
            .append(LINK, HeaderValue::from_static("<b>; rel=b"));
        let content = OutgoingContent::stream(meta, body(b"hi"));

        let parts = request_parts("POST", "http://api.test/notes");
        let exchange = sniffer.pre_send(&parts, &content, None);
        let _ = sniffer.send_monitoring(&exchange, content);
        sniffer.transport_failed(&exchange, &"connection refused");

        let log = only_log(&sniffer, &store).await;
        assert_eq!(log.request_headers["link"], vec!["<a>; rel=a", "<b>; rel=b"]);
    }

    #[test]
    fn test_merge_keeps_request_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(LINK, HeaderValue::from_static("<req>"));
        let mut extra = HeaderMap::new();
        extra.append(LINK, HeaderValue::from_static("<meta>"));
        extra.append(ACCEPT, HeaderValue::from_static("text/html"));
        extra.append(ACCEPT, HeaderValue::from_static("text/plain"));

        merge_missing_headers(&mut headers, &extra);

        let links: Vec<_> = headers.get_all(LINK).iter().collect();
        assert_eq!(links, vec!["<req>"]);
        let accepts: Vec<_> = headers.get_all(ACCEPT).iter().collect();
        assert_eq!(accepts, vec!["text/html", "text/plain"]);
    }

    #[tokio::test]
    async fn test_exchange_after_shutdown_is_not_logged() {
        let store = Arc::new(MemoryLogStore::new());
        let sniffer = sniffer(&store, true);
        sniffer.scope().shutdown().await;

        let parts = request_parts("GET", "http://api.test/carts");
        let content = OutgoingContent::empty();
        let exchange = sniffer.pre_send(&parts, &content, None);
        let _ = sniffer.send_monitoring(&exchange, content);
        sniffer.transport_failed(&exchange, &"connection refused");

        assert_eq!(store.count().await.unwrap(), 0);
    }
}
