//! Non-destructive body observation
//!
//! Bodies are forked with a pump task: one copy goes to the caller (bounded
//! channel, normal backpressure), the other to a capture sink (unbounded, so
//! a slow or absent logging reader never stalls the caller).

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::io;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tracing::debug;

use crate::content::{drive_writer, ByteStream, OutgoingContent};

/// Chunks buffered ahead of the primary reader
const PRIMARY_CHANNEL_CAPACITY: usize = 16;

/// Maximum body size captured as text (512KB)
pub const DEFAULT_MAX_CAPTURE_BYTES: usize = 512 * 1024;

/// Receiving end of the logging copy of a body.
///
/// Dropping the sink closes the logging copy.
#[derive(Debug)]
pub struct CaptureSink {
    tx: mpsc::UnboundedSender<io::Result<Bytes>>,
}

impl CaptureSink {
    /// Append a chunk. A dropped logging reader is ignored.
    pub fn write(&self, chunk: Bytes) {
        let _ = self.tx.send(Ok(chunk));
    }

    /// Terminate the logging copy with an error
    pub fn fail(self, error: io::Error) {
        let _ = self.tx.send(Err(error));
    }

    /// Close the logging copy without further data
    pub fn close(self) {}
}

/// Create a capture sink and the stream it feeds
pub fn capture_channel() -> (CaptureSink, ByteStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        CaptureSink { tx },
        Box::pin(UnboundedReceiverStream::new(rx)),
    )
}

/// Observe an outgoing body, copying everything it produces into `sink`.
///
/// The returned content is what must be sent instead of `content`.
/// Buffered bodies are copied immediately and returned unchanged; streamed
/// bodies come back as a pass-through stream with the same declared
/// metadata.
pub fn observe_outgoing(
    content: OutgoingContent,
    sink: CaptureSink,
    handle: &Handle,
) -> OutgoingContent {
    match content {
        OutgoingContent::Bytes { meta, bytes } => {
            sink.write(bytes.clone());
            OutgoingContent::Bytes { meta, bytes }
        }
        OutgoingContent::ReadStream { meta, stream } => OutgoingContent::ReadStream {
            meta,
            stream: tee(stream, sink, handle),
        },
        OutgoingContent::WriteChannel { meta, writer } => {
            let source = drive_writer(writer, handle);
            OutgoingContent::ReadStream {
                meta,
                stream: tee(source, sink, handle),
            }
        }
        OutgoingContent::Wrapped { meta, inner } => OutgoingContent::Wrapped {
            meta,
            inner: Box::new(observe_outgoing(*inner, sink, handle)),
        },
        content @ (OutgoingContent::NoContent { .. } | OutgoingContent::ProtocolUpgrade { .. }) => {
            sink.close();
            content
        }
    }
}

/// Split a response body into `(primary, logging)` copies.
///
/// Both copies carry the complete byte sequence. The primary copy is
/// unaffected by how (or whether) the logging copy is read.
pub fn split_incoming(raw: ByteStream, handle: &Handle) -> (ByteStream, ByteStream) {
    let (sink, logging) = capture_channel();
    (tee(raw, sink, handle), logging)
}

/// Pump `source` into a bounded primary stream while mirroring into `sink`.
///
/// If the primary reader goes away, the logging copy ends with
/// `BrokenPipe`. Source errors are delivered to both copies.
fn tee(mut source: ByteStream, sink: CaptureSink, handle: &Handle) -> ByteStream {
    let (tx, rx) = mpsc::channel(PRIMARY_CHANNEL_CAPACITY);

    handle.spawn(async move {
        loop {
            let item = tokio::select! {
                item = source.next() => item,
                // A stalled source must not keep the logging copy open
                _ = tx.closed() => {
                    debug!("Primary body reader dropped, stopping body copy");
                    sink.fail(primary_dropped());
                    return;
                }
            };

            match item {
                Some(Ok(chunk)) => {
                    sink.write(chunk.clone());
                    if tx.send(Ok(chunk)).await.is_err() {
                        debug!("Primary body reader dropped, stopping body copy");
                        sink.fail(primary_dropped());
                        return;
                    }
                }
                Some(Err(e)) => {
                    sink.fail(io::Error::new(e.kind(), e.to_string()));
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                None => return,
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

fn primary_dropped() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "primary body reader dropped")
}

/// Outcome of reading a logging copy as text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapturedText {
    Text(String),
    /// Bytes arrived but could not be decoded with the declared charset
    Undecodable,
    /// The copy failed, or exceeded the capture limit
    Unavailable,
}

impl CapturedText {
    /// Body field value, using `placeholder` for undecodable bytes
    pub fn into_body(self, placeholder: &str) -> Option<String> {
        match self {
            CapturedText::Text(text) => Some(text),
            CapturedText::Undecodable => Some(placeholder.to_string()),
            CapturedText::Unavailable => None,
        }
    }
}

/// Read a logging copy to the end and decode it.
///
/// Stops reading (dropping the copy) once more than `limit` bytes arrived.
/// `charset` defaults to UTF-8; `us-ascii` and `iso-8859-1` are also known.
pub async fn read_text(mut stream: ByteStream, charset: Option<&str>, limit: usize) -> CapturedText {
    let mut buf = BytesMut::new();

    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                if buf.len() + chunk.len() > limit {
                    debug!("Body exceeds capture limit of {} bytes", limit);
                    return CapturedText::Unavailable;
                }
                buf.extend_from_slice(&chunk);
            }
            Err(e) => {
                debug!("Body copy failed: {}", e);
                return CapturedText::Unavailable;
            }
        }
    }

    match decode(buf.freeze(), charset) {
        Some(text) => CapturedText::Text(text),
        None => CapturedText::Undecodable,
    }
}

fn decode(bytes: Bytes, charset: Option<&str>) -> Option<String> {
    match charset.unwrap_or("utf-8") {
        "utf-8" | "utf8" => String::from_utf8(bytes.to_vec()).ok(),
        "us-ascii" | "ascii" => {
            if bytes.is_ascii() {
                String::from_utf8(bytes.to_vec()).ok()
            } else {
                None
            }
        }
        "iso-8859-1" | "latin1" | "latin-1" => Some(bytes.iter().map(|&b| b as char).collect()),
        other => {
            debug!("Unsupported body charset: {}", other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentMeta;
    use futures::stream;
    use std::time::Duration;

    fn chunked(n: usize, chunk_size: usize) -> (Vec<u8>, ByteStream) {
        let data: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
        let chunks: Vec<io::Result<Bytes>> = data
            .chunks(chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        (data, Box::pin(stream::iter(chunks)))
    }

    fn single(chunk: Bytes) -> ByteStream {
        let items: Vec<io::Result<Bytes>> = vec![Ok(chunk)];
        Box::pin(stream::iter(items))
    }

    async fn drain(mut stream: ByteStream) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_split_both_copies_read_concurrently() {
        let (data, raw) = chunked(100_000, 1000);
        let (primary, logging) = split_incoming(raw, &Handle::current());

        let (a, b) = tokio::join!(drain(primary), drain(logging));
        assert_eq!(a.unwrap(), data);
        assert_eq!(b.unwrap(), data);
    }

    #[tokio::test]
    async fn test_split_logging_read_lazily() {
        let (data, raw) = chunked(100_000, 1000);
        let (primary, logging) = split_incoming(raw, &Handle::current());

        assert_eq!(drain(primary).await.unwrap(), data);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(drain(logging).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_split_logging_dropped() {
        let (data, raw) = chunked(100_000, 1000);
        let (primary, logging) = split_incoming(raw, &Handle::current());
        drop(logging);

        assert_eq!(drain(primary).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_primary_dropped_fails_logging_copy() {
        let (_, raw) = chunked(1_000_000, 1000);
        let (primary, logging) = split_incoming(raw, &Handle::current());
        drop(primary);

        let err = drain(logging).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_source_error_reaches_both_copies() {
        let items: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let (primary, logging) = split_incoming(Box::pin(stream::iter(items)), &Handle::current());

        let (a, b) = tokio::join!(drain(primary), drain(logging));
        assert_eq!(a.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(b.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_observe_buffered_body() {
        let (sink, logging) = capture_channel();
        let content = observe_outgoing(
            OutgoingContent::bytes("application/json", r#"{"a":1}"#),
            sink,
            &Handle::current(),
        );

        assert!(matches!(content, OutgoingContent::Bytes { .. }));
        assert_eq!(drain(logging).await.unwrap(), br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_observe_streamed_body_preserves_meta() {
        let (data, source) = chunked(10_000, 100);
        let mut meta = ContentMeta::with_content_type("text/plain");
        meta.content_length = Some(10_000);

        let (sink, logging) = capture_channel();
        let content = observe_outgoing(
            OutgoingContent::stream(meta, source),
            sink,
            &Handle::current(),
        );

        assert_eq!(content.content_type(), Some("text/plain"));
        assert_eq!(content.content_length(), Some(10_000));

        let primary = content.into_byte_stream(&Handle::current());
        let (a, b) = tokio::join!(drain(primary), drain(logging));
        assert_eq!(a.unwrap(), data);
        assert_eq!(b.unwrap(), data);
    }

    #[tokio::test]
    async fn test_observe_channel_body() {
        let content = OutgoingContent::channel(ContentMeta::default(), |sink| async move {
            sink.write("hello ").await?;
            sink.write("world").await
        });

        let (sink, logging) = capture_channel();
        let content = observe_outgoing(content, sink, &Handle::current());
        assert!(matches!(content, OutgoingContent::ReadStream { .. }));

        let primary = content.into_byte_stream(&Handle::current());
        assert_eq!(drain(primary).await.unwrap(), b"hello world");
        assert_eq!(drain(logging).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_observe_no_content_closes_sink() {
        let (sink, logging) = capture_channel();
        let content = observe_outgoing(OutgoingContent::empty(), sink, &Handle::current());

        assert!(matches!(content, OutgoingContent::NoContent { .. }));
        assert!(drain(logging).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_observe_wrapped_body_forks_inner() {
        let (data, source) = chunked(5_000, 100);
        let wrapped = OutgoingContent::Wrapped {
            meta: ContentMeta::with_content_type("application/gzip"),
            inner: Box::new(OutgoingContent::stream(
                ContentMeta::with_content_type("text/plain"),
                source,
            )),
        };

        let (sink, logging) = capture_channel();
        let content = observe_outgoing(wrapped, sink, &Handle::current());

        let inner = match content {
            OutgoingContent::Wrapped { meta, inner } => {
                assert_eq!(meta.content_type.as_deref(), Some("application/gzip"));
                inner
            }
            other => panic!("expected a wrapped body, got {:?}", other),
        };
        assert!(matches!(*inner, OutgoingContent::ReadStream { .. }));
        assert_eq!(inner.content_type(), Some("text/plain"));

        let primary = inner.into_byte_stream(&Handle::current());
        let (a, b) = tokio::join!(drain(primary), drain(logging));
        assert_eq!(a.unwrap(), data);
        assert_eq!(b.unwrap(), data);
    }

    #[tokio::test]
    async fn test_observe_protocol_upgrade_closes_sink() {
        let upgrade = OutgoingContent::ProtocolUpgrade {
            meta: ContentMeta::default(),
        };

        let (sink, logging) = capture_channel();
        let content = observe_outgoing(upgrade, sink, &Handle::current());

        assert!(matches!(content, OutgoingContent::ProtocolUpgrade { .. }));
        assert!(drain(logging).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_text_charsets() {
        let utf8 = single(Bytes::from("caf\u{e9}"));
        assert_eq!(
            read_text(utf8, None, DEFAULT_MAX_CAPTURE_BYTES).await,
            CapturedText::Text("caf\u{e9}".to_string())
        );

        let latin1 = single(Bytes::from_static(b"caf\xe9"));
        assert_eq!(
            read_text(latin1, Some("iso-8859-1"), DEFAULT_MAX_CAPTURE_BYTES).await,
            CapturedText::Text("caf\u{e9}".to_string())
        );

        let invalid = single(Bytes::from_static(b"\xff\xfe"));
        let captured = read_text(invalid, None, DEFAULT_MAX_CAPTURE_BYTES).await;
        assert_eq!(captured, CapturedText::Undecodable);
        assert_eq!(
            captured.into_body("[response body omitted]").as_deref(),
            Some("[response body omitted]")
        );
    }

    #[tokio::test]
    async fn test_read_text_over_limit() {
        let (_, source) = chunked(2048, 512);
        assert_eq!(read_text(source, None, 1024).await, CapturedText::Unavailable);
    }
}
