//! Outgoing request bodies
//!
//! A request body is one of a closed set of shapes. Every consumer (the body
//! observer, the transport) matches on all of them.

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, Stream};
use http::{HeaderMap, StatusCode};
use std::io;
use std::pin::Pin;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// A body as a stream of byte chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Producer callback of a [`OutgoingContent::WriteChannel`] body
pub type ChannelWriter = Box<dyn FnOnce(ByteSink) -> BoxFuture<'static, io::Result<()>> + Send>;

/// Chunks buffered between a channel writer and its reader
const WRITE_CHANNEL_CAPACITY: usize = 16;

/// Declared properties of a body
#[derive(Debug, Clone, Default)]
pub struct ContentMeta {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
}

impl ContentMeta {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..Default::default()
        }
    }
}

/// Writing end handed to a [`ChannelWriter`]
pub struct ByteSink {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl ByteSink {
    /// Write one chunk, waiting for the reader to make room.
    ///
    /// Fails with `BrokenPipe` once the reading side is gone.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> io::Result<()> {
        self.tx
            .send(Ok(chunk.into()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "body reader dropped"))
    }
}

/// An outgoing request body
pub enum OutgoingContent {
    /// Fully buffered bytes
    Bytes { meta: ContentMeta, bytes: Bytes },
    /// Bytes pulled from a stream
    ReadStream { meta: ContentMeta, stream: ByteStream },
    /// Bytes pushed by a producer into a channel
    WriteChannel {
        meta: ContentMeta,
        writer: ChannelWriter,
    },
    /// A wrapper (e.g. compression) around another body
    Wrapped {
        meta: ContentMeta,
        inner: Box<OutgoingContent>,
    },
    NoContent { meta: ContentMeta },
    ProtocolUpgrade { meta: ContentMeta },
}

impl OutgoingContent {
    pub fn empty() -> Self {
        OutgoingContent::NoContent {
            meta: ContentMeta::default(),
        }
    }

    /// Buffered body with a content type
    pub fn bytes(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let mut meta = ContentMeta::with_content_type(content_type);
        meta.content_length = Some(bytes.len() as u64);
        OutgoingContent::Bytes { meta, bytes }
    }

    /// `application/json` body
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::bytes("application/json", serde_json::to_vec(value)?))
    }

    pub fn stream(meta: ContentMeta, stream: ByteStream) -> Self {
        OutgoingContent::ReadStream { meta, stream }
    }

    pub fn channel<F, Fut>(meta: ContentMeta, writer: F) -> Self
    where
        F: FnOnce(ByteSink) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = io::Result<()>> + Send + 'static,
    {
        OutgoingContent::WriteChannel {
            meta,
            writer: Box::new(move |sink| writer(sink).boxed()),
        }
    }

    pub fn meta(&self) -> &ContentMeta {
        match self {
            OutgoingContent::Bytes { meta, .. }
            | OutgoingContent::ReadStream { meta, .. }
            | OutgoingContent::WriteChannel { meta, .. }
            | OutgoingContent::Wrapped { meta, .. }
            | OutgoingContent::NoContent { meta }
            | OutgoingContent::ProtocolUpgrade { meta } => meta,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.meta().content_type.as_deref()
    }

    /// Declared length; buffered bodies fall back to their actual size
    pub fn content_length(&self) -> Option<u64> {
        match self {
            OutgoingContent::Bytes { meta, bytes } => {
                meta.content_length.or(Some(bytes.len() as u64))
            }
            OutgoingContent::NoContent { meta } => meta.content_length.or(Some(0)),
            other => other.meta().content_length,
        }
    }

    /// Flatten the body into a byte stream.
    ///
    /// Channel writers are driven by a task spawned on `handle`.
    pub fn into_byte_stream(self, handle: &Handle) -> ByteStream {
        match self {
            OutgoingContent::Bytes { bytes, .. } => {
                if bytes.is_empty() {
                    Box::pin(stream::empty::<io::Result<Bytes>>())
                } else {
                    Box::pin(stream::once(async move { Ok::<_, io::Error>(bytes) }))
                }
            }
            OutgoingContent::ReadStream { stream, .. } => stream,
            OutgoingContent::WriteChannel { writer, .. } => drive_writer(writer, handle),
            OutgoingContent::Wrapped { inner, .. } => inner.into_byte_stream(handle),
            OutgoingContent::NoContent { .. } | OutgoingContent::ProtocolUpgrade { .. } => {
                Box::pin(stream::empty::<io::Result<Bytes>>())
            }
        }
    }
}

impl std::fmt::Debug for OutgoingContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            OutgoingContent::Bytes { .. } => "Bytes",
            OutgoingContent::ReadStream { .. } => "ReadStream",
            OutgoingContent::WriteChannel { .. } => "WriteChannel",
            OutgoingContent::Wrapped { .. } => "Wrapped",
            OutgoingContent::NoContent { .. } => "NoContent",
            OutgoingContent::ProtocolUpgrade { .. } => "ProtocolUpgrade",
        };
        f.debug_struct("OutgoingContent")
            .field("kind", &kind)
            .field("meta", self.meta())
            .finish()
    }
}

/// Run a channel writer on `handle` and expose what it writes as a stream.
///
/// A writer error is delivered to the reader as the final item.
pub(crate) fn drive_writer(writer: ChannelWriter, handle: &Handle) -> ByteStream {
    let (tx, rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
    let errors = tx.clone();

    handle.spawn(async move {
        if let Err(e) = writer(ByteSink { tx }).await {
            debug!("Body writer failed: {}", e);
            let _ = errors.send(Err(e)).await;
        }
    });

    Box::pin(ReceiverStream::new(rx))
}
