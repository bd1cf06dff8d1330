//! Request and response payloads.
//!
//! A [`Body`] is either empty, a fixed in-memory buffer, or a stream of
//! chunks produced asynchronously. Buffers can be read any number of times;
//! streams are read once unless they were built from a restartable factory.

use std::{fmt, future, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::{stream, stream::BoxStream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};

use crate::{Error, Result};

/// Cap applied by [`Body::materialize`] (10 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// A type-erased, fallible async stream of byte chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

type StreamFactory = Arc<dyn Fn() -> ByteStream + Send + Sync>;

/// Payload attached to an [`HttpRequest`](crate::HttpRequest) or
/// [`HttpResponse`](crate::HttpResponse).
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    /// Immutable buffer with a known length.
    Bytes(Bytes),
    /// Chunks produced on demand.
    Stream(StreamBody),
}

/// Streaming variant of [`Body`].
pub struct StreamBody {
    source: StreamSource,
    declared_length: Option<u64>,
}

enum StreamSource {
    Once(Option<ByteStream>),
    Restartable(StreamFactory),
}

impl Body {
    pub fn empty() -> Self {
        Self::Empty
    }

    /// Builds a body from a fixed buffer.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::Bytes(bytes.into())
    }

    /// Builds a read-once body from a fallible chunk stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self::Stream(StreamBody {
            source: StreamSource::Once(Some(stream.boxed())),
            declared_length: None,
        })
    }

    /// Builds a read-once body from an infallible chunk stream.
    pub fn from_chunks<S, B>(chunks: S) -> Self
    where
        S: Stream<Item = B> + Send + 'static,
        B: Into<Bytes>,
    {
        Self::from_stream(chunks.map(|chunk| Ok(chunk.into())))
    }

    /// Builds a streaming body that can be read again, for example when a
    /// request is retried. `factory` is called once per read.
    pub fn restartable<F, S>(factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self::Stream(StreamBody {
            source: StreamSource::Restartable(Arc::new(move || factory().boxed())),
            declared_length: None,
        })
    }

    /// Serializes `value` as JSON into a fixed buffer.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value)
            .map_err(|err| Error::InvalidRequest(format!("json body: {err}")))?;
        Ok(Self::Bytes(bytes.into()))
    }

    /// Declares the total length of a streaming body. No effect on other
    /// variants, whose length is always known.
    pub fn with_declared_length(mut self, length: u64) -> Self {
        if let Self::Stream(body) = &mut self {
            body.declared_length = Some(length);
        }
        self
    }

    pub fn declared_length(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Bytes(bytes) => Some(bytes.len() as u64),
            Self::Stream(body) => body.declared_length,
        }
    }

    /// Whether [`Body::content`] can be called again after a full read.
    pub fn is_replayable(&self) -> bool {
        match self {
            Self::Empty | Self::Bytes(_) => true,
            Self::Stream(body) => matches!(body.source, StreamSource::Restartable(_)),
        }
    }

    /// Returns the chunks of this body.
    ///
    /// A read-once stream hands out its producer on the first call; later
    /// calls fail with [`Error::BodyAlreadyConsumed`].
    pub fn content(&mut self) -> Result<ByteStream> {
        match self {
            Self::Empty => Ok(stream::empty().boxed()),
            Self::Bytes(bytes) if bytes.is_empty() => Ok(stream::empty().boxed()),
            Self::Bytes(bytes) => Ok(stream::once(future::ready(Ok(bytes.clone()))).boxed()),
            Self::Stream(body) => match &mut body.source {
                StreamSource::Once(source) => source.take().ok_or(Error::BodyAlreadyConsumed),
                StreamSource::Restartable(factory) => Ok(factory()),
            },
        }
    }

    /// Collects the whole body into memory, failing past
    /// [`DEFAULT_MAX_BODY_BYTES`].
    pub async fn materialize(&mut self) -> Result<Bytes> {
        self.materialize_with_limit(DEFAULT_MAX_BODY_BYTES).await
    }

    /// Collects the whole body into memory, failing with
    /// [`Error::BodyTooLarge`] once more than `limit` bytes were read.
    pub async fn materialize_with_limit(&mut self, limit: usize) -> Result<Bytes> {
        if let Self::Bytes(bytes) = self {
            if bytes.len() > limit {
                return Err(Error::BodyTooLarge { limit });
            }
            return Ok(bytes.clone());
        }

        let mut content = self.content()?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = content.next().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > limit {
                return Err(Error::BodyTooLarge { limit });
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Collects the body and decodes it as UTF-8.
    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.materialize().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| Error::Decode(format!("body is not valid utf-8: {err}")))
    }

    /// Collects the body and deserializes it from JSON.
    pub async fn parse<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.materialize().await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| Error::Decode(format!("invalid json body: {err}")))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Bytes(bytes) => f.debug_tuple("Body::Bytes").field(&bytes.len()).finish(),
            Self::Stream(body) => f
                .debug_struct("Body::Stream")
                .field("declared_length", &body.declared_length)
                .field("replayable", &self.is_replayable())
                .finish_non_exhaustive(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(bytes))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::Bytes(text.into())
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(text.as_bytes()))
    }
}
