//! Byte-producing inputs unified behind one demand-driven chunk stream.
//!
//! Demand is the pull of `poll_next`: a source emits at most one chunk per
//! poll, and the single-consumer contract of [`Stream`] serializes re-entrant
//! demand, so no explicit draining gate is needed. Synchronous readers run
//! their reads on the polling task; genuinely blocking readers belong behind
//! the router's worker pool.

use std::{
    io::Read,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};

use crate::error::{ConvertError, Result};

/// The demand-driven view of a byte source.
pub type ChunkStream = BoxStream<'static, Result<Bytes>>;

/// Re-opens an equivalent byte sequence from the top.
pub type RetryFn = dyn Fn() -> ChunkStream + Send + Sync;

/// A cloneable handle that re-opens the source from the top.
#[derive(Clone)]
pub struct SourceRetry(Arc<RetryFn>);

impl SourceRetry {
    /// Opens a fresh byte sequence equivalent to the original.
    pub fn open(&self) -> ChunkStream {
        (self.0)()
    }
}

impl std::fmt::Debug for SourceRetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SourceRetry")
    }
}

/// Lifecycle of a producing source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Not yet polled.
    Idle,
    /// At least one chunk requested.
    Producing,
    /// The underlying producer ran dry and was closed.
    Completed,
    /// The underlying producer failed and was closed.
    Failed,
    /// The consumer went away before completion; closed quietly.
    Cancelled,
}

/// A byte-producing input with an optional restart facility.
pub struct ByteSource {
    stream: ChunkStream,
    retry: Option<SourceRetry>,
}

impl ByteSource {
    /// Wraps an already demand-driven chunk stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
            retry: None,
        }
    }

    /// Wraps a chunk stream that can be re-opened through `retry`.
    pub fn from_stream_with_retry<S, F>(stream: S, retry: F) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
        F: Fn() -> ChunkStream + Send + Sync + 'static,
    {
        Self {
            stream: stream.boxed(),
            retry: Some(SourceRetry(Arc::new(retry))),
        }
    }

    /// Reads from a synchronous reader, one read of up to `buf_size` bytes
    /// per demand unit.
    pub fn from_reader<R>(reader: R, buf_size: usize) -> Result<Self>
    where
        R: Read + Send + Unpin + 'static,
    {
        Ok(Self {
            stream: ReaderSource::new(reader, buf_size)?.boxed(),
            retry: None,
        })
    }

    /// Reads from a synchronous reader with a restart facility that re-opens
    /// an equivalent reader.
    pub fn from_reader_with_retry<R, F>(reader: R, retry: F, buf_size: usize) -> Result<Self>
    where
        R: Read + Send + Unpin + 'static,
        F: Fn() -> R + Send + Sync + 'static,
    {
        let retry = move || match ReaderSource::new(retry(), buf_size) {
            Ok(source) => source.boxed(),
            Err(error) => stream::iter([Err(error)]).boxed(),
        };
        Ok(Self {
            stream: ReaderSource::new(reader, buf_size)?.boxed(),
            retry: Some(SourceRetry(Arc::new(retry))),
        })
    }

    /// Serves an in-memory buffer. The buffer is cheap to clone, so the
    /// restart facility comes for free.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let retry_bytes = bytes.clone();
        let retry = move || stream::iter([Ok(retry_bytes.clone())]).boxed();
        Self {
            stream: stream::iter([Ok(bytes)]).boxed(),
            retry: Some(SourceRetry(Arc::new(retry))),
        }
    }

    /// Serves an in-memory buffer with an explicit restart facility.
    pub fn from_bytes_with_retry<F>(bytes: impl Into<Bytes>, retry: F) -> Self
    where
        F: Fn() -> ChunkStream + Send + Sync + 'static,
    {
        Self {
            stream: stream::iter([Ok(bytes.into())]).boxed(),
            retry: Some(SourceRetry(Arc::new(retry))),
        }
    }

    /// The restart handle, when the underlying producer can be re-opened.
    pub fn retry(&self) -> Option<SourceRetry> {
        self.retry.clone()
    }

    /// Consumes the source into its demand-driven chunk stream.
    pub fn into_stream(self) -> ChunkStream {
        self.stream
    }

    /// Splits the source into its chunk stream and restart handle.
    pub fn into_parts(self) -> (ChunkStream, Option<SourceRetry>) {
        (self.stream, self.retry)
    }
}

impl std::fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteSource")
            .field("retryable", &self.retry.is_some())
            .finish()
    }
}

/// Demand-driven adapter over a synchronous reader.
///
/// Each poll performs at most one read of up to `buf_size` bytes. Exhaustion
/// closes the reader and completes; a read error closes the reader and fails;
/// dropping the stream mid-production closes the reader quietly.
struct ReaderSource<R> {
    reader: Option<R>,
    buf_size: usize,
    state: SourceState,
}

impl<R: Read> ReaderSource<R> {
    fn new(reader: R, buf_size: usize) -> Result<Self> {
        if buf_size == 0 {
            return Err(ConvertError::invalid_argument(
                "reader buffer size must be a positive number",
            ));
        }
        Ok(Self {
            reader: Some(reader),
            buf_size,
            state: SourceState::Idle,
        })
    }
}

impl<R: Read + Unpin> Stream for ReaderSource<R> {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(reader) = this.reader.as_mut() else {
            return Poll::Ready(None);
        };
        this.state = SourceState::Producing;

        let mut buf = vec![0u8; this.buf_size];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    this.reader = None;
                    this.state = SourceState::Completed;
                    return Poll::Ready(None);
                }
                Ok(n) => {
                    buf.truncate(n);
                    return Poll::Ready(Some(Ok(Bytes::from(buf))));
                }
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    this.reader = None;
                    this.state = SourceState::Failed;
                    return Poll::Ready(Some(Err(error.into())));
                }
            }
        }
    }
}

impl<R> Drop for ReaderSource<R> {
    fn drop(&mut self) {
        if matches!(self.state, SourceState::Idle | SourceState::Producing)
            && self.reader.take().is_some()
        {
            self.state = SourceState::Cancelled;
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn reader_obeys_demand_unit_size() {
        let data = vec![7u8; 10];
        let source = ByteSource::from_reader(std::io::Cursor::new(data), 4).unwrap();
        let chunks: Vec<Bytes> = source
            .into_stream()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(
            chunks.iter().map(Bytes::len).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
    }

    #[tokio::test]
    async fn zero_buf_size_is_rejected() {
        let result = ByteSource::from_reader(std::io::Cursor::new(vec![1u8]), 0);
        assert!(matches!(result, Err(ConvertError::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn reader_error_fails_and_closes() {
        struct FailingReader;
        impl Read for FailingReader {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("disk on fire"))
            }
        }

        let mut stream = ByteSource::from_reader(FailingReader, 8).unwrap().into_stream();
        let error = stream.next().await.unwrap().unwrap_err();
        assert!(error.to_string().contains("disk on fire"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn bytes_source_has_implicit_retry() {
        let source = ByteSource::from_bytes(Bytes::from_static(b"hello"));
        let retry = source.retry().expect("in-memory sources restart for free");

        let first: Vec<_> = source.into_stream().collect().await;
        assert_eq!(first.len(), 1);

        let again: Vec<_> = retry.open().collect().await;
        assert_eq!(again[0].as_ref().unwrap(), &Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn bounded_demand_sees_bounded_chunks() {
        let data = vec![1u8; 64];
        let source = ByteSource::from_reader(std::io::Cursor::new(data), 8).unwrap();
        let taken: Vec<_> = source.into_stream().take(2).collect().await;
        assert_eq!(taken.len(), 2);
    }
}
