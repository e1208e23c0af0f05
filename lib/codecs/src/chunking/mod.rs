//! Re-framing of a byte stream into fixed-size chunks.

use std::{
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use tokio_util::codec::Decoder;

use crate::decoding::framing::FramingError;

/// The default size of an emitted chunk, in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Config used to build a `Chunker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// The exact size of every emitted chunk except the last, which carries
    /// the residual bytes.
    pub chunk_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ChunkerConfig {
    /// Creates a new `ChunkerConfig` with the given chunk size.
    pub const fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    /// Build the `Chunker` from this configuration.
    ///
    /// A chunk size of zero is rejected at construction time.
    pub fn build(&self) -> Result<Chunker, FramingError> {
        if self.chunk_size == 0 {
            return Err(FramingError::InvalidChunkSize);
        }
        Ok(Chunker {
            chunk_size: self.chunk_size,
        })
    }
}

/// A codec that cuts an incoming byte sequence into frames of exactly
/// `chunk_size` bytes, with the final frame carrying any residual bytes.
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    /// Returns the configured chunk size.
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Splits one full chunk off the accumulator, if enough bytes are buffered.
    pub fn next_chunk(&self, buf: &mut BytesMut) -> Option<Bytes> {
        (buf.len() >= self.chunk_size).then(|| buf.split_to(self.chunk_size).freeze())
    }

    /// Drains the residual tail after upstream completion.
    pub fn flush(&self, buf: &mut BytesMut) -> Option<Bytes> {
        (!buf.is_empty()).then(|| buf.split().freeze())
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Decoder for Chunker {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.next_chunk(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.next_chunk(src).or_else(|| self.flush(src)))
    }
}

/// A stream adapter that applies a [`Chunker`] to an upstream byte stream.
///
/// Each subscription owns its accumulator; concurrent instances never share
/// state. An upstream error is propagated unchanged and the accumulator is
/// discarded without a tail flush.
#[pin_project::pin_project]
#[derive(Debug)]
pub struct ChunkedStream<S> {
    #[pin]
    inner: S,
    chunker: Chunker,
    buf: BytesMut,
    done: bool,
}

impl<S> ChunkedStream<S> {
    /// Creates a new `ChunkedStream` over `inner`.
    pub fn new(inner: S, chunker: Chunker) -> Self {
        Self {
            inner,
            chunker,
            buf: BytesMut::new(),
            done: false,
        }
    }
}

impl<S, E> Stream for ChunkedStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if *this.done {
                return Poll::Ready(None);
            }
            if let Some(chunk) = this.chunker.next_chunk(this.buf) {
                return Poll::Ready(Some(Ok(chunk)));
            }
            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => this.buf.extend_from_slice(&bytes),
                Some(Err(error)) => {
                    *this.done = true;
                    this.buf.clear();
                    return Poll::Ready(Some(Err(error)));
                }
                None => {
                    *this.done = true;
                    return Poll::Ready(this.chunker.flush(this.buf).map(Ok));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[test]
    fn reject_zero_chunk_size() {
        assert!(matches!(
            ChunkerConfig::new(0).build(),
            Err(FramingError::InvalidChunkSize)
        ));
    }

    #[test]
    fn decode_exact_frames() {
        let chunker = ChunkerConfig::new(4).build().unwrap();
        let mut decoder = chunker;
        let mut input = BytesMut::from(&b"abcdefghij"[..]);

        assert_eq!(decoder.decode(&mut input).unwrap().unwrap(), "abcd");
        assert_eq!(decoder.decode(&mut input).unwrap().unwrap(), "efgh");
        assert_eq!(decoder.decode(&mut input).unwrap(), None);
        assert_eq!(decoder.decode_eof(&mut input).unwrap().unwrap(), "ij");
        assert_eq!(decoder.decode_eof(&mut input).unwrap(), None);
    }

    #[tokio::test]
    async fn stream_reframes_arbitrary_chunk_sizes() {
        let pieces: Vec<Result<Bytes, FramingError>> = vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cdefg")),
            Ok(Bytes::from_static(b"h")),
            Ok(Bytes::from_static(b"ijk")),
        ];
        let chunker = ChunkerConfig::new(4).build().unwrap();
        let out: Vec<_> = ChunkedStream::new(futures::stream::iter(pieces), chunker)
            .collect()
            .await;

        let out: Vec<Bytes> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(out, vec!["abcd", "efgh", "ijk"]);
    }

    #[tokio::test]
    async fn stream_propagates_error_without_flush() {
        let pieces: Vec<Result<Bytes, &str>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Err("upstream failed"),
            Ok(Bytes::from_static(b"never")),
        ];
        let chunker = ChunkerConfig::new(8).build().unwrap();
        let mut stream = ChunkedStream::new(futures::stream::iter(pieces), chunker);

        assert_eq!(stream.next().await.unwrap().unwrap_err(), "upstream failed");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn empty_input_emits_nothing() {
        let pieces: Vec<Result<Bytes, FramingError>> = vec![];
        let chunker = Chunker::default();
        let mut stream = ChunkedStream::new(futures::stream::iter(pieces), chunker);
        assert!(stream.next().await.is_none());
    }
}
