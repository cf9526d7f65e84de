//! Stream reassembly.
//!
//! Turns a chunked byte stream into complete frames. Bytes read from the
//! source but not yet consumed stay in a carry buffer that is threaded from
//! one call to the next. Before every frame the buffer is resynchronized on
//! the magic marker, so noise in front of a frame is discarded rather than
//! misread as a header. The header's length field alone decides where a frame
//! ends.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::{HEADER_SIZE, MAX_MESSAGE_SIZE, NETWORK_MAGIC};
use crate::error::{P2pError, P2pResult};
use crate::protocol::framing::FrameHeader;

/// Bytes requested from the source per read.
const READ_CHUNK: usize = 8 * 1024;

/// Locate the magic marker in `buf`.
pub fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(NETWORK_MAGIC.len())
        .position(|window| window == NETWORK_MAGIC)
}

/// Extracts frames from a carry buffer.
#[derive(Debug, Clone, Copy)]
pub struct StreamReassembler {
    max_message_size: usize,
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamReassembler {
    /// Create a reassembler with the default size limit.
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    /// Create a reassembler with a custom body size limit.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Drop bytes in front of the first magic marker. Returns how many bytes
    /// were discarded.
    ///
    /// Without a marker, everything except a possible marker prefix at the
    /// tail is dropped.
    pub fn resync(&self, carry: &mut BytesMut) -> usize {
        let discard = match find_magic(carry) {
            Some(offset) => offset,
            None => carry.len().saturating_sub(NETWORK_MAGIC.len() - 1),
        };
        if discard > 0 {
            tracing::trace!(discarded = discard, "Resynchronizing on frame magic");
            carry.advance(discard);
        }
        discard
    }

    /// Take one complete frame off the front of `carry`, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn extract_frame(&self, carry: &mut BytesMut) -> P2pResult<Option<Bytes>> {
        self.resync(carry);

        if carry.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = FrameHeader::parse(&carry[..HEADER_SIZE])?;
        let length = header.payload_len as usize;
        if length > self.max_message_size {
            return Err(P2pError::MessageTooLarge {
                size: length,
                max: self.max_message_size,
            });
        }

        let frame_len = header.frame_len();
        if carry.len() < frame_len {
            carry.reserve(frame_len - carry.len());
            return Ok(None);
        }

        Ok(Some(carry.split_to(frame_len).freeze()))
    }

    /// Like [`extract_frame`](Self::extract_frame), for when the source has
    /// ended.
    ///
    /// A partial header is discarded and reported as end of stream. A
    /// complete header whose body never fully arrived is a
    /// [`P2pError::TruncatedStream`].
    pub fn extract_at_eof(&self, carry: &mut BytesMut) -> P2pResult<Option<Bytes>> {
        if let Some(frame) = self.extract_frame(carry)? {
            return Ok(Some(frame));
        }

        if carry.len() >= HEADER_SIZE {
            let header = FrameHeader::parse(&carry[..HEADER_SIZE])?;
            return Err(P2pError::TruncatedStream {
                expected: header.payload_len as usize,
                received: carry.len() - HEADER_SIZE,
            });
        }

        carry.clear();
        Ok(None)
    }

    /// Read from `source` until one complete frame is buffered.
    ///
    /// Returns `Ok(None)` on end of stream. Whatever follows the frame stays
    /// in `carry` for the next call.
    pub async fn next_frame<R>(&self, source: &mut R, carry: &mut BytesMut) -> P2pResult<Option<Bytes>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if let Some(frame) = self.extract_frame(carry)? {
                return Ok(Some(frame));
            }

            carry.reserve(READ_CHUNK);
            if source.read_buf(carry).await? == 0 {
                return self.extract_at_eof(carry);
            }
        }
    }
}

/// A byte source paired with its carry buffer.
pub struct FrameReader<R> {
    source: R,
    carry: BytesMut,
    reassembler: StreamReassembler,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a byte source with an empty carry buffer.
    pub fn new(source: R, reassembler: StreamReassembler) -> Self {
        Self {
            source,
            carry: BytesMut::new(),
            reassembler,
        }
    }

    /// Read the next complete frame, or `None` at end of stream.
    pub async fn next_frame(&mut self) -> P2pResult<Option<Bytes>> {
        self.reassembler
            .next_frame(&mut self.source, &mut self.carry)
            .await
    }

    /// The underlying source, for writing back on bidirectional streams.
    pub fn source_mut(&mut self) -> &mut R {
        &mut self.source
    }

    /// Bytes buffered but not yet consumed.
    pub fn carry(&self) -> &[u8] {
        &self.carry
    }

    /// Split into the source and the remaining carry buffer.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.source, self.carry)
    }
}
