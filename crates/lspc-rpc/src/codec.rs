//! `Content-Length` framing.
//!
//! Turns an arbitrarily chunked byte stream into discrete payloads.
//! Uses a two-state machine over a single `BytesMut` buffer:
//! - `AwaitingHeader`: scanning for the `\r\n\r\n` header terminator
//! - `AwaitingBody`: header parsed, waiting for the declared number of bytes
//!
//! Lengths are always byte counts, so multi-byte UTF-8 payloads are never
//! cut short.

use crate::error::FramingError;
use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use pin_project_lite::pin_project;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Longest header block accepted before the terminator must appear.
pub const MAX_HEADER_LEN: usize = 4096;

/// Default upper bound for a single declared body length (64 MiB).
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "Content-Length";
const CONTENT_TYPE: &str = "Content-Type";
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Where the decoder is in the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Waiting for a complete header block.
    AwaitingHeader,
    /// Header parsed; `length` body bytes make up the frame.
    AwaitingBody { length: usize },
}

/// One complete protocol message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Interpret the body as UTF-8 text.
    pub fn to_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Incremental decoder for `Content-Length` framed messages.
///
/// Bytes are never dropped: anything past the end of one frame stays in the
/// buffer as the start of the next.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: DecoderState,
    max_content_length: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_content_length(DEFAULT_MAX_CONTENT_LENGTH)
    }

    /// Create a decoder that rejects bodies longer than `max_content_length`.
    pub fn with_max_content_length(max_content_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            state: DecoderState::AwaitingHeader,
            max_content_length,
        }
    }

    /// Ingest a chunk and hand every frame it completes to `emit`, in order.
    ///
    /// Frames completed before a header error are still emitted. After an
    /// error the offending header stays buffered, so further pushes fail
    /// the same way.
    pub fn push(
        &mut self,
        chunk: impl AsRef<[u8]>,
        mut emit: impl FnMut(Frame),
    ) -> Result<(), FramingError> {
        self.buffer.extend_from_slice(chunk.as_ref());

        while let Some(frame) = self.next_frame()? {
            emit(frame);
        }
        Ok(())
    }

    /// Current state of the machine.
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Number of bytes held for frames not yet complete.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        loop {
            match self.state {
                DecoderState::AwaitingHeader => {
                    let Some(end) = find_terminator(&self.buffer) else {
                        if self.buffer.len() > MAX_HEADER_LEN {
                            return Err(FramingError::BadHeader(format!(
                                "no header terminator within {MAX_HEADER_LEN} bytes"
                            )));
                        }
                        return Ok(None);
                    };

                    let length = parse_header(&self.buffer[..end])?;
                    if length > self.max_content_length {
                        return Err(FramingError::TooLarge {
                            length,
                            max: self.max_content_length,
                        });
                    }

                    let _ = self.buffer.split_to(end + HEADER_TERMINATOR.len());
                    self.state = DecoderState::AwaitingBody { length };
                }
                DecoderState::AwaitingBody { length } => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(length).freeze();
                    self.state = DecoderState::AwaitingHeader;
                    return Ok(Some(Frame(body)));
                }
            }
        }
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

/// Parse a header block (without its terminator) into the declared length.
fn parse_header(raw: &[u8]) -> Result<usize, FramingError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| FramingError::BadHeader(format!("non-UTF-8 header {raw:?}")))?;

    let mut length = None;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            return Err(FramingError::BadHeader(format!("malformed line {line:?}")));
        };
        let name = name.trim();

        if name.eq_ignore_ascii_case(CONTENT_LENGTH) {
            if length.is_some() {
                return Err(FramingError::BadHeader(format!(
                    "duplicate {CONTENT_LENGTH} in {text:?}"
                )));
            }
            let value = value.trim();
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(FramingError::BadHeader(format!("{line:?}")));
            }
            let parsed = value
                .parse::<usize>()
                .map_err(|_| FramingError::BadHeader(format!("length out of range {line:?}")))?;
            length = Some(parsed);
        } else if !name.eq_ignore_ascii_case(CONTENT_TYPE) {
            return Err(FramingError::BadHeader(format!("unexpected header {line:?}")));
        }
    }

    length.ok_or_else(|| FramingError::BadHeader(format!("missing {CONTENT_LENGTH} in {text:?}")))
}

/// Frame a payload: `Content-Length: <byte length>\r\n\r\n<payload>`.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", payload.len());
    let mut out = BytesMut::with_capacity(header.len() + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out.freeze()
}

pin_project! {
    /// An async stream of [`Frame`]s read from any `AsyncRead`.
    ///
    /// Ends after the first error. EOF in the middle of a frame yields
    /// [`FramingError::Truncated`] once.
    pub struct FrameStream<R> {
        #[pin]
        reader: R,
        decoder: FrameDecoder,
        ready: VecDeque<Frame>,
        read_buf: Box<[u8]>,
        error: Option<FramingError>,
        finished: bool,
    }
}

impl<R: AsyncRead> FrameStream<R> {
    pub fn new(reader: R) -> Self {
        Self::with_decoder(reader, FrameDecoder::new())
    }

    pub fn with_decoder(reader: R, decoder: FrameDecoder) -> Self {
        Self {
            reader,
            decoder,
            ready: VecDeque::new(),
            read_buf: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
            error: None,
            finished: false,
        }
    }
}

impl<R: AsyncRead> Stream for FrameStream<R> {
    type Item = Result<Frame, FramingError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(frame) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if let Some(e) = this.error.take() {
                return Poll::Ready(Some(Err(e)));
            }
            if *this.finished {
                return Poll::Ready(None);
            }

            let mut buf = ReadBuf::new(&mut this.read_buf[..]);
            match this.reader.as_mut().poll_read(cx, &mut buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => {
                    *this.finished = true;
                    *this.error = Some(FramingError::Io(e));
                }
                Poll::Ready(Ok(())) => {
                    let filled = buf.filled();
                    if filled.is_empty() {
                        *this.finished = true;
                        let buffered = this.decoder.buffered();
                        if buffered > 0 {
                            *this.error = Some(FramingError::Truncated { buffered });
                        }
                        continue;
                    }

                    // Frames decoded ahead of a bad header drain before the error.
                    let ready = &mut *this.ready;
                    if let Err(e) = this.decoder.push(filled, |frame| ready.push_back(frame)) {
                        *this.finished = true;
                        *this.error = Some(e);
                    }
                }
            }
        }
    }
}
