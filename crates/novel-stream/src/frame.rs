//! Reassembles an arbitrarily chunked byte stream into protocol frames.
//!
//! A frame ends at a blank line (`\n\n` or `\r\n\r\n`). Only frames carrying a
//! `data:` line produce a payload; anything else is padding. The literal
//! payload `[DONE]` ends decoding.

use futures::stream::{self, Stream, StreamExt as _, TryStreamExt as _};
use tracing::debug;

use crate::errors::ExchangeError;

/// Reserved payload marking the end of an exchange.
pub const DONE_SENTINEL: &str = "[DONE]";

const DATA_MARKER: &str = "data:";

/// One complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload text with the marker removed. Not yet classified.
    Payload(String),
    /// The end-of-exchange sentinel.
    Done,
}

/// Incremental frame decoder. Buffers bytes until a full boundary is seen.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Offset below which `buf` holds no frame boundary.
    scanned: usize,
    done: bool,
}

impl FrameDecoder {
    /// Feeds one transport chunk and returns every frame it completes.
    ///
    /// After the sentinel is decoded, remaining and future input is ignored.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Frame> {
        if self.done {
            return Vec::new();
        }
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            let Some((idx, delim_len)) = find_frame_delimiter(&self.buf, self.scanned) else {
                // A boundary split across chunks starts at most 3 bytes back.
                self.scanned = self.buf.len().saturating_sub(3);
                break;
            };
            let frame_bytes = self.buf[..idx].to_vec();
            self.buf.drain(..idx + delim_len);
            self.scanned = 0;
            let Some(payload) = parse_frame(&frame_bytes) else {
                continue;
            };
            if payload == DONE_SENTINEL {
                self.done = true;
                self.buf.clear();
                self.scanned = 0;
                frames.push(Frame::Done);
                break;
            }
            frames.push(Frame::Payload(payload));
        }
        frames
    }

    /// True once the sentinel has been decoded.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Signals that the transport closed.
    ///
    /// Residue that is not blank means the stream was cut mid-frame; it is
    /// discarded and reported as a transport error.
    pub fn finish(&mut self) -> Result<(), ExchangeError> {
        let residue = std::mem::take(&mut self.buf);
        self.scanned = 0;
        if self.done || residue.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        Err(ExchangeError::transport(format!(
            "stream closed mid-frame ({} bytes discarded)",
            residue.len()
        )))
    }

    /// Drops any partial frame after a transport failure.
    pub fn discard(&mut self) {
        if !self.buf.is_empty() {
            debug!(bytes = self.buf.len(), "discarding partial frame");
        }
        self.buf.clear();
        self.scanned = 0;
    }
}

fn find_frame_delimiter(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_frame(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix(DATA_MARKER) {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    Some(data_lines.join("\n"))
}

/// Lazily decodes a byte stream into batches of frames, one batch per chunk
/// that completed at least one frame.
///
/// Ends after the sentinel or a clean close. A transport error, or a close
/// that leaves a partial frame behind, is yielded as the final item.
pub fn frame_batches<S, B>(bytes: S) -> impl Stream<Item = Result<Vec<Frame>, ExchangeError>>
where
    S: Stream<Item = Result<B, ExchangeError>> + Unpin,
    B: AsRef<[u8]>,
{
    struct State<S> {
        bytes: S,
        decoder: FrameDecoder,
        done: bool,
    }

    stream::try_unfold(
        State {
            bytes,
            decoder: FrameDecoder::default(),
            done: false,
        },
        |mut state| async move {
            loop {
                if state.done {
                    return Ok(None);
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        let frames = state.decoder.push_chunk(chunk.as_ref());
                        state.done = state.decoder.is_done();
                        if frames.is_empty() {
                            continue;
                        }
                        return Ok(Some((frames, state)));
                    }
                    Some(Err(err)) => {
                        state.decoder.discard();
                        return Err(err);
                    }
                    None => {
                        state.decoder.finish()?;
                        state.done = true;
                    }
                }
            }
        },
    )
}

/// Lazily decodes a byte stream into individual frames.
pub fn frames<S, B>(bytes: S) -> impl Stream<Item = Result<Frame, ExchangeError>>
where
    S: Stream<Item = Result<B, ExchangeError>> + Unpin,
    B: AsRef<[u8]>,
{
    frame_batches(bytes)
        .map_ok(|batch| stream::iter(batch.into_iter().map(Ok)))
        .try_flatten()
}
