//! Newline-delimited framing between byte streams and `Message`s
//!
//! The read side is a `FramedRead` over a raw line decoder, so a partial line
//! survives a cancelled read and the reader can sit inside `tokio::select!`.
//! The write side is a single-writer queue: every handle pushes complete frames
//! to one task that owns the output stream.

use std::{cmp, io};

use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::codec::{Decoder, FramedRead};

use crate::mcp::message::Message;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {reason}")]
pub struct MalformedFrame {
    pub line: u64,
    pub reason: String,
}

/// One pulled frame: a message, or a unit that had to be skipped.
pub type Decoded = Result<Message, MalformedFrame>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLine {
    Bytes(Bytes),
    /// A line longer than the limit; its bytes were discarded.
    Oversized,
}

/// Splits input on `\n` without interpreting the bytes.
///
/// Unlike `LinesCodec`, content problems (bad UTF-8, overlong lines) are items
/// rather than errors, so the stream keeps going after them.
#[derive(Debug, Clone)]
pub struct RawLineCodec {
    max_length: usize,
    next_index: usize,
    discarding: bool,
}

impl RawLineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Decoder for RawLineCodec {
    type Item = RawLine;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<RawLine>> {
        loop {
            let read_to = cmp::min(self.max_length.saturating_add(1), buf.len());
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.next_index = 0;
                    self.discarding = false;
                    return Ok(Some(RawLine::Oversized));
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let mut line = buf.split_to(end + 1);
                    line.truncate(end);
                    return Ok(Some(RawLine::Bytes(line.freeze())));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<RawLine>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            buf.clear();
            return Ok(Some(RawLine::Oversized));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(RawLine::Bytes(buf.split().freeze())))
    }
}

pub struct FrameReader<R> {
    lines: FramedRead<R, RawLineCodec>,
    max_frame_bytes: usize,
    line: u64,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_bytes(reader, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            lines: FramedRead::new(reader, RawLineCodec::new(max_frame_bytes)),
            max_frame_bytes,
            line: 0,
        }
    }

    /// Pulls the next frame. `Ok(None)` is end of stream.
    ///
    /// Blank lines are skipped silently; units that cannot be decoded are
    /// returned as `Err(MalformedFrame)` and the stream stays usable.
    pub async fn next_frame(&mut self) -> io::Result<Option<Decoded>> {
        loop {
            let Some(raw) = self.lines.next().await.transpose()? else {
                return Ok(None);
            };
            self.line += 1;

            let bytes = match raw {
                RawLine::Oversized => {
                    return Ok(Some(Err(MalformedFrame {
                        line: self.line,
                        reason: format!("frame exceeds {} bytes", self.max_frame_bytes),
                    })))
                }
                RawLine::Bytes(bytes) => bytes,
            };

            let unit = bytes.trim_ascii();
            if unit.is_empty() {
                continue;
            }

            return Ok(Some(decode_frame(unit).map_err(|reason| MalformedFrame {
                line: self.line,
                reason,
            })));
        }
    }
}

fn decode_frame(unit: &[u8]) -> Result<Message, String> {
    let value: Value =
        serde_json::from_slice(unit).map_err(|err| format!("invalid JSON: {err}"))?;
    Message::from_value(value).map_err(|err| err.to_string())
}

/// Serializes `message` as exactly one newline-terminated frame.
pub fn encode(message: &Message) -> io::Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    Ok(frame)
}

#[derive(Debug, Clone)]
pub struct FrameWriter {
    frames: mpsc::UnboundedSender<Vec<u8>>,
}

impl FrameWriter {
    /// Starts the writer task that owns `writer`.
    ///
    /// The task ends once every `FrameWriter` clone is dropped, after shutting
    /// the stream down; its result carries the first write failure.
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<io::Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (frames, mut queue) = mpsc::unbounded_channel::<Vec<u8>>();
        let task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(frame) = queue.recv().await {
                writer.write_all(&frame).await?;
                writer.flush().await?;
            }
            writer.shutdown().await
        });
        (Self { frames }, task)
    }

    pub fn write(&self, message: &Message) -> io::Result<()> {
        let frame = encode(message)?;
        self.frames.send(frame).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "output writer has stopped")
        })
    }
}
