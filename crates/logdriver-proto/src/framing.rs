// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! Length-delimited framing for the log-entry stream.
//!
//! Each frame is a 4-byte big-endian length prefix followed by exactly that
//! many bytes of protobuf-encoded [`LogEntry`]. The codec buffers partial
//! frames across reads, skips frames it cannot use without tearing down the
//! stream, and treats end-of-stream inside a frame as normal closure (the
//! writer exits whenever the container does).

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::entry::LogEntry;

/// Largest frame the stream may declare, matching the bound the Docker
/// daemon applies on its side of the fifo.
pub const MAX_FRAME_LEN: usize = 1_000_000;

const HEADER_LEN: usize = 4;

/// Why a frame was dropped instead of decoded.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The length prefix exceeded the configured bound. The declared number
    /// of bytes is discarded so decoding can resume at the next prefix.
    #[error("frame length {declared} exceeds limit {limit}")]
    Oversized { declared: usize, limit: usize },
    /// The frame was well delimited but its payload is not a valid entry.
    #[error("frame payload does not decode: {0}")]
    Payload(#[from] prost::DecodeError),
}

/// One unit of decoder output. Dropped frames surface as [`Frame::Skipped`]
/// items rather than stream errors so a single corrupt frame never
/// terminates the session.
#[derive(Debug)]
pub enum Frame {
    Entry(LogEntry),
    Skipped(FrameError),
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    /// Waiting for the 4-byte length prefix.
    Header,
    /// Prefix read, waiting for this many payload bytes.
    Payload(usize),
    /// Throwing away the remainder of an oversized frame.
    Discard(usize),
}

/// Codec for the length-delimited [`LogEntry`] stream.
#[derive(Debug)]
pub struct EntryCodec {
    state: DecodeState,
    max_frame_len: usize,
}

impl EntryCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    /// A codec with a non-default frame bound, used by tests to exercise
    /// the oversize path without megabyte fixtures.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        EntryCodec {
            state: DecodeState::Header,
            max_frame_len,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for EntryCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EntryCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if src.len() < HEADER_LEN {
                        src.reserve(HEADER_LEN - src.len());
                        return Ok(None);
                    }
                    let declared = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
                    src.advance(HEADER_LEN);
                    if declared > self.max_frame_len {
                        self.state = DecodeState::Discard(declared);
                        return Ok(Some(Frame::Skipped(FrameError::Oversized {
                            declared,
                            limit: self.max_frame_len,
                        })));
                    }
                    self.state = DecodeState::Payload(declared);
                }
                DecodeState::Payload(len) => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let payload = src.split_to(len).freeze();
                    self.state = DecodeState::Header;
                    return match LogEntry::decode(payload) {
                        Ok(entry) => Ok(Some(Frame::Entry(entry))),
                        Err(err) => Ok(Some(Frame::Skipped(FrameError::Payload(err)))),
                    };
                }
                DecodeState::Discard(remaining) => {
                    if src.len() < remaining {
                        let taken = src.len();
                        src.advance(taken);
                        self.state = DecodeState::Discard(remaining - taken);
                        return Ok(None);
                    }
                    src.advance(remaining);
                    self.state = DecodeState::Header;
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // Leftover bytes are a frame cut off by closure. The writer
                // is gone, so there is no later boundary to resynchronize
                // on; report clean end of stream.
                if !src.is_empty() {
                    src.clear();
                }
                self.state = DecodeState::Header;
                Ok(None)
            }
        }
    }
}

impl Encoder<LogEntry> for EntryCodec {
    type Error = io::Error;

    fn encode(&mut self, entry: LogEntry, dst: &mut BytesMut) -> Result<(), io::Error> {
        let len = entry.encoded_len();
        if len > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("entry encodes to {len} bytes, over the {} limit", self.max_frame_len),
            ));
        }
        dst.reserve(HEADER_LEN + len);
        dst.put_u32(len as u32);
        entry
            .encode(dst)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        Ok(())
    }
}
