//! Decoder for the multiplexed exec stream.
//!
//! Each frame is an 8 byte header followed by its payload:
//!
//! ```text
//! [tag, 0, 0, 0, len_be_u32...] payload(len)
//! ```
//!
//! Tag 1 is stdout, tag 2 is stderr. Tag 0 (stdin) is accepted and routed to stdout,
//! matching what the engine does when it echoes input.

use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};

const HEADER_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub channel: Channel,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("invalid frame header {header:02x?}")]
    BadHeader { header: [u8; 4] },
    #[error("stream ended inside a frame ({0} trailing bytes)")]
    Truncated(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct MuxDecoder;

impl Decoder for MuxDecoder {
    type Item = Frame;
    type Error = DemuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DemuxError> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let channel = match src[0] {
            0 | 1 => Channel::Stdout,
            2 => Channel::Stderr,
            _ => {
                return Err(DemuxError::BadHeader {
                    header: [src[0], src[1], src[2], src[3]],
                })
            }
        };
        if src[1..4] != [0, 0, 0] {
            return Err(DemuxError::BadHeader {
                header: [src[0], src[1], src[2], src[3]],
            });
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { channel, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DemuxError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(DemuxError::Truncated(src.len())),
        }
    }
}

/// Bytes captured from both channels of a finished exec.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CapturedOutput {
    pub fn push(&mut self, frame: &Frame) {
        match frame.channel {
            Channel::Stdout => self.stdout.extend_from_slice(&frame.payload),
            Channel::Stderr => self.stderr.extend_from_slice(&frame.payload),
        }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

pub fn frames<R: AsyncRead>(reader: R) -> FramedRead<R, MuxDecoder> {
    FramedRead::new(reader, MuxDecoder)
}

/// Drains `reader` to the end, routing every frame into its channel buffer.
pub async fn collect<R: AsyncRead + Unpin>(reader: R) -> Result<CapturedOutput, DemuxError> {
    let mut output = CapturedOutput::default();
    let mut frames = frames(reader);
    while let Some(frame) = frames.next().await {
        output.push(&frame?);
    }
    Ok(output)
}

/// Encodes one frame. Used by tests and fakes that need to speak the wire format.
pub fn encode_frame(channel: Channel, payload: &[u8]) -> Vec<u8> {
    let tag = match channel {
        Channel::Stdout => 1u8,
        Channel::Stderr => 2u8,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&[tag, 0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
