//! Framing of STUN & ChannelData messages on stream transports (TCP/TLS)
//!
//! [RFC8656](https://datatracker.ietf.org/doc/html/rfc8656#section-12.5)

use crate::channel_data::{CHANNEL_DATA_HEADER_LEN, ChannelData, is_channel_data};
use crate::{IsStunMessageInfo, is_stun_message};
use bytes::{Buf, BytesMut};

/// A single message read from a stream
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Stun(Vec<u8>),
    /// Raw ChannelData message without its stream padding
    ChannelData(Vec<u8>),
}

/// Accumulates bytes received on a stream and splits them into messages
#[derive(Default)]
pub struct StreamFramer {
    buffer: BytesMut,
}

#[derive(Debug, thiserror::Error)]
#[error("stream contains data that is neither STUN nor ChannelData")]
pub struct InvalidStream;

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete frame out of the buffer.
    ///
    /// Returns `Ok(None)` when more data is required. An error means the stream is out of sync and must be closed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, InvalidStream> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        if is_channel_data(&self.buffer) {
            if self.buffer.len() < CHANNEL_DATA_HEADER_LEN {
                return Ok(None);
            }

            let Some(padded_len) = ChannelData::frame_len(&self.buffer, true) else {
                return Ok(None);
            };

            if self.buffer.len() < padded_len {
                return Ok(None);
            }

            let unpadded_len = ChannelData::frame_len(&self.buffer, false).unwrap_or(padded_len);
            let frame = self.buffer.split_to(padded_len);

            return Ok(Some(Frame::ChannelData(frame[..unpadded_len].to_vec())));
        }

        match is_stun_message(&self.buffer) {
            IsStunMessageInfo::TooShort | IsStunMessageInfo::YesIncomplete { .. } => Ok(None),
            IsStunMessageInfo::No => Err(InvalidStream),
            IsStunMessageInfo::Yes { remaining } => {
                let len = self.buffer.len() - remaining;
                let frame = self.buffer.split_to(len).to_vec();
                Ok(Some(Frame::Stun(frame)))
            }
        }
    }

    pub fn clear(&mut self) {
        self.buffer.advance(self.buffer.len());
    }
}
