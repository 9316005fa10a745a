//! TURN ChannelData messages
//!
//! [RFC8656](https://datatracker.ietf.org/doc/html/rfc8656#section-12.4)

use crate::{Error, padding_usize};
use bytes::BufMut;

pub const CHANNEL_DATA_HEADER_LEN: usize = 4;

/// Returns if the first byte marks the start of a ChannelData message (channel numbers 0x4000-0x7FFF)
pub fn is_channel_data(i: &[u8]) -> bool {
    matches!(i.first(), Some(0x40..=0x7F))
}

#[derive(Debug, PartialEq, Eq)]
pub struct ChannelData<'d> {
    pub number: u16,
    pub data: &'d [u8],
}

impl<'d> ChannelData<'d> {
    /// Parse a ChannelData message, trailing padding is ignored
    pub fn parse(i: &'d [u8]) -> Result<Self, Error> {
        if i.len() < CHANNEL_DATA_HEADER_LEN || !is_channel_data(i) {
            return Err(Error::InvalidData("not a channel data message"));
        }

        let number = u16::from_be_bytes([i[0], i[1]]);
        let len = usize::from(u16::from_be_bytes([i[2], i[3]]));

        let data = i
            .get(CHANNEL_DATA_HEADER_LEN..CHANNEL_DATA_HEADER_LEN + len)
            .ok_or(Error::InvalidData("channel data length exceeds buffer"))?;

        Ok(Self { number, data })
    }

    /// Total length of the message inside a buffer starting with a ChannelData header.
    ///
    /// `padded` must be true for stream transports, where messages are padded to 4 bytes.
    pub fn frame_len(header: &[u8], padded: bool) -> Option<usize> {
        let len = usize::from(u16::from_be_bytes([*header.get(2)?, *header.get(3)?]));

        if padded {
            Some(CHANNEL_DATA_HEADER_LEN + len + padding_usize(len))
        } else {
            Some(CHANNEL_DATA_HEADER_LEN + len)
        }
    }

    /// Serialize the message, always padding the data to a multiple of 4
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let len = u16::try_from(self.data.len())?;

        let mut buf =
            Vec::with_capacity(CHANNEL_DATA_HEADER_LEN + self.data.len() + padding_usize(self.data.len()));
        buf.put_u16(self.number);
        buf.put_u16(len);
        buf.put_slice(self.data);
        buf.put_bytes(0, padding_usize(self.data.len()));

        Ok(buf)
    }
}
