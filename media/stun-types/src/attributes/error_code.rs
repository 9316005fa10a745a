use super::Attribute;
use crate::builder::MessageBuilder;
use crate::parse::{AttrSpan, Message};
use crate::{Error, NE};
use bitfield::bitfield;
use byteorder::ReadBytesExt;
use bytes::BufMut;
use std::str::from_utf8;

bitfield! {
    struct ErrorCodeHead(u32);
    number, set_number: 7, 0;
    class, set_class: 10, 8;
}

/// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.8)
#[derive(Debug)]
pub struct ErrorCode<'s> {
    pub number: u32,
    pub reason: &'s str,
}

impl ErrorCode<'_> {
    /// 401, credentials required or invalid
    pub const UNAUTHORIZED: u32 = 401;
    /// 438, the server rejected the nonce
    pub const STALE_NONCE: u32 = 438;
    /// 441, credentials do not match the allocation
    pub const WRONG_CREDENTIALS: u32 = 441;
    /// 486, the client already holds too many allocations
    pub const ALLOCATION_QUOTA_REACHED: u32 = 486;
}

impl<'s> Attribute<'s> for ErrorCode<'s> {
    type Context = ();
    const TYPE: u16 = 0x0009;

    fn decode(_: Self::Context, msg: &'s mut Message, attr: AttrSpan) -> Result<Self, Error> {
        let mut value = attr.get_value(msg.buffer());

        let head = ErrorCodeHead(value.read_u32::<NE>()?);

        Ok(Self {
            number: head.class() * 100 + head.number(),
            reason: from_utf8(value)?,
        })
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        let mut head = ErrorCodeHead(0);
        head.set_class(self.number / 100);
        head.set_number(self.number % 100);

        builder.buffer().put_u32(head.0);
        builder.buffer().extend_from_slice(self.reason.as_bytes());
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(u16::try_from(4 + self.reason.len())?)
    }
}
