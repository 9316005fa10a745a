use super::{Attribute, BytesAttribute, fixed_value};
use crate::Error;
use crate::builder::MessageBuilder;
use crate::parse::{AttrSpan, Message};
use bytes::BufMut;

/// Channel numbers usable with ChannelBind
pub const CHANNEL_NUMBER_RANGE: std::ops::RangeInclusive<u16> = 0x4000..=0x4FFF;

/// [RFC8656](https://datatracker.ietf.org/doc/html/rfc8656#section-18.1)
pub struct ChannelNumber(pub u16);

impl Attribute<'_> for ChannelNumber {
    type Context = ();
    const TYPE: u16 = 0x000C;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        let [a, b, _, _] = fixed_value(msg, attr, "channel number value must be 4 bytes")?;
        Ok(Self(u16::from_be_bytes([a, b])))
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        // channel number followed by RFFU
        builder.buffer().put_u16(self.0);
        builder.buffer().put_u16(0);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(4)
    }
}

/// Lifetime of an allocation in seconds
///
/// [RFC8656](https://datatracker.ietf.org/doc/html/rfc8656#section-18.2)
pub struct Lifetime(pub u32);

impl Attribute<'_> for Lifetime {
    type Context = ();
    const TYPE: u16 = 0x000D;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        fixed_value(msg, attr, "lifetime value must be 4 bytes").map(|v| Self(u32::from_be_bytes(v)))
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        builder.buffer().put_u32(self.0);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(4)
    }
}

/// [RFC8656](https://datatracker.ietf.org/doc/html/rfc8656#section-18.4)
pub type Data<'s> = BytesAttribute<'s, 0x0013>;

/// [RFC8656](https://datatracker.ietf.org/doc/html/rfc8656#section-18.6)
pub struct EvenPort(pub bool);

impl Attribute<'_> for EvenPort {
    type Context = ();
    const TYPE: u16 = 0x0018;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        let [flags] = fixed_value(msg, attr, "even-port value must be 1 byte")?;
        Ok(Self(flags & 0x80 != 0))
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        builder.buffer().put_u8(if self.0 { 0x80 } else { 0 });
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(1)
    }
}

/// [RFC8656](https://datatracker.ietf.org/doc/html/rfc8656#section-18.7)
pub struct RequestedTransport {
    /// IANA protocol number, 17 is UDP
    pub protocol_number: u8,
}

impl RequestedTransport {
    pub const UDP: Self = Self {
        protocol_number: 17,
    };
}

impl Attribute<'_> for RequestedTransport {
    type Context = ();
    const TYPE: u16 = 0x0019;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        let [protocol_number, ..] =
            fixed_value::<4>(msg, attr, "requested-transport value must be 4 bytes")?;

        Ok(Self { protocol_number })
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        builder.buffer().put_u8(self.protocol_number);
        builder.buffer().put_bytes(0, 3);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(4)
    }
}

/// [RFC8656](https://datatracker.ietf.org/doc/html/rfc8656#section-18.8)
pub struct DontFragment;

impl Attribute<'_> for DontFragment {
    type Context = ();
    const TYPE: u16 = 0x001A;

    fn decode(_: Self::Context, _: &mut Message, _: AttrSpan) -> Result<Self, Error> {
        Ok(Self)
    }

    fn encode(&self, _: Self::Context, _: &mut MessageBuilder) {}

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(0)
    }
}

/// [RFC8656](https://datatracker.ietf.org/doc/html/rfc8656#section-18.9)
pub struct ReservationToken(pub [u8; 8]);

impl Attribute<'_> for ReservationToken {
    type Context = ();
    const TYPE: u16 = 0x0022;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        fixed_value(msg, attr, "reservation token must be 8 bytes").map(Self)
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        builder.buffer().extend_from_slice(&self.0);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(8)
    }
}
