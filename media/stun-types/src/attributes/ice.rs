use super::{Attribute, fixed_value};
use crate::Error;
use crate::builder::MessageBuilder;
use crate::parse::{AttrSpan, Message};
use bytes::BufMut;

/// Priority a peer reflexive candidate discovered by this check would get
///
/// [RFC8445](https://datatracker.ietf.org/doc/html/rfc8445#section-16.1)
pub struct Priority(pub u32);

impl Attribute<'_> for Priority {
    type Context = ();
    const TYPE: u16 = 0x0024;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        fixed_value(msg, attr, "priority value must be 4 bytes").map(|v| Self(u32::from_be_bytes(v)))
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        builder.buffer().put_u32(self.0);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(4)
    }
}

/// Flag set by the controlling agent to nominate the pair the check is sent on
pub struct UseCandidate;

impl Attribute<'_> for UseCandidate {
    type Context = ();
    const TYPE: u16 = 0x0025;

    fn decode(_: Self::Context, _: &mut Message, _: AttrSpan) -> Result<Self, Error> {
        Ok(Self)
    }

    fn encode(&self, _: Self::Context, _: &mut MessageBuilder) {}

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(0)
    }
}

/// Declares a role attribute carrying the 64 bit tie breaker
macro_rules! role_attribute {
    ($name:ident, $typ:expr, $what:literal) => {
        pub struct $name(pub u64);

        impl Attribute<'_> for $name {
            type Context = ();
            const TYPE: u16 = $typ;

            fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
                fixed_value(msg, attr, $what).map(|v| Self(u64::from_be_bytes(v)))
            }

            fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
                builder.buffer().put_u64(self.0);
            }

            fn encode_len(&self) -> Result<u16, Error> {
                Ok(8)
            }
        }
    };
}

role_attribute!(IceControlled, 0x8029, "ice-controlled value must be 8 bytes");
role_attribute!(IceControlling, 0x802A, "ice-controlling value must be 8 bytes");
