use crate::Error;
use bitfield::bitfield;
use std::fmt;

pub(crate) const STUN_HEADER_LENGTH: usize = 20;

bitfield! {
    /// First 32 bits of every STUN message: two zero bits, message type and length
    pub struct MessageHead(u32);

    u8;
    pub z, _: 31, 30;

    u16;
    pub typ, set_typ: 29, 16;

    #[allow(clippy::len_without_is_empty)]
    pub len, set_len: 15, 0;
}

/// STUN message class, encoded in bits C0 and C1 of the message type
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Class {
    Request,
    Indication,
    Success,
    Error,
}

impl Class {
    const MASK: u16 = 0x110;

    fn bits(self) -> u16 {
        match self {
            Class::Request => 0x000,
            Class::Indication => 0x010,
            Class::Success => 0x100,
            Class::Error => 0x110,
        }
    }

    /// Extract the class from the 14 bit message type
    pub fn from_type(typ: u16) -> Self {
        match typ & Self::MASK {
            0x000 => Class::Request,
            0x010 => Class::Indication,
            0x100 => Class::Success,
            _ => Class::Error,
        }
    }
}

/// STUN and TURN methods used by the ICE agent and TURN client
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Method {
    Binding,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
}

impl Method {
    const MASK: u16 = 0x3EEF;

    fn bits(self) -> u16 {
        match self {
            Method::Binding => 0x1,
            Method::Allocate => 0x3,
            Method::Refresh => 0x4,
            Method::Send => 0x6,
            Method::Data => 0x7,
            Method::CreatePermission => 0x8,
            Method::ChannelBind => 0x9,
        }
    }

    pub fn from_type(typ: u16) -> Result<Self, Error> {
        match typ & Self::MASK {
            0x1 => Ok(Method::Binding),
            0x3 => Ok(Method::Allocate),
            0x4 => Ok(Method::Refresh),
            0x6 => Ok(Method::Send),
            0x7 => Ok(Method::Data),
            0x8 => Ok(Method::CreatePermission),
            0x9 => Ok(Method::ChannelBind),
            _ => Err(Error::InvalidData("unknown method")),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Binding => "Binding",
            Method::Allocate => "Allocate",
            Method::Refresh => "Refresh",
            Method::Send => "Send",
            Method::Data => "Data",
            Method::CreatePermission => "CreatePermission",
            Method::ChannelBind => "ChannelBind",
        })
    }
}

/// Combine class and method into the 14 bit message type
pub(crate) fn message_type(class: Class, method: Method) -> u16 {
    class.bits() | method.bits()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn type_bits() {
        // Allocate success response (RFC 8656 section 17)
        let typ = message_type(Class::Success, Method::Allocate);
        assert_eq!(typ, 0x0103);
        assert_eq!(Class::from_type(typ), Class::Success);
        assert_eq!(Method::from_type(typ).unwrap(), Method::Allocate);

        // Data indication
        let typ = message_type(Class::Indication, Method::Data);
        assert_eq!(typ, 0x0017);
        assert_eq!(Class::from_type(typ), Class::Indication);

        assert!(Method::from_type(0x0002).is_err());
    }
}
