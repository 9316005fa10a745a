use super::Attribute;
use crate::builder::MessageBuilder;
use crate::parse::{AttrSpan, Message};
use crate::{COOKIE, Error, NE};
use byteorder::ReadBytesExt;
use bytes::BufMut;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

const XOR16: u16 = (COOKIE >> 16) as u16;

/// XOR keys applied to port, IPv4 and IPv6 address
#[derive(Clone, Copy)]
struct XorKey {
    port: u16,
    v4: u32,
    v6: u128,
}

impl XorKey {
    const NONE: XorKey = XorKey {
        port: 0,
        v4: 0,
        v6: 0,
    };

    fn with_id(id: u128) -> Self {
        XorKey {
            port: XOR16,
            v4: COOKIE,
            v6: id,
        }
    }
}

fn decode_addr(mut buf: &[u8], key: XorKey) -> Result<SocketAddr, Error> {
    if buf.read_u8()? != 0 {
        return Err(Error::InvalidData("first byte must be zero"));
    }

    let family = buf.read_u8()?;
    let port = buf.read_u16::<NE>()? ^ key.port;

    match family {
        1 => {
            let ip = buf.read_u32::<NE>()? ^ key.v4;
            Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
        }
        2 => {
            let ip = buf.read_u128::<NE>()? ^ key.v6;
            Ok(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(ip), port, 0, 0)))
        }
        _ => Err(Error::InvalidData("invalid address family")),
    }
}

fn encode_addr(addr: SocketAddr, buf: &mut Vec<u8>, key: XorKey) {
    buf.put_u8(0);

    match addr {
        SocketAddr::V4(addr) => {
            buf.put_u8(1);
            buf.put_u16(addr.port() ^ key.port);
            buf.put_u32(u32::from(*addr.ip()) ^ key.v4);
        }
        SocketAddr::V6(addr) => {
            buf.put_u8(2);
            buf.put_u16(addr.port() ^ key.port);
            buf.put_u128(u128::from(*addr.ip()) ^ key.v6);
        }
    }
}

fn addr_len(addr: &SocketAddr) -> u16 {
    match addr {
        SocketAddr::V4(_) => 8,
        SocketAddr::V6(_) => 20,
    }
}

/// Declares an address attribute, either plain or XOR'ed with the magic cookie & transaction id
macro_rules! address_attribute {
    ($(#[$meta:meta])* $name:ident, $typ:expr, xor) => {
        address_attribute!(@impl $(#[$meta])* $name, $typ, |id| XorKey::with_id(id));
    };
    ($(#[$meta:meta])* $name:ident, $typ:expr, plain) => {
        address_attribute!(@impl $(#[$meta])* $name, $typ, |_id| XorKey::NONE);
    };
    (@impl $(#[$meta:meta])* $name:ident, $typ:expr, $key:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub SocketAddr);

        impl Attribute<'_> for $name {
            type Context = ();
            const TYPE: u16 = $typ;

            fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
                let key: fn(u128) -> XorKey = $key;
                let key = key(msg.id());
                decode_addr(attr.get_value(msg.buffer()), key).map(Self)
            }

            fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
                let key: fn(u128) -> XorKey = $key;
                let key = key(builder.id());
                encode_addr(self.0, builder.buffer(), key);
            }

            fn encode_len(&self) -> Result<u16, Error> {
                Ok(addr_len(&self.0))
            }
        }
    };
}

address_attribute!(
    /// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.1)
    MappedAddress, 0x0001, plain
);

address_attribute!(
    /// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.2)
    XorMappedAddress, 0x0020, xor
);

address_attribute!(
    /// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.15)
    AlternateServer, 0x8023, plain
);

address_attribute!(
    /// Address of the peer as seen from the TURN server
    ///
    /// [RFC8656](https://datatracker.ietf.org/doc/html/rfc8656#section-18.3)
    XorPeerAddress, 0x0012, xor
);

address_attribute!(
    /// Address allocated by the TURN server on behalf of the client
    ///
    /// [RFC8656](https://datatracker.ietf.org/doc/html/rfc8656#section-18.5)
    XorRelayedAddress, 0x0016, xor
);

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Class, Method, TransactionId};

    #[test]
    fn xor_addresses() {
        let v4: SocketAddr = "192.0.2.1:32853".parse().unwrap();
        let v6: SocketAddr = "[2001:db8:1234:5678:11:2233:4455:6677]:32853"
            .parse()
            .unwrap();

        let mut builder =
            MessageBuilder::new(Class::Success, Method::Allocate, TransactionId::random());
        builder.add_attr(XorRelayedAddress(v6));
        builder.add_attr(XorMappedAddress(v4));
        let bytes = builder.finish();

        // XOR'ed port and ip must not appear in plain text
        assert!(!bytes.windows(4).any(|w| w == [192, 0, 2, 1]));

        let mut msg = Message::parse(bytes).unwrap();
        assert_eq!(msg.attribute::<XorMappedAddress>().unwrap().unwrap().0, v4);
        assert_eq!(msg.attribute::<XorRelayedAddress>().unwrap().unwrap().0, v6);
        assert!(msg.attribute::<XorPeerAddress>().is_none());
    }
}
