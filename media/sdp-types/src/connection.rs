use crate::TaggedAddress;
use crate::parse::IResult;
use bytes::Bytes;
use nom::character::complete::{char, u32};
use nom::combinator::opt;
use nom::sequence::preceded;
use std::fmt;

/// Connection field (`c=`)
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-5.7)
#[derive(Debug, Clone)]
pub struct Connection {
    /// The connection address
    pub address: TaggedAddress,

    /// Must be set for IPv4 multicast sessions
    pub ttl: Option<u32>,

    /// Number of addresses
    pub num: Option<u32>,
}

impl Connection {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        let (i, address) = TaggedAddress::parse(src)(i)?;

        let (i, (ttl, num)) = match &address {
            TaggedAddress::IP4(_) | TaggedAddress::IP4FQDN(_) => {
                let (i, ttl) = opt(preceded(char('/'), u32))(i)?;
                let (i, num) = if ttl.is_some() {
                    opt(preceded(char('/'), u32))(i)?
                } else {
                    (i, None)
                };

                (i, (ttl, num))
            }
            TaggedAddress::IP6(_) | TaggedAddress::IP6FQDN(_) => {
                let (i, num) = opt(preceded(char('/'), u32))(i)?;
                (i, (None, num))
            }
        };

        Ok((i, Connection { address, ttl, num }))
    }
}

impl From<std::net::IpAddr> for Connection {
    fn from(ip: std::net::IpAddr) -> Self {
        Connection {
            address: ip.into(),
            ttl: None,
            num: None,
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.address)?;

        match (&self.address, self.ttl, self.num) {
            (TaggedAddress::IP4(_) | TaggedAddress::IP4FQDN(_), Some(ttl), num) => {
                write!(f, "/{ttl}")?;

                if let Some(num) = num {
                    write!(f, "/{num}")?;
                }
            }
            (TaggedAddress::IP6(_) | TaggedAddress::IP6FQDN(_), _, Some(num)) => {
                write!(f, "/{num}")?;
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytesstr::BytesStr;
    use std::net::Ipv4Addr;

    #[test]
    fn connection_ttl_num() {
        let input = BytesStr::from_static("IN IP4 224.2.1.1/127/3");

        let (rem, connection) = Connection::parse(input.as_ref(), &input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(connection.address, TaggedAddress::IP4(Ipv4Addr::new(224, 2, 1, 1)));
        assert_eq!(connection.ttl, Some(127));
        assert_eq!(connection.num, Some(3));
        assert_eq!(connection.to_string(), "IN IP4 224.2.1.1/127/3");
    }

    #[test]
    fn connection_print_num_without_ttl() {
        let connection = Connection {
            address: TaggedAddress::IP4(Ipv4Addr::new(192, 168, 0, 1)),
            ttl: None,
            num: Some(3),
        };

        assert_eq!(connection.to_string(), "IN IP4 192.168.0.1");
    }
}
