use crate::parse::{IResult, probe_host, probe_host6};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::space1;
use nom::combinator::map;
use nom::error::context;
use nom::sequence::{preceded, tuple};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address with its network & address type (`IN IP4 ...`, `IN IP6 ...`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaggedAddress {
    IP4(Ipv4Addr),
    IP4FQDN(BytesStr),

    IP6(Ipv6Addr),
    IP6FQDN(BytesStr),
}

impl From<IpAddr> for TaggedAddress {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(ip) => Self::IP4(ip),
            IpAddr::V6(ip) => Self::IP6(ip),
        }
    }
}

impl TaggedAddress {
    /// Returns the address if it is not a hostname
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            TaggedAddress::IP4(ip) => Some(IpAddr::V4(*ip)),
            TaggedAddress::IP6(ip) => Some(IpAddr::V6(*ip)),
            TaggedAddress::IP4FQDN(_) | TaggedAddress::IP6FQDN(_) => None,
        }
    }

    pub fn parse(src: &Bytes) -> impl FnMut(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            context(
                "parsing tagged address",
                alt((
                    preceded(
                        tuple((tag("IN"), space1, tag("IP4"), space1)),
                        map(take_while1(probe_host), |host: &str| match host.parse() {
                            Ok(ip) => TaggedAddress::IP4(ip),
                            Err(_) => TaggedAddress::IP4FQDN(BytesStr::from_parse(src, host)),
                        }),
                    ),
                    preceded(
                        tuple((tag("IN"), space1, tag("IP6"), space1)),
                        map(take_while1(probe_host6), |host: &str| match host.parse() {
                            Ok(ip) => TaggedAddress::IP6(ip),
                            Err(_) => TaggedAddress::IP6FQDN(BytesStr::from_parse(src, host)),
                        }),
                    ),
                )),
            )(i)
        }
    }
}

impl fmt::Display for TaggedAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TaggedAddress::IP4(addr) => write!(f, "IN IP4 {addr}"),
            TaggedAddress::IP4FQDN(fqdn) => write!(f, "IN IP4 {fqdn}"),
            TaggedAddress::IP6(addr) => write!(f, "IN IP6 {addr}"),
            TaggedAddress::IP6FQDN(fqdn) => write!(f, "IN IP6 {fqdn}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_ip4() {
        let input = BytesStr::from_static("IN IP4 192.168.123.222");

        let (rem, addr) = TaggedAddress::parse(input.as_ref())(&input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(addr, TaggedAddress::IP4(Ipv4Addr::new(192, 168, 123, 222)));
        assert_eq!(addr.to_string(), "IN IP4 192.168.123.222");
    }

    #[test]
    fn address_ip6() {
        let input = BytesStr::from_static("IN IP6 ::1");

        let (rem, addr) = TaggedAddress::parse(input.as_ref())(&input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(addr.ip(), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn address_host() {
        let input = BytesStr::from_static("IN IP4 example.com");

        let (rem, addr) = TaggedAddress::parse(input.as_ref())(&input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(addr, TaggedAddress::IP4FQDN("example.com".into()));
        assert_eq!(addr.ip(), None);
    }
}
