//! RTCP Attribute (`a=rtcp:...`)

use crate::TaggedAddress;
use crate::parse::{IResult, ws};
use bytes::Bytes;
use nom::character::complete::u16;
use nom::combinator::{map, opt};
use nom::error::context;
use nom::sequence::tuple;
use std::fmt;

/// Rtcp attribute (`a=rtcp`)
///
/// Specify an alternative address/port for RTCP. Irrelevant when `a=rtcp-mux` is used.
///
/// [RFC3605](https://datatracker.ietf.org/doc/html/rfc3605)
#[derive(Debug, Clone)]
pub struct Rtcp {
    /// Port to be used for RTCP
    pub port: u16,

    /// Optional address
    pub address: Option<TaggedAddress>,
}

impl Rtcp {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        context(
            "parsing rtcp attribute",
            map(
                tuple((u16, opt(ws(TaggedAddress::parse(src))))),
                |(port, address)| Rtcp { port, address },
            ),
        )(i)
    }
}

impl fmt::Display for Rtcp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.port)?;

        if let Some(address) = &self.address {
            write!(f, " {address}")?;
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
    fn rtcp_address() {
        let input = BytesStr::from_static("9 IN IP4 0.0.0.0");

        let (rem, rtcp) = Rtcp::parse(input.as_ref(), &input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(rtcp.port, 9);
        assert_eq!(rtcp.address, Some(TaggedAddress::IP4(Ipv4Addr::UNSPECIFIED)));
    }
}
