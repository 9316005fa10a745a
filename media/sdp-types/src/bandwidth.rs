use crate::parse::IResult;
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::u32;
use nom::combinator::map;
use nom::error::context;
use nom::sequence::separated_pair;
use std::fmt;

/// Bandwidth field (`b=`)
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-5.8)
#[derive(Debug, Clone)]
pub struct Bandwidth {
    /// The type of bandwidth, usually `AS` (application specific)
    pub type_: BytesStr,

    /// The bandwidth in kilobits per second (for `AS`)
    pub bandwidth: u32,
}

impl Bandwidth {
    /// Application specific maximum (`b=AS:<kbps>`)
    pub fn application_specific(kbps: u32) -> Self {
        Self {
            type_: BytesStr::from_static("AS"),
            bandwidth: kbps,
        }
    }

    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        context(
            "parsing bandwidth",
            map(
                separated_pair(take_while1(token), tag(":"), u32),
                |(type_, bandwidth)| Bandwidth {
                    type_: BytesStr::from_parse(src, type_),
                    bandwidth,
                },
            ),
        )(i)
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.type_, self.bandwidth)
    }
}

fn token(c: char) -> bool {
    matches!(c, '\x21' | '\x23'..='\x27' | '\x2A'..='\x2B' | '\x2D'..='\x2E' | '\x30'..='\x39' | '\x41'..='\x5A' | '\x5E'..='\x7E')
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bandwidth() {
        let input = BytesStr::from_static("AS:800");

        let (rem, bandwidth) = Bandwidth::parse(input.as_ref(), &input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(bandwidth.type_, "AS");
        assert_eq!(bandwidth.bandwidth, 800);
        assert_eq!(bandwidth.to_string(), "AS:800");
    }
}
