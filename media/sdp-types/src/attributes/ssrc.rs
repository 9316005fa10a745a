use crate::parse::{IResult, not_whitespace, ws};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::branch::alt;
use nom::bytes::complete::{is_not, tag, take_while1};
use nom::character::complete::{char, u8, u32};
use nom::combinator::{map, opt, rest};
use nom::error::context;
use nom::sequence::{preceded, tuple};
use std::fmt;

/// Source specific attribute (`a=ssrc`)
///
/// [RFC5576](https://datatracker.ietf.org/doc/html/rfc5576#section-4.1)
#[derive(Debug, Clone)]
pub struct Ssrc {
    pub ssrc: u32,
    pub attribute: SourceAttribute,
}

#[derive(Debug, Clone)]
pub enum SourceAttribute {
    CName {
        cname: BytesStr,
    },
    PreviousSsrc {
        ssrc: u32,
    },
    Fmtp {
        pt: u8,
        params: BytesStr,
    },
    Other {
        name: BytesStr,
        value: Option<BytesStr>,
    },
}

impl Ssrc {
    pub fn cname(ssrc: u32, cname: impl Into<BytesStr>) -> Self {
        Self {
            ssrc,
            attribute: SourceAttribute::CName {
                cname: cname.into(),
            },
        }
    }

    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        context(
            "parsing ssrc-attribute",
            map(
                tuple((
                    u32,
                    ws(alt((
                        map(preceded(tag("cname:"), take_while1(not_whitespace)), |cname| {
                            SourceAttribute::CName {
                                cname: BytesStr::from_parse(src, cname),
                            }
                        }),
                        map(preceded(tag("previous-ssrc:"), u32), |ssrc| {
                            SourceAttribute::PreviousSsrc { ssrc }
                        }),
                        map(
                            tuple((preceded(tag("fmtp:"), u8), ws(take_while1(not_whitespace)))),
                            |(pt, params)| SourceAttribute::Fmtp {
                                pt,
                                params: BytesStr::from_parse(src, params),
                            },
                        ),
                        map(
                            tuple((is_not(":"), opt(preceded(char(':'), rest)))),
                            |(name, value): (&str, Option<&str>)| SourceAttribute::Other {
                                name: BytesStr::from_parse(src, name),
                                value: value.map(|value| BytesStr::from_parse(src, value)),
                            },
                        ),
                    ))),
                )),
                |(ssrc, attribute)| Self { ssrc, attribute },
            ),
        )(i)
    }
}

impl fmt::Display for Ssrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.ssrc)?;

        match &self.attribute {
            SourceAttribute::CName { cname } => write!(f, "cname:{cname}"),
            SourceAttribute::PreviousSsrc { ssrc } => write!(f, "previous-ssrc:{ssrc}"),
            SourceAttribute::Fmtp { pt, params } => write!(f, "fmtp:{pt} {params}"),
            SourceAttribute::Other {
                name,
                value: Some(value),
            } => write!(f, "{name}:{value}"),
            SourceAttribute::Other { name, value: None } => write!(f, "{name}"),
        }
    }
}
