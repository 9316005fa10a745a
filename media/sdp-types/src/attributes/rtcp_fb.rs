use crate::parse::{IResult, ws};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::branch::alt;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, u8};
use nom::combinator::map;
use nom::error::context;
use nom::sequence::tuple;
use std::fmt;

/// RTCP Feedback attribute (`a=rtcp-fb`).
///
/// Media Level attribute
///
/// [RFC 4585](https://datatracker.ietf.org/doc/html/rfc4585#section-4.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpFeedback {
    pub pt: RtcpFeedbackPt,
    /// Feedback type and optional parameter, e.g. `nack pli` or `goog-remb`
    pub kind: BytesStr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpFeedbackPt {
    /// Feedback type applies to the given payload type
    Pt(u8),
    /// Wildcard '*', applies to all payload types
    Any,
}

impl RtcpFeedbackPt {
    pub fn matches(&self, pt: u8) -> bool {
        match self {
            RtcpFeedbackPt::Pt(v) => *v == pt,
            RtcpFeedbackPt::Any => true,
        }
    }
}

impl RtcpFeedback {
    pub fn new(pt: u8, kind: &'static str) -> Self {
        Self {
            pt: RtcpFeedbackPt::Pt(pt),
            kind: BytesStr::from_static(kind),
        }
    }

    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        context(
            "parsing rtcp-fb",
            map(
                tuple((
                    alt((
                        map(u8, RtcpFeedbackPt::Pt),
                        map(char('*'), |_| RtcpFeedbackPt::Any),
                    )),
                    ws(take_while1(|c: char| c != '\r' && c != '\n')),
                )),
                |(pt, kind)| Self {
                    pt,
                    kind: BytesStr::from_parse(src, kind.trim_end()),
                },
            ),
        )(i)
    }
}

impl fmt::Display for RtcpFeedbackPt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtcpFeedbackPt::Pt(pt) => write!(f, "{pt}"),
            RtcpFeedbackPt::Any => f.write_str("*"),
        }
    }
}

impl fmt::Display for RtcpFeedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.pt, self.kind)
    }
}
