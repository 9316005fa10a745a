//! RtpMap attribute (`a=rtpmap:...`)

use crate::parse::{IResult, ws};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{u8, u32};
use nom::combinator::{map, opt, rest};
use nom::error::context;
use nom::sequence::{preceded, terminated, tuple};
use std::fmt;

/// Rtpmap attribute (`a=rtpmap`)
///
/// Map a RTP payload number specified in the media description to a encoding.
///
/// Media-Level attribute
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-6.6)
#[derive(Debug, Clone)]
pub struct RtpMap {
    /// The number used in the media description which this maps a description to
    pub payload: u8,

    /// Name of the encoding
    pub encoding: BytesStr,

    /// Clock rate of the encoding
    pub clock_rate: u32,

    /// Additional parameters as a string (channel count for audio)
    pub params: Option<BytesStr>,
}

impl RtpMap {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        context(
            "parsing rtpmap",
            map(
                tuple((
                    // payload num
                    u8,
                    // encoding
                    ws(terminated(take_while1(|c| c != '/'), tag("/"))),
                    // clock rate
                    u32,
                    // optional params
                    opt(preceded(tag("/"), rest)),
                )),
                |(payload, encoding, clock_rate, params): (_, &str, _, Option<&str>)| RtpMap {
                    payload,
                    encoding: BytesStr::from_parse(src, encoding.trim()),
                    clock_rate,
                    params: params.map(|params| BytesStr::from_parse(src, params)),
                },
            ),
        )(i)
    }

    /// Returns if both describe the same codec, the payload number is not compared
    pub fn same_codec(&self, other: &RtpMap) -> bool {
        self.encoding.eq_ignore_ascii_case(&other.encoding) && self.clock_rate == other.clock_rate
    }
}

impl fmt::Display for RtpMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}/{}", self.payload, self.encoding, self.clock_rate)?;

        if let Some(params) = &self.params {
            write!(f, "/{params}")?;
        }

        Ok(())
    }
}
