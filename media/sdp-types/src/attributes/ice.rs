//! Some ICE related SDP attributes (`a=ice-options:...`, `a=ice-ufrag:...`, `a=ice-pwd:...`)

use crate::parse::{IResult, ice_char, not_whitespace, ws};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::{take_while_m_n, take_while1};
use nom::combinator::map;
use nom::error::context;
use nom::multi::many1;
use std::fmt;

/// Ice options attribute (`a=ice-options`)
///
/// [RFC8839](https://datatracker.ietf.org/doc/html/rfc8839#section-5.6)
#[derive(Default, Debug, Clone)]
pub struct IceOptions {
    /// Non empty list of options
    pub options: Vec<BytesStr>,
}

impl IceOptions {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        context(
            "parsing ice-options",
            map(
                many1(map(ws(take_while1(not_whitespace)), |option| {
                    BytesStr::from_parse(src, option)
                })),
                |options| Self { options },
            ),
        )(i)
    }

    pub fn contains(&self, option: &str) -> bool {
        self.options.iter().any(|o| o.as_str() == option)
    }
}

impl fmt::Display for IceOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut iter = self.options.iter();

        if let Some(first) = iter.next() {
            write!(f, "{first}")?;

            for option in iter {
                write!(f, " {option}")?;
            }
        }

        Ok(())
    }
}

/// Ice username fragment attribute (`a=ice-ufrag`)
///
/// Session and Media Level attribute. The media level value takes precedence.
#[derive(Debug, Clone)]
pub struct IceUsernameFragment {
    /// The username fragment, between 4 and 256 characters
    pub ufrag: BytesStr,
}

impl IceUsernameFragment {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        context(
            "parsing ice-ufrag",
            map(take_while_m_n(4, 256, ice_char), |ufrag| Self {
                ufrag: BytesStr::from_parse(src, ufrag),
            }),
        )(i)
    }
}

/// Ice password attribute (`a=ice-pwd`)
///
/// Session and Media Level attribute. The media level value takes precedence.
#[derive(Debug, Clone)]
pub struct IcePassword {
    /// The password, between 22 and 256 characters
    pub pwd: BytesStr,
}

impl IcePassword {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        context(
            "parsing ice-pwd",
            map(take_while_m_n(22, 256, ice_char), |pwd| Self {
                pwd: BytesStr::from_parse(src, pwd),
            }),
        )(i)
    }
}
