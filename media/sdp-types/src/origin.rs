use crate::TaggedAddress;
use crate::parse::{IResult, not_whitespace, ws};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::take_while1;
use nom::combinator::map;
use nom::error::context;
use nom::sequence::tuple;
use std::fmt;

/// Origin field (`o=`)
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-5.2)
#[derive(Debug, Clone)]
pub struct Origin {
    /// Username of the origin
    pub username: BytesStr,

    /// Globally unique session identifier
    pub session_id: BytesStr,

    /// The version of the session, changes with each modification/renegotiation.
    pub session_version: BytesStr,

    /// The source address of the message
    pub address: TaggedAddress,
}

impl Origin {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        context(
            "parsing origin field",
            map(
                tuple((
                    ws(take_while1(not_whitespace)),
                    ws(take_while1(not_whitespace)),
                    ws(take_while1(not_whitespace)),
                    ws(TaggedAddress::parse(src)),
                )),
                |(username, session_id, session_version, address)| Origin {
                    username: BytesStr::from_parse(src, username),
                    session_id: BytesStr::from_parse(src, session_id),
                    session_version: BytesStr::from_parse(src, session_version),
                    address,
                },
            ),
        )(i)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.username, self.session_id, self.session_version, self.address
        )
    }
}
