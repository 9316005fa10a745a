use crate::parse::{IResult, not_whitespace, ws};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::take_while1;
use nom::combinator::map;
use nom::error::context;
use nom::multi::many0;
use nom::sequence::tuple;
use std::fmt;

/// Media grouping (`a=group`)
///
/// [RFC5888](https://datatracker.ietf.org/doc/html/rfc5888#section-5)
#[derive(Debug, Clone)]
pub struct Group {
    pub typ: BytesStr,
    pub mids: Vec<BytesStr>,
}

impl Group {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        context(
            "parsing group",
            map(
                tuple((
                    take_while1(not_whitespace),
                    many0(ws(take_while1(not_whitespace))),
                )),
                |(typ, mids)| Self {
                    typ: BytesStr::from_parse(src, typ),
                    mids: mids
                        .into_iter()
                        .map(|mid| BytesStr::from_parse(src, mid))
                        .collect(),
                },
            ),
        )(i)
    }

    pub fn is_bundle(&self) -> bool {
        self.typ.eq_ignore_ascii_case("BUNDLE")
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.typ)?;

        for mid in &self.mids {
            write!(f, " {mid}")?;
        }

        Ok(())
    }
}
