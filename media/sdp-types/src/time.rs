use crate::parse::{IResult, ws};
use nom::character::complete::u64;
use nom::combinator::map;
use nom::error::context;
use nom::sequence::tuple;
use std::fmt;

/// Time field (`t=`)
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-5.9)
#[derive(Debug, Clone, Default)]
pub struct Time {
    /// Start of the session in NTP seconds, 0 for "now"
    pub start: u64,

    /// End of the session in NTP seconds, 0 for unbounded
    pub stop: u64,
}

impl Time {
    pub fn parse(i: &str) -> IResult<&str, Self> {
        context(
            "parsing time field",
            map(tuple((ws(u64), ws(u64))), |(start, stop)| Time { start, stop }),
        )(i)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.start, self.stop)
    }
}
