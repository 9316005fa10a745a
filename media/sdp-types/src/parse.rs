//! nom helpers shared by all field & attribute parsers

use nom::character::complete::space0;
use nom::error::{VerboseError, VerboseErrorKind};

pub(crate) type IResult<I, O> = nom::IResult<I, O, VerboseError<I>>;

/// Skip leading whitespace, then run `f`
pub(crate) fn ws<'i, O, F>(mut f: F) -> impl FnMut(&'i str) -> IResult<&'i str, O>
where
    F: FnMut(&'i str) -> IResult<&'i str, O>,
{
    move |i| {
        let (i, _) = space0(i)?;
        f(i)
    }
}

/// Outermost context attached to a parser error
pub(crate) fn error_context(e: &VerboseError<&str>) -> &'static str {
    e.errors
        .iter()
        .rev()
        .find_map(|(_, kind)| match kind {
            VerboseErrorKind::Context(ctx) => Some(*ctx),
            _ => None,
        })
        .unwrap_or("invalid syntax")
}

pub(crate) fn not_whitespace(c: char) -> bool {
    !c.is_ascii_whitespace()
}

pub(crate) fn ice_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '/')
}

pub(crate) fn probe_host(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

pub(crate) fn probe_host6(c: char) -> bool {
    probe_host(c) || c == ':'
}

#[cfg(test)]
mod test {
    use super::*;
    use nom::bytes::complete::take_while1;
    use nom::error::context;
    use nom::sequence::tuple;
    use nom::Finish;

    #[test]
    fn whitespace_between_tokens() {
        let (rem, (a, b)) = tuple((
            ws(take_while1(not_whitespace)),
            ws(take_while1(not_whitespace)),
        ))("  first   second")
        .unwrap();

        assert_eq!(a, "first");
        assert_eq!(b, "second");
        assert!(rem.is_empty());
    }

    #[test]
    fn context_is_reported() {
        let err = context("parsing digits", nom::character::complete::digit1)("abc")
            .finish()
            .unwrap_err();

        assert_eq!(error_context(&err), "parsing digits");
    }
}
