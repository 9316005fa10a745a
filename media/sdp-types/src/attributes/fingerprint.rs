use crate::parse::{IResult, not_whitespace};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::{take, take_while1};
use nom::character::complete::{char, space1};
use nom::combinator::{map, map_res};
use nom::error::context;
use nom::multi::separated_list1;
use nom::sequence::separated_pair;
use std::fmt;

/// Certificate fingerprint (`a=fingerprint`)
///
/// [RFC8122](https://datatracker.ietf.org/doc/html/rfc8122#section-5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub algorithm: FingerprintAlgorithm,
    pub fingerprint: Vec<u8>,
}

/// Hash function of a [`Fingerprint`], names are compared case insensitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintAlgorithm {
    SHA1,
    SHA224,
    SHA256,
    SHA384,
    SHA512,
    MD5,
    MD2,
    Other(BytesStr),
}

impl FingerprintAlgorithm {
    fn from_token(src: &Bytes, token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "sha-1" => FingerprintAlgorithm::SHA1,
            "sha-224" => FingerprintAlgorithm::SHA224,
            "sha-256" => FingerprintAlgorithm::SHA256,
            "sha-384" => FingerprintAlgorithm::SHA384,
            "sha-512" => FingerprintAlgorithm::SHA512,
            "md5" => FingerprintAlgorithm::MD5,
            "md2" => FingerprintAlgorithm::MD2,
            _ => FingerprintAlgorithm::Other(BytesStr::from_parse(src, token)),
        }
    }
}

impl Fingerprint {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        context(
            "parsing fingerprint-attribute",
            map(
                separated_pair(
                    take_while1(not_whitespace),
                    space1,
                    separated_list1(
                        char(':'),
                        map_res(take(2usize), |hex: &str| u8::from_str_radix(hex, 16)),
                    ),
                ),
                |(algorithm, fingerprint)| Self {
                    algorithm: FingerprintAlgorithm::from_token(src, algorithm),
                    fingerprint,
                },
            ),
        )(i)
    }
}

// Hash names are written lowercase as registered in the IANA "Hash Function Textual Names" registry
impl fmt::Display for FingerprintAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FingerprintAlgorithm::SHA1 => "sha-1",
            FingerprintAlgorithm::SHA224 => "sha-224",
            FingerprintAlgorithm::SHA256 => "sha-256",
            FingerprintAlgorithm::SHA384 => "sha-384",
            FingerprintAlgorithm::SHA512 => "sha-512",
            FingerprintAlgorithm::MD5 => "md5",
            FingerprintAlgorithm::MD2 => "md2",
            FingerprintAlgorithm::Other(bytes_str) => bytes_str.as_str(),
        })
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.algorithm)?;

        let mut iter = self.fingerprint.iter();

        if let Some(b) = iter.next() {
            write!(f, "{b:02X}")?;

            for b in iter {
                write!(f, ":{b:02X}")?;
            }
        }

        Ok(())
    }
}
