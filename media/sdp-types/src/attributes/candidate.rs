//! ICE Candidate (`a=candidate:...`)

use crate::parse::{IResult, ice_char, not_whitespace, probe_host6, ws};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::{tag, take_while1, take_while_m_n};
use nom::character::complete::{u16, u32, u64};
use nom::combinator::{map, map_res};
use nom::error::context;
use nom::multi::many0;
use nom::sequence::{preceded, tuple};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
#[error("invalid candidate extension parameter")]
pub struct InvalidCandidateParamError;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UntaggedAddress {
    Fqdn(BytesStr),
    IpAddress(IpAddr),
}

impl UntaggedAddress {
    fn from_parse(src: &Bytes, address: &str) -> Self {
        match IpAddr::from_str(address) {
            Ok(address) => UntaggedAddress::IpAddress(address),
            Err(_) => UntaggedAddress::Fqdn(BytesStr::from_parse(src, address)),
        }
    }
}

impl fmt::Display for UntaggedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            UntaggedAddress::Fqdn(str) => str.fmt(f),
            UntaggedAddress::IpAddress(addr) => addr.fmt(f),
        }
    }
}

/// SDP ICE Candidate, the value of an `a=candidate` attribute
///
/// [RFC8839](https://datatracker.ietf.org/doc/html/rfc8839#section-5.1)
#[derive(Debug, Clone)]
pub struct IceCandidate {
    /// Session unique ID assigned to the candidate
    pub foundation: BytesStr,

    /// Identifies the specific component of the media stream for which this is a candidate.
    ///
    /// e.g. RTP is 1 and RTCP is 2
    pub component: u32,

    /// Transport protocol used by the candidate, usually UDP or TCP
    pub transport: BytesStr,

    /// Candidate priority
    pub priority: u64,

    /// Address of the candidate
    pub address: UntaggedAddress,

    /// Port of the candidate
    pub port: u16,

    /// Candidate typ: `host`, `srflx`, `prflx`, `relay` or something entirely else
    pub typ: BytesStr,

    /// Related address, set for `srflx`, `prflx` and `relay`
    pub rel_addr: Option<UntaggedAddress>,

    /// Related port, set for `srflx`, `prflx` and `relay`
    pub rel_port: Option<u16>,

    /// Extension params that aren't known to this crate (e.g. `generation 0`)
    pub unknown: Vec<(BytesStr, BytesStr)>,
}

impl IceCandidate {
    /// Parse the attribute value (without the leading `candidate:`)
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        context(
            "parsing ice candidate",
            map_res(
                tuple((
                    // foundation
                    ws(take_while_m_n(1, 32, ice_char)),
                    // component id
                    ws(u32),
                    // transport
                    ws(take_while1(not_whitespace)),
                    // priority
                    ws(u64),
                    // address
                    ws(take_while1(probe_host6)),
                    // port
                    ws(u16),
                    // candidate type
                    preceded(ws(tag("typ")), ws(take_while1(not_whitespace))),
                    // extensions
                    many0(tuple((
                        ws(take_while1(not_whitespace)),
                        ws(take_while1(not_whitespace)),
                    ))),
                )),
                |(foundation, component, transport, priority, address, port, typ, extensions)| {
                    let mut rel_addr = None;
                    let mut rel_port = None;
                    let mut unknown = vec![];

                    for (key, value) in extensions {
                        match key {
                            "raddr" => rel_addr = Some(UntaggedAddress::from_parse(src, value)),
                            "rport" => {
                                rel_port =
                                    Some(value.parse().map_err(|_| InvalidCandidateParamError)?)
                            }
                            _ => unknown.push((
                                BytesStr::from_parse(src, key),
                                BytesStr::from_parse(src, value),
                            )),
                        }
                    }

                    Ok::<_, InvalidCandidateParamError>(IceCandidate {
                        foundation: BytesStr::from_parse(src, foundation),
                        component,
                        transport: BytesStr::from_parse(src, transport),
                        priority,
                        address: UntaggedAddress::from_parse(src, address),
                        port,
                        typ: BytesStr::from_parse(src, typ),
                        rel_addr,
                        rel_port,
                        unknown,
                    })
                },
            ),
        )(i)
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.typ
        )?;

        if let Some(rel_addr) = &self.rel_addr {
            write!(f, " raddr {rel_addr}")?;
        }

        if let Some(rel_port) = &self.rel_port {
            write!(f, " rport {rel_port}")?;
        }

        for (key, value) in &self.unknown {
            write!(f, " {key} {value}")?;
        }

        Ok(())
    }
}
