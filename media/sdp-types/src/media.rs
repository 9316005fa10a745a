use crate::parse::{IResult, not_whitespace, ws};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, u16, u32};
use nom::combinator::{map, opt};
use nom::error::context;
use nom::multi::many0;
use nom::sequence::{preceded, tuple};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
    Text,
    App,
    Other(BytesStr),
}

impl MediaType {
    fn from_token(src: &Bytes, token: &str) -> Self {
        match token {
            "audio" => MediaType::Audio,
            "video" => MediaType::Video,
            "text" => MediaType::Text,
            "application" => MediaType::App,
            _ => MediaType::Other(BytesStr::from_parse(src, token)),
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MediaType::Audio => f.write_str("audio"),
            MediaType::Video => f.write_str("video"),
            MediaType::Text => f.write_str("text"),
            MediaType::App => f.write_str("application"),
            MediaType::Other(other) => f.write_str(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportProtocol {
    /// RTP over UDP
    RtpAvp,

    /// SRTP over UDP
    RtpSavp,

    /// SRTP with [RFC5124](https://www.rfc-editor.org/rfc/rfc5124.html), used by legacy WebRTC offers
    RtpSavpf,

    /// DTLS-SRTP
    UdpTlsRtpSavp,

    /// DTLS-SRTP with [RFC5124](https://www.rfc-editor.org/rfc/rfc5124.html)
    UdpTlsRtpSavpf,

    /// Data channel, legacy form (`DTLS/SCTP <port>`)
    DtlsSctp,

    /// Data channel ([RFC8841](https://www.rfc-editor.org/rfc/rfc8841.html))
    UdpDtlsSctp,

    /// Other unknown
    Other(BytesStr),
}

impl TransportProtocol {
    fn from_token(src: &Bytes, token: &str) -> Self {
        match token {
            "RTP/AVP" => TransportProtocol::RtpAvp,
            "RTP/SAVP" => TransportProtocol::RtpSavp,
            "RTP/SAVPF" => TransportProtocol::RtpSavpf,
            "UDP/TLS/RTP/SAVP" => TransportProtocol::UdpTlsRtpSavp,
            "UDP/TLS/RTP/SAVPF" => TransportProtocol::UdpTlsRtpSavpf,
            "DTLS/SCTP" => TransportProtocol::DtlsSctp,
            "UDP/DTLS/SCTP" => TransportProtocol::UdpDtlsSctp,
            _ => TransportProtocol::Other(BytesStr::from_parse(src, token)),
        }
    }

    /// Returns if the protocol carries SRTP keyed by DTLS (or its legacy RTP/SAVPF spelling used by browsers)
    pub fn is_secure_rtp(&self) -> bool {
        matches!(
            self,
            TransportProtocol::RtpSavpf
                | TransportProtocol::UdpTlsRtpSavp
                | TransportProtocol::UdpTlsRtpSavpf
        )
    }

    pub fn is_data_channel(&self) -> bool {
        matches!(
            self,
            TransportProtocol::DtlsSctp | TransportProtocol::UdpDtlsSctp
        )
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportProtocol::RtpAvp => f.write_str("RTP/AVP"),
            TransportProtocol::RtpSavp => f.write_str("RTP/SAVP"),
            TransportProtocol::RtpSavpf => f.write_str("RTP/SAVPF"),
            TransportProtocol::UdpTlsRtpSavp => f.write_str("UDP/TLS/RTP/SAVP"),
            TransportProtocol::UdpTlsRtpSavpf => f.write_str("UDP/TLS/RTP/SAVPF"),
            TransportProtocol::DtlsSctp => f.write_str("DTLS/SCTP"),
            TransportProtocol::UdpDtlsSctp => f.write_str("UDP/DTLS/SCTP"),
            TransportProtocol::Other(str) => f.write_str(str),
        }
    }
}

/// Media field (`m=`)
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-5.14)
#[derive(Debug, Clone)]
pub struct Media {
    pub media_type: MediaType,
    pub port: u16,
    pub ports_num: Option<u32>,
    pub proto: TransportProtocol,
    /// Media formats, RTP payload types for RTP profiles
    pub fmts: Vec<BytesStr>,
}

impl Media {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        context(
            "parsing media field",
            map(
                tuple((
                    ws(take_while1(not_whitespace)),
                    ws(u16),
                    opt(preceded(char('/'), u32)),
                    ws(take_while1(not_whitespace)),
                    many0(ws(take_while1(not_whitespace))),
                )),
                |(media_type, port, ports_num, proto, fmts)| Media {
                    media_type: MediaType::from_token(src, media_type),
                    port,
                    ports_num,
                    proto: TransportProtocol::from_token(src, proto),
                    fmts: fmts
                        .into_iter()
                        .map(|fmt| BytesStr::from_parse(src, fmt))
                        .collect(),
                },
            ),
        )(i)
    }

    /// Formats which are valid RTP payload types
    pub fn payload_types(&self) -> impl Iterator<Item = u8> + '_ {
        self.fmts.iter().filter_map(|fmt| fmt.parse().ok())
    }
}

impl fmt::Display for Media {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.media_type)?;

        if let Some(ports_num) = &self.ports_num {
            write!(f, " {}/{} ", self.port, ports_num)?;
        } else {
            write!(f, " {} ", self.port)?;
        }

        write!(f, "{}", self.proto)?;

        for fmt in &self.fmts {
            write!(f, " {fmt}")?;
        }

        Ok(())
    }
}
