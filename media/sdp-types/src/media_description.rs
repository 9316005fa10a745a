use crate::connection::Connection;
use crate::media::Media;
use crate::{
    Bandwidth, Direction, Fingerprint, Fmtp, IceCandidate, IcePassword, IceUsernameFragment,
    MediaType, Rtcp, RtcpFeedback, RtpMap, Setup, SourceAttribute, Ssrc, TransportProtocol,
    UnknownAttribute,
};
use bytesstr::BytesStr;
use std::fmt;

/// Part of the [`SessionDescription`](crate::SessionDescription) describes a single media session
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-5.14)
#[derive(Debug, Clone)]
pub struct MediaDescription {
    /// Media description's media field (m=)
    pub media: Media,

    /// Optional connection (c field)
    pub connection: Option<Connection>,

    /// Optional bandwidths (b fields)
    pub bandwidth: Vec<Bandwidth>,

    /// Media direction attribute
    pub direction: Direction,

    /// rtcp attribute
    pub rtcp: Option<Rtcp>,

    /// rtcp-mux attribute
    pub rtcp_mux: bool,

    /// Media ID (a=mid)
    pub mid: Option<BytesStr>,

    /// RTP Payload mappings
    pub rtpmap: Vec<RtpMap>,

    /// RTP encoding parameters
    pub fmtp: Vec<Fmtp>,

    /// RTCP feedback (a=rtcp-fb)
    pub rtcp_fb: Vec<RtcpFeedback>,

    /// ICE username fragment
    pub ice_ufrag: Option<IceUsernameFragment>,

    /// ICE password
    pub ice_pwd: Option<IcePassword>,

    /// ICE candidates
    pub ice_candidates: Vec<IceCandidate>,

    /// ICE a=end-of-candidates attribute
    pub ice_end_of_candidates: bool,

    /// SSRC attribute (a=ssrc)
    pub ssrc: Vec<Ssrc>,

    /// Setup attribute (a=setup)
    pub setup: Option<Setup>,

    /// Fingerprint attribute (a=fingerprint)
    pub fingerprint: Vec<Fingerprint>,

    /// SCTP port of a data channel media (a=sctp-port)
    pub sctp_port: Option<u16>,

    /// Additional attributes
    pub attributes: Vec<UnknownAttribute>,
}

impl MediaDescription {
    /// Media description without any attributes
    pub fn new(media: Media) -> Self {
        MediaDescription {
            media,
            connection: None,
            bandwidth: vec![],
            direction: Direction::default(),
            rtcp: None,
            rtcp_mux: false,
            mid: None,
            rtpmap: vec![],
            fmtp: vec![],
            rtcp_fb: vec![],
            ice_ufrag: None,
            ice_pwd: None,
            ice_candidates: vec![],
            ice_end_of_candidates: false,
            ssrc: vec![],
            setup: None,
            fingerprint: vec![],
            sctp_port: None,
            attributes: vec![],
        }
    }

    /// Create media description which signals rejected media
    pub fn rejected(media_type: MediaType, proto: TransportProtocol, mid: Option<BytesStr>) -> Self {
        let mut desc = Self::new(Media {
            media_type,
            port: 0,
            ports_num: None,
            proto,
            fmts: vec![],
        });

        desc.direction = Direction::Inactive;
        desc.mid = mid;
        desc
    }

    pub fn is_rejected(&self) -> bool {
        self.media.port == 0
    }

    /// SSRC of the first `a=ssrc` line
    pub fn first_ssrc(&self) -> Option<u32> {
        self.ssrc.first().map(|ssrc| ssrc.ssrc)
    }

    /// CNAME announced for the given SSRC
    pub fn cname(&self, ssrc: u32) -> Option<&BytesStr> {
        self.ssrc
            .iter()
            .filter(|s| s.ssrc == ssrc)
            .find_map(|s| match &s.attribute {
                SourceAttribute::CName { cname } => Some(cname),
                _ => None,
            })
    }
}

impl fmt::Display for MediaDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "m={}\r\n", self.media)?;

        if let Some(conn) = &self.connection {
            write!(f, "c={conn}\r\n")?;
        }

        for bw in &self.bandwidth {
            write!(f, "b={bw}\r\n")?;
        }

        if let Some(rtcp) = &self.rtcp {
            write!(f, "a=rtcp:{rtcp}\r\n")?;
        }

        if self.rtcp_mux {
            f.write_str("a=rtcp-mux\r\n")?;
        }

        write!(f, "a={}\r\n", self.direction)?;

        if let Some(mid) = &self.mid {
            write!(f, "a=mid:{mid}\r\n")?;
        }

        for rtpmap in &self.rtpmap {
            write!(f, "a=rtpmap:{rtpmap}\r\n")?;
        }

        for fmtp in &self.fmtp {
            write!(f, "a=fmtp:{fmtp}\r\n")?;
        }

        for rtcp_fb in &self.rtcp_fb {
            write!(f, "a=rtcp-fb:{rtcp_fb}\r\n")?;
        }

        if let Some(ufrag) = &self.ice_ufrag {
            write!(f, "a=ice-ufrag:{}\r\n", ufrag.ufrag)?;
        }

        if let Some(pwd) = &self.ice_pwd {
            write!(f, "a=ice-pwd:{}\r\n", pwd.pwd)?;
        }

        for candidate in &self.ice_candidates {
            write!(f, "a=candidate:{candidate}\r\n")?;
        }

        if self.ice_end_of_candidates {
            f.write_str("a=end-of-candidates\r\n")?;
        }

        for ssrc in &self.ssrc {
            write!(f, "a=ssrc:{ssrc}\r\n")?;
        }

        if let Some(setup) = self.setup {
            write!(f, "a=setup:{setup}\r\n")?;
        }

        for fingerprint in &self.fingerprint {
            write!(f, "a=fingerprint:{fingerprint}\r\n")?;
        }

        if let Some(sctp_port) = self.sctp_port {
            write!(f, "a=sctp-port:{sctp_port}\r\n")?;
        }

        for attr in &self.attributes {
            write!(f, "a={attr}\r\n")?;
        }

        Ok(())
    }
}
