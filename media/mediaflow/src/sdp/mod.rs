//! Offer/answer negotiation
//!
//! The functions in here render the local state of a flow into a [`SessionDescription`] and match a remote
//! description against it. They never mutate the flow, the [`Mediaflow`](crate::Mediaflow) applies the
//! returned [`RemoteDescription`].

use crate::{Codec, Error};
use bytesstr::BytesStr;
use ice::IceCredentials;
use sdp_types::{
    Bandwidth, Connection, Direction, Fingerprint, Fmtp, Group, IceCandidate, IceOptions,
    IcePassword, IceUsernameFragment, Media, MediaDescription, MediaType, Origin, RtcpFeedback,
    RtcpFeedbackPt, RtpMap, SessionDescription, Setup, Ssrc, Time, TransportProtocol,
};
use std::net::SocketAddr;

pub(crate) const AUDIO_MID: &str = "audio";
pub(crate) const VIDEO_MID: &str = "video";
pub(crate) const DATA_MID: &str = "data";

const SCTP_PORT: u16 = 5000;
const DATA_CHANNEL_FMT: &str = "webrtc-datachannel";

/// Port announced in the media lines if the flow is not bound to a specific port
const DISCARD_PORT: u16 = 9;

/// Local media of one kind as seen by the negotiator
pub(crate) struct LocalMedia<'a> {
    pub(crate) codecs: &'a [Codec],
    pub(crate) ssrc: u32,
    pub(crate) bandwidth: u32,
}

/// Borrowed view of the flow's local state
pub(crate) struct LocalDescription<'a> {
    pub(crate) session_id: u64,
    pub(crate) session_version: u64,
    pub(crate) address: SocketAddr,
    pub(crate) cname: &'a str,
    pub(crate) credentials: &'a IceCredentials,
    pub(crate) fingerprint: Fingerprint,
    /// Candidates visible to the peer, already filtered by the privacy policy
    pub(crate) candidates: Vec<IceCandidate>,
    pub(crate) end_of_candidates: bool,
    pub(crate) audio: LocalMedia<'a>,
    pub(crate) video: Option<LocalMedia<'a>>,
    pub(crate) data: bool,
}

/// A media line both sides agreed on
#[derive(Debug, Clone)]
pub(crate) struct NegotiatedMedia {
    /// Codecs in order of preference with the payload type used by the peer
    pub(crate) codecs: Vec<(u8, Codec)>,
    pub(crate) remote_ssrc: Option<u32>,
    /// Direction from the local point of view
    pub(crate) direction: Direction,
}

/// Everything learned from the peer's description
#[derive(Debug, Clone)]
pub(crate) struct RemoteDescription {
    pub(crate) credentials: IceCredentials,
    pub(crate) candidates: Vec<IceCandidate>,
    pub(crate) end_of_candidates: bool,
    pub(crate) fingerprint: Fingerprint,
    /// Setup role announced by the peer
    pub(crate) setup: Setup,
    pub(crate) audio: Option<NegotiatedMedia>,
    pub(crate) video: Option<NegotiatedMedia>,
    pub(crate) data: bool,
}

impl LocalDescription<'_> {
    fn port(&self) -> u16 {
        match self.address.port() {
            0 => DISCARD_PORT,
            port => port,
        }
    }

    fn session(&self, bundle: Vec<BytesStr>, media_descriptions: Vec<MediaDescription>) -> SessionDescription {
        let ip = self.address.ip();

        SessionDescription {
            origin: Origin {
                username: "-".into(),
                session_id: self.session_id.to_string().into(),
                session_version: self.session_version.to_string().into(),
                address: ip.into(),
            },
            name: "-".into(),
            connection: Some(Connection::from(ip)),
            bandwidth: vec![],
            time: Time { start: 0, stop: 0 },
            direction: Direction::SendRecv,
            group: if bundle.is_empty() {
                vec![]
            } else {
                vec![Group {
                    typ: "BUNDLE".into(),
                    mids: bundle,
                }]
            },
            ice_lite: false,
            ice_options: IceOptions {
                options: vec!["trickle".into()],
            },
            ice_ufrag: None,
            ice_pwd: None,
            ice_end_of_candidates: false,
            fingerprint: vec![],
            setup: None,
            attributes: vec![],
            media_descriptions,
        }
    }

    /// Transport attributes shared by all media lines
    fn transport_attributes(&self, desc: &mut MediaDescription, setup: Setup, with_candidates: bool) {
        desc.connection = Some(Connection::from(self.address.ip()));
        desc.ice_ufrag = Some(IceUsernameFragment {
            ufrag: self.credentials.ufrag.as_str().into(),
        });
        desc.ice_pwd = Some(IcePassword {
            pwd: self.credentials.pwd.as_str().into(),
        });
        desc.setup = Some(setup);
        desc.fingerprint = vec![self.fingerprint.clone()];

        // All media is bundled, candidates are only listed once
        if with_candidates {
            desc.ice_candidates = self.candidates.clone();
            desc.ice_end_of_candidates = self.end_of_candidates;
        }
    }

    fn rtp_line(
        &self,
        media_type: MediaType,
        proto: TransportProtocol,
        mid: Option<BytesStr>,
        local: &LocalMedia<'_>,
        codecs: &[(u8, Codec)],
        offered_fmtp: &[Fmtp],
        direction: Direction,
    ) -> MediaDescription {
        let is_video = media_type == MediaType::Video;

        let mut desc = MediaDescription::new(Media {
            media_type,
            port: self.port(),
            ports_num: None,
            proto,
            fmts: codecs.iter().map(|(pt, _)| pt.to_string().into()).collect(),
        });

        for (pt, codec) in codecs {
            let pt = *pt;

            desc.rtpmap.push(RtpMap {
                payload: pt,
                encoding: codec.name().into(),
                clock_rate: codec.clock_rate(),
                params: codec.channels.map(|channels| channels.to_string().into()),
            });

            // Format parameters of an offer are echoed, they describe what the peer is able to receive
            if let Some(fmtp) = offered_fmtp.iter().find(|fmtp| fmtp.format == pt) {
                desc.fmtp.push(fmtp.clone());
            } else if let Some(params) = &codec.fmtp {
                desc.fmtp.push(Fmtp {
                    format: pt,
                    params: params.as_str().into(),
                });
            }

            if is_video {
                desc.rtcp_fb
                    .extend(codec.rtcp_fb.iter().map(|kind| RtcpFeedback {
                        pt: RtcpFeedbackPt::Pt(pt),
                        kind: kind.as_ref().into(),
                    }));
            }
        }

        desc.bandwidth = vec![Bandwidth::application_specific(local.bandwidth)];
        desc.rtcp_mux = true;
        desc.direction = direction;
        desc.mid = mid;
        desc.ssrc = vec![Ssrc::cname(local.ssrc, self.cname)];
        desc
    }

    fn data_line(&self, proto: TransportProtocol, mid: Option<BytesStr>) -> MediaDescription {
        let mut desc = MediaDescription::new(Media {
            media_type: MediaType::App,
            port: self.port(),
            ports_num: None,
            proto,
            fmts: vec![DATA_CHANNEL_FMT.into()],
        });

        desc.mid = mid;
        desc.sctp_port = Some(SCTP_PORT);
        desc
    }
}

fn local_codecs(codecs: &[Codec]) -> Vec<(u8, Codec)> {
    codecs
        .iter()
        .filter_map(|codec| Some((codec.pt()?, codec.clone())))
        .collect()
}

/// Render an offer containing audio and the video and data media that were added
pub(crate) fn create_offer(local: &LocalDescription<'_>) -> SessionDescription {
    let mut media_descriptions = vec![];

    media_descriptions.push(local.rtp_line(
        MediaType::Audio,
        TransportProtocol::UdpTlsRtpSavpf,
        Some(AUDIO_MID.into()),
        &local.audio,
        &local_codecs(local.audio.codecs),
        &[],
        Direction::SendRecv,
    ));

    if let Some(video) = &local.video {
        media_descriptions.push(local.rtp_line(
            MediaType::Video,
            TransportProtocol::UdpTlsRtpSavpf,
            Some(VIDEO_MID.into()),
            video,
            &local_codecs(video.codecs),
            &[],
            Direction::SendRecv,
        ));
    }

    if local.data {
        media_descriptions.push(local.data_line(TransportProtocol::UdpDtlsSctp, Some(DATA_MID.into())));
    }

    for (i, desc) in media_descriptions.iter_mut().enumerate() {
        local.transport_attributes(desc, Setup::ActPass, i == 0);
    }

    let bundle = media_descriptions
        .iter()
        .filter_map(|desc| desc.mid.clone())
        .collect();

    local.session(bundle, media_descriptions)
}

/// Match an offer against the local media and render the answer
pub(crate) fn create_answer(
    local: &LocalDescription<'_>,
    offer: &SessionDescription,
) -> Result<(SessionDescription, RemoteDescription), Error> {
    let mut media_descriptions = vec![];

    let mut audio = None;
    let mut video = None;
    let mut data = false;

    // Index of the first offered media line that has been accepted, transport info is taken from it
    let mut transport_line = None;

    for (i, offered) in offer.media_descriptions.iter().enumerate() {
        let mid = offered.mid.clone();
        let rejected = || {
            MediaDescription::rejected(offered.media.media_type.clone(), offered.media.proto.clone(), mid.clone())
        };

        if offered.is_rejected() {
            media_descriptions.push(rejected());
            continue;
        }

        let accepted = match &offered.media.media_type {
            MediaType::Audio if audio.is_none() && offered.media.proto.is_secure_rtp() => {
                answer_rtp(local, offered, &local.audio, &mut audio)
            }
            MediaType::Video if video.is_none() && offered.media.proto.is_secure_rtp() => {
                match &local.video {
                    Some(local_video) => answer_rtp(local, offered, local_video, &mut video),
                    None => None,
                }
            }
            MediaType::App if !data && local.data && offered.media.proto.is_data_channel() => {
                data = true;
                Some(local.data_line(offered.media.proto.clone(), mid.clone()))
            }
            _ => None,
        };

        match accepted {
            Some(desc) => {
                transport_line.get_or_insert(i);
                media_descriptions.push(desc);
            }
            None => {
                log::debug!("rejecting offered {} media line", offered.media.media_type);
                media_descriptions.push(rejected());
            }
        }
    }

    let Some(transport_line) = transport_line else {
        return Err(Error::CodecMismatch);
    };

    let offered = &offer.media_descriptions[transport_line];
    let remote_setup = offer.setup(offered).unwrap_or(Setup::ActPass);

    let mut remote = remote_transport(offer, offered, remote_setup)?;
    remote.audio = audio;
    remote.video = video;
    remote.data = data;

    let mut first = true;
    for desc in &mut media_descriptions {
        if desc.is_rejected() {
            continue;
        }

        local.transport_attributes(desc, remote_setup.answer(), first);
        first = false;
    }

    // Only bundle what the offer bundled
    let bundle = match offer.bundle() {
        Some(offered_bundle) => media_descriptions
            .iter()
            .filter(|desc| !desc.is_rejected())
            .filter_map(|desc| desc.mid.clone())
            .filter(|mid| offered_bundle.contains(mid))
            .collect(),
        None => vec![],
    };

    Ok((local.session(bundle, media_descriptions), remote))
}

/// Choose the codecs of an offered RTP media line
fn answer_rtp(
    local: &LocalDescription<'_>,
    offered: &MediaDescription,
    local_media: &LocalMedia<'_>,
    negotiated: &mut Option<NegotiatedMedia>,
) -> Option<MediaDescription> {
    let codecs = match_codecs(local_media.codecs, offered);

    if codecs.is_empty() {
        return None;
    }

    let direction = offered.direction.flipped();

    let desc = local.rtp_line(
        offered.media.media_type.clone(),
        offered.media.proto.clone(),
        offered.mid.clone(),
        local_media,
        &codecs,
        &offered.fmtp,
        direction,
    );

    *negotiated = Some(NegotiatedMedia {
        codecs,
        remote_ssrc: offered.first_ssrc(),
        direction,
    });

    Some(desc)
}

/// Intersection of the local and offered codecs, in the order of the offer
fn match_codecs(local: &[Codec], offered: &MediaDescription) -> Vec<(u8, Codec)> {
    let mut codecs: Vec<(u8, Codec)> = vec![];

    for pt in offered.media.payload_types() {
        let codec = match offered.rtpmap.iter().find(|rtpmap| rtpmap.payload == pt) {
            Some(rtpmap) => local
                .iter()
                .find(|codec| codec.same_codec(&rtpmap.encoding, rtpmap.clock_rate)),
            // static payload types may be used without a rtpmap
            None => Codec::from_static_pt(pt).and_then(|known| {
                local
                    .iter()
                    .find(|codec| codec.pt_is_static && codec.pt == known.pt)
            }),
        };

        let Some(codec) = codec else {
            continue;
        };

        if codecs.iter().any(|(_, c)| c == codec) {
            continue;
        }

        codecs.push((pt, codec.clone()));
    }

    codecs
}

/// ICE and DTLS parameters of the media line carrying the bundled transport
fn remote_transport(
    sdp: &SessionDescription,
    desc: &MediaDescription,
    setup: Setup,
) -> Result<RemoteDescription, Error> {
    let (ufrag, pwd) = sdp
        .ice_credentials(desc)
        .ok_or_else(|| Error::SdpParse("missing ice-ufrag or ice-pwd".into()))?;

    let fingerprint = sdp
        .fingerprint(desc)
        .cloned()
        .ok_or_else(|| Error::SdpParse("missing DTLS fingerprint".into()))?;

    let candidates = sdp
        .media_descriptions
        .iter()
        .filter(|desc| !desc.is_rejected())
        .flat_map(|desc| desc.ice_candidates.iter().cloned())
        .collect();

    Ok(RemoteDescription {
        credentials: IceCredentials {
            ufrag: ufrag.to_string(),
            pwd: pwd.to_string(),
        },
        candidates,
        end_of_candidates: sdp.has_end_of_candidates(),
        fingerprint,
        setup,
        audio: None,
        video: None,
        data: false,
    })
}

/// Match the answer to an offer created by [`create_offer`]
pub(crate) fn apply_answer(
    local: &LocalDescription<'_>,
    answer: &SessionDescription,
) -> Result<RemoteDescription, Error> {
    let find = |mid: &str, index: usize| {
        answer
            .media_descriptions
            .iter()
            .find(|desc| desc.mid.as_deref() == Some(mid))
            .or_else(|| answer.media_descriptions.get(index))
            .filter(|desc| !desc.is_rejected())
    };

    let mut index = 0;
    let audio_desc = find(AUDIO_MID, index);

    let video_desc = if local.video.is_some() {
        index += 1;
        find(VIDEO_MID, index)
    } else {
        None
    };

    let data_desc = if local.data {
        index += 1;
        find(DATA_MID, index).filter(|desc| desc.media.proto.is_data_channel())
    } else {
        None
    };

    let audio = audio_desc.and_then(|desc| negotiated_from_answer(local.audio.codecs, desc));
    let video = match (&local.video, video_desc) {
        (Some(local_video), Some(desc)) => negotiated_from_answer(local_video.codecs, desc),
        _ => None,
    };

    let transport_desc = [
        audio.as_ref().and(audio_desc),
        video.as_ref().and(video_desc),
        data_desc,
    ]
    .into_iter()
    .flatten()
    .next()
    .ok_or(Error::CodecMismatch)?;

    // An answer must not contain actpass, treat it like active
    let setup = match answer.setup(transport_desc) {
        Some(Setup::ActPass) | None => Setup::Active,
        Some(setup) => setup,
    };

    let mut remote = remote_transport(answer, transport_desc, setup)?;
    remote.audio = audio;
    remote.video = video;
    remote.data = data_desc.is_some();

    Ok(remote)
}

fn negotiated_from_answer(local: &[Codec], desc: &MediaDescription) -> Option<NegotiatedMedia> {
    let codecs = match_codecs(local, desc);

    if codecs.is_empty() {
        return None;
    }

    Some(NegotiatedMedia {
        codecs,
        remote_ssrc: desc.first_ssrc(),
        direction: desc.direction.flipped(),
    })
}
