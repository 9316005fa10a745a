use bytesstr::BytesStr;
use common::{Peer, Sim};
use mediaflow::{
    CandidateKind, CloseReason, Codec, DtlsIdentity, Error, MediaKind, Mediaflow, MediaflowConfig,
    Side,
};
use sdp_types::SessionDescription;
use std::time::{Duration, Instant};

mod common;

const CHROME_OFFER: &str = "v=0\r
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r
s=-\r
t=0 0\r
a=group:BUNDLE 0\r
a=msid-semantic: WMS stream\r
m=audio 9 UDP/TLS/RTP/SAVPF 111 103 0 8 126\r
c=IN IP4 0.0.0.0\r
a=rtcp:9 IN IP4 0.0.0.0\r
a=candidate:1467250027 1 udp 2122260223 192.168.0.196 46243 typ host generation 0 network-id 1\r
a=candidate:1467250027 2 udp 2122260222 192.168.0.196 56280 typ host generation 0 network-id 1\r
a=ice-ufrag:CHr2\r
a=ice-pwd:kN8Z1JrbOJ4ZXW7rEbZfzQJc\r
a=ice-options:trickle\r
a=fingerprint:sha-256 1D:A8:0B:46:EF:25:C9:3D:D1:D5:06:B9:9B:41:BE:DB:42:D6:15:D3:BA:C5:D5:99:FA:CC:92:74:AE:36:22:AB\r
a=setup:actpass\r
a=mid:0\r
a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level\r
a=sendrecv\r
a=msid:stream track\r
a=rtcp-mux\r
a=rtpmap:111 opus/48000/2\r
a=rtcp-fb:111 transport-cc\r
a=fmtp:111 minptime=10;useinbandfec=1\r
a=rtpmap:103 ISAC/16000\r
a=rtpmap:0 PCMU/8000\r
a=rtpmap:8 PCMA/8000\r
a=rtpmap:126 telephone-event/8000\r
a=ssrc:3735928559 cname:Yq0tpGd2Tc1N0Zp6\r
";

const FIREFOX_OFFER: &str = "v=0\r
o=mozilla...THIS_IS_SDPARTA-99.0 3421538426352447431 0 IN IP4 0.0.0.0\r
s=-\r
t=0 0\r
a=ice-ufrag:c1b6b3f9\r
a=ice-pwd:ee95ef6683918f54eb890b03cd9d0864\r
a=fingerprint:sha-256 76:26:23:AB:46:FC:19:F3:78:45:84:F4:0A:2C:12:09:70:97:4D:DD:BB:BB:B8:64:81:12:85:70:6E:27:3E:80\r
m=audio 42496 UDP/TLS/RTP/SAVPF 109 0 8 101\r
c=IN IP4 54.73.198.45\r
a=rtpmap:109 opus/48000/2\r
a=ptime:20\r
a=rtpmap:0 PCMU/8000\r
a=rtpmap:101 telephone-event/8000\r
a=fmtp:101 0-15\r
a=sendrecv\r
a=setup:actpass\r
a=candidate:0 1 UDP 2122252543 10.0.0.63 42496 typ host\r
a=candidate:4 1 UDP 1686052863 54.73.198.45 42496 typ srflx raddr 10.0.0.63 rport 42496\r
a=rtcp-mux\r
a=end-of-candidates\r
";

fn flow(addr: &str, configure: impl FnOnce(&mut MediaflowConfig)) -> Mediaflow {
    let mut config = MediaflowConfig {
        local_addr: common::addr(addr),
        audio_codecs: vec![Codec::OPUS, Codec::PCMU],
        ..MediaflowConfig::default()
    };

    configure(&mut config);

    let mut flow = Mediaflow::new(config, DtlsIdentity::generate().unwrap());
    flow.add_local_host_candidate(common::addr(addr));
    flow
}

fn lines(sdp: &str) -> Vec<&str> {
    sdp.lines().map(str::trim_end).collect()
}

/// Change the last byte of every fingerprint, keeping the syntax intact
fn tamper_fingerprint(sdp: &str) -> String {
    sdp.split_inclusive("\r\n")
        .map(|line| {
            if !line.starts_with("a=fingerprint:") {
                return line.to_owned();
            }

            let content = line.trim_end();
            let (head, last) = content.split_at(content.len() - 2);
            let replacement = if last == "00" { "11" } else { "00" };

            format!("{head}{replacement}\r\n")
        })
        .collect()
}

#[test]
fn answer_chrome_offer() {
    common::init_log();
    let mut flow = flow("10.0.0.1:5000", |_| {});

    let answer = flow.offer_answer(CHROME_OFFER).unwrap();
    let lines = lines(&answer);

    assert!(lines.contains(&"m=audio 5000 UDP/TLS/RTP/SAVPF 111 0"));
    assert!(lines.contains(&"a=setup:active"));
    assert!(lines.contains(&"a=rtcp-mux"));
    assert!(lines.contains(&"a=mid:0"));
    assert!(lines.contains(&"a=group:BUNDLE 0"));
    assert!(lines.contains(&"a=rtpmap:111 opus/48000/2"));
    assert!(lines.contains(&"a=fmtp:111 minptime=10;useinbandfec=1"));
    assert!(lines.iter().any(|line| line.starts_with("a=fingerprint:sha-256 ")));
    assert!(lines.iter().any(|line| line.starts_with("a=ice-ufrag:")));

    assert!(flow.got_sdp());
    assert!(flow.sdp_is_complete());
    assert!(flow.has_remote_fingerprint());
    assert!(!flow.has_video());
    assert!(!flow.remote_eoc());
    assert_eq!(flow.remote_ssrc(MediaKind::Audio), Some(3735928559));

    // rtcp candidates are never used
    assert_eq!(flow.candidate_count(Side::Remote, CandidateKind::Host), 1);
}

#[test]
fn answer_mirrors_offer_without_mid() {
    common::init_log();
    let mut flow = flow("10.0.0.1:5000", |_| {});

    let offer: String = CHROME_OFFER
        .split_inclusive("\r\n")
        .filter(|line| !line.starts_with("a=mid:") && !line.starts_with("a=group:"))
        .collect();

    let answer = flow.offer_answer(&offer).unwrap();
    let lines = lines(&answer);

    assert!(lines.contains(&"m=audio 5000 UDP/TLS/RTP/SAVPF 111 0"));
    assert!(!lines.iter().any(|line| line.starts_with("a=mid:")));
    assert!(!lines.iter().any(|line| line.starts_with("a=group:")));
}

#[test]
fn answer_firefox_offer() {
    common::init_log();
    let mut flow = flow("10.0.0.1:5000", |_| {});

    let answer = flow.offer_answer(FIREFOX_OFFER).unwrap();
    let lines = lines(&answer);

    assert!(lines.contains(&"m=audio 5000 UDP/TLS/RTP/SAVPF 109 0"));
    assert!(lines.contains(&"a=setup:active"));
    assert!(lines.contains(&"a=rtcp-mux"));
    assert!(lines.iter().any(|line| line.starts_with("a=fingerprint:sha-256 ")));

    assert!(flow.remote_eoc());
    assert_eq!(flow.candidate_count(Side::Remote, CandidateKind::Host), 1);
    assert_eq!(flow.candidate_count(Side::Remote, CandidateKind::ServerReflexive), 1);
}

#[test]
fn offer_without_codecs() {
    common::init_log();
    let mut flow = flow("127.0.0.1:5000", |config| config.audio_codecs.clear());

    let offer = flow.generate_offer().unwrap();
    let lines = lines(&offer);

    assert!(lines.contains(&"m=audio 5000 UDP/TLS/RTP/SAVPF"));
    assert!(lines.contains(&"c=IN IP4 127.0.0.1"));
    assert!(lines.contains(&"a=setup:actpass"));
}

#[test]
fn offer_lists_every_media() {
    common::init_log();
    let mut flow = flow("10.0.0.1:5000", |config| config.video_codecs = vec![Codec::VP8]);
    flow.add_video();
    flow.add_data();
    flow.set_local_eoc();

    let offer = flow.generate_offer().unwrap();
    let lines = lines(&offer);

    assert!(lines.contains(&"a=group:BUNDLE audio video data"));
    assert!(lines.contains(&"m=audio 5000 UDP/TLS/RTP/SAVPF 96 0"));
    assert!(lines.contains(&"m=video 5000 UDP/TLS/RTP/SAVPF 97"));
    assert!(lines.contains(&"m=application 5000 UDP/DTLS/SCTP webrtc-datachannel"));
    assert!(lines.contains(&"a=mid:audio"));
    assert!(lines.contains(&"a=mid:video"));
    assert!(lines.contains(&"a=mid:data"));
    assert!(lines.contains(&"a=rtpmap:96 opus/48000/2"));
    assert!(lines.contains(&"a=rtpmap:0 PCMU/8000"));
    assert!(lines.contains(&"a=rtpmap:97 VP8/90000"));
    assert!(lines.iter().any(|line| line.starts_with("a=candidate:") && line.ends_with("typ host")));
    assert!(lines.contains(&"a=end-of-candidates"));

    let video_ssrc = flow.local_ssrc(MediaKind::Video).unwrap();
    assert!(lines.iter().any(|line| line.starts_with(&format!("a=ssrc:{video_ssrc} cname:"))));
}

#[test]
fn rendered_offer_parses_back() {
    common::init_log();

    let cases: [(bool, bool, &[&str], &[&[u8]]); 3] = [
        (false, false, &["audio"], &[&[96, 0]]),
        (true, false, &["audio", "video"], &[&[96, 0], &[97]]),
        (true, true, &["audio", "video", "data"], &[&[96, 0], &[97], &[]]),
    ];

    for (video, data, mids, payload_types) in cases {
        let mut flow = flow("10.0.0.1:5000", |config| config.video_codecs = vec![Codec::VP8]);

        if video {
            flow.add_video();
        }

        if data {
            flow.add_data();
        }

        let offer = flow.generate_offer().unwrap();
        let parsed = SessionDescription::parse(&BytesStr::from(offer)).unwrap();

        assert_eq!(parsed.media_descriptions.len(), mids.len());

        let parsed_mids: Vec<&str> = parsed
            .media_descriptions
            .iter()
            .map(|desc| desc.mid.as_deref().unwrap())
            .collect();
        assert_eq!(parsed_mids, mids);

        let bundle: Vec<&str> = parsed.bundle().unwrap().iter().map(|mid| &mid[..]).collect();
        assert_eq!(bundle, mids);

        for (desc, expected) in parsed.media_descriptions.iter().zip(payload_types) {
            let pts: Vec<u8> = desc.media.payload_types().collect();
            assert_eq!(pts, *expected);

            let mapped: Vec<u8> = desc.rtpmap.iter().map(|rtpmap| rtpmap.payload).collect();
            assert_eq!(mapped, *expected);
        }

        let candidates = &parsed.media_descriptions[0].ice_candidates;
        assert_eq!(candidates.len(), 1);
    }
}

#[test]
fn offer_and_answer_agree() {
    common::init_log();

    let mut a = flow("10.0.0.1:5000", |config| config.video_codecs = vec![Codec::VP8]);
    let mut b = flow("10.0.0.2:5000", |config| config.video_codecs = vec![Codec::VP8]);
    a.add_video();
    b.add_video();

    let offer = a.generate_offer().unwrap();
    let answer = b.offer_answer(&offer).unwrap();
    a.handle_answer(&answer).unwrap();

    assert!(a.has_video());
    assert!(b.has_video());
    assert!(!a.has_data());

    for kind in [MediaKind::Audio, MediaKind::Video] {
        assert_eq!(a.remote_ssrc(kind), b.local_ssrc(kind));
        assert_eq!(b.remote_ssrc(kind), a.local_ssrc(kind));
    }

    assert!(lines(&answer).contains(&"a=setup:active"));
    assert_eq!(a.candidate_count(Side::Remote, CandidateKind::Host), 1);
    assert_eq!(b.candidate_count(Side::Remote, CandidateKind::Host), 1);
}

#[test]
fn no_common_codec_is_rejected() {
    common::init_log();

    let mut a = flow("10.0.0.1:5000", |config| config.audio_codecs = vec![Codec::PCMA]);
    let mut b = flow("10.0.0.2:5000", |config| config.audio_codecs = vec![Codec::G722]);

    let offer = a.generate_offer().unwrap();
    assert!(matches!(b.offer_answer(&offer), Err(Error::CodecMismatch)));
}

#[test]
fn offer_answer_roles_are_enforced() {
    common::init_log();

    let mut a = flow("10.0.0.1:5000", |_| {});
    let mut b = flow("10.0.0.2:5000", |_| {});

    assert!(matches!(a.handle_answer(CHROME_OFFER), Err(Error::InvalidState(_))));

    let offer = a.generate_offer().unwrap();
    b.offer_answer(&offer).unwrap();

    assert!(matches!(b.generate_offer(), Err(Error::InvalidState(_))));
    assert!(matches!(b.offer_answer(&offer), Err(Error::InvalidState(_))));
}

#[test]
fn invalid_sdp_is_reported() {
    common::init_log();
    let mut flow = flow("10.0.0.1:5000", |_| {});

    assert!(matches!(
        flow.offer_answer("v=0\r\ns=-\r\n"),
        Err(Error::SdpParse(_))
    ));
    assert!(!flow.got_sdp());
}

#[test]
fn trickled_candidates() {
    common::init_log();
    let mut flow = flow("10.0.0.1:5000", |_| {});

    flow.add_remote_candidate("42 1 udp 2113937151 10.0.0.63 2004 typ host")
        .unwrap();
    flow.add_remote_candidate("a=candidate:43 1 udp 1677729535 203.0.113.5 2005 typ srflx raddr 10.0.0.63 rport 2004")
        .unwrap();
    // duplicates are ignored
    flow.add_remote_candidate("candidate:42 1 udp 2113937151 10.0.0.63 2004 typ host")
        .unwrap();

    assert_eq!(flow.candidate_count(Side::Remote, CandidateKind::Host), 1);
    assert_eq!(flow.candidate_count(Side::Remote, CandidateKind::ServerReflexive), 1);

    let host = &flow.candidates(Side::Remote, CandidateKind::Host)[0];
    assert_eq!(host.port, 2004);
    assert_eq!(host.priority, 2113937151);

    assert!(matches!(
        flow.add_remote_candidate("not a candidate"),
        Err(Error::SdpParse(_))
    ));

    assert!(!flow.remote_eoc());
    flow.set_remote_eoc();
    assert!(flow.remote_eoc());
}

#[test]
fn media_requires_handshake() {
    common::init_log();
    let mut flow = flow("10.0.0.1:5000", |_| {});
    let now = Instant::now();

    let packet = [0x80, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];

    assert!(matches!(flow.send_rtp(now, &packet), Err(Error::InvalidState(_))));
    assert!(matches!(flow.send_rtcp(now, &packet), Err(Error::InvalidState(_))));
    assert!(!flow.is_ready());
    assert!(!flow.is_established());
    assert_eq!(flow.close_reason(), None);
}

#[test]
fn fingerprint_mismatch() {
    let mut sim = Sim::new(
        vec![Peer::new("10.0.0.1:5000", |_| {}), Peer::new("10.0.0.2:5000", |_| {})],
        vec![],
    );

    assert!(sim.run_until(Duration::from_secs(5), |sim| {
        sim.peers.iter().all(|peer| peer.flow.is_gathered())
    }));

    let offer = sim.a().flow.generate_offer().unwrap();
    let answer = sim.b().flow.offer_answer(&offer).unwrap();
    sim.a().flow.handle_answer(&tamper_fingerprint(&answer)).unwrap();

    assert!(sim.run_until(Duration::from_secs(30), |sim| sim.peers[0].closed().is_some()));

    assert_eq!(sim.peers[0].closed(), Some(CloseReason::CryptoVerificationFailed));
    assert_eq!(
        sim.peers[0].flow.close_reason(),
        Some(CloseReason::CryptoVerificationFailed)
    );
    assert!(sim.peers[0].established().is_none());
    assert!(!sim.peers[0].flow.is_ready());

    // operations on the torn down flow report why it was closed
    let now = sim.now;
    assert!(matches!(
        sim.a().flow.send_rtp(now, &[0x80, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1]),
        Err(Error::CryptoVerificationFailed)
    ));
    assert!(matches!(
        sim.a().flow.send_rtcp(now, &[0x80, 200, 0, 1, 0, 0, 0, 1]),
        Err(Error::CryptoVerificationFailed)
    ));
}
