use crate::{
    Codec, CryptoKind, MediaKind, MediaflowConfig,
    config::assign_payload_types,
    datachannel::{ChannelEvent, ChannelId, ChannelState, DataChannels},
    demux::PacketKind,
    dtls::{DtlsError, DtlsSession, DtlsSetup, SrtpKeys},
    error::{CloseReason, Error},
    identity::DtlsIdentity,
    milestones::{Milestone, Milestones},
    opt_min,
    privacy::PrivacyFilter,
    sdp::{self, LocalDescription, LocalMedia, RemoteDescription},
};
use bytesstr::BytesStr;
use ice::{
    CandidateKind, IceAgent, IceConnectionState, IceCredentials, IceEvent, IceGatheringState,
    ReceivedPkt, SelectedPair, Side, TurnServer, TurnTransport,
};
use rand::distr::{Alphanumeric, SampleString};
use sdp_types::{IceCandidate, SessionDescription, Setup};
use std::{
    collections::VecDeque,
    mem::take,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

/// DTLS records which arrive before the candidate pair is selected are kept up to this limit
const MAX_EARLY_DTLS: usize = 16;

/// Information about an established flow, see [`MediaflowEvent::Established`]
#[derive(Debug, Clone)]
pub struct Established {
    pub crypto: CryptoKind,
    /// Name of the preferred negotiated audio codec, empty if audio was rejected
    pub audio_codec: String,
    pub local: CandidateKind,
    pub remote: CandidateKind,
    pub remote_addr: SocketAddr,
}

/// Events emitted by a [`Mediaflow`], retrieved with [`Mediaflow::pop_event`]
#[derive(Debug)]
pub enum MediaflowEvent {
    /// A local candidate is available and should be trickled to the peer, the value of a `a=candidate` line
    LocalCandidate(String),
    /// Every candidate source either produced candidates or failed
    Gathered {
        /// Sources which failed, this does not affect the other sources
        failed: Vec<(SocketAddr, Error)>,
    },
    /// Gathering, connectivity checks and the DTLS handshake completed, emitted exactly once
    Established(Established),
    /// The flow was torn down, no more media can be sent or received
    Closed(CloseReason),

    /// A data channel is open, either opened locally and acknowledged or opened by the peer
    ChannelOpen { id: ChannelId, label: String },
    ChannelMessage { id: ChannelId, data: Vec<u8> },
    ChannelClosed { id: ChannelId },

    /// Authenticated and decrypted RTP packet
    RtpReceived {
        /// Media the packet belongs to, if the SSRC was announced by the peer
        media: Option<MediaKind>,
        packet: Vec<u8>,
    },
    /// Authenticated and decrypted RTCP compound packet
    RtcpReceived(Vec<u8>),

    /// Send a datagram from the local UDP socket
    SendData {
        data: Vec<u8>,
        source: Option<IpAddr>,
        target: SocketAddr,
    },
    /// Write bytes to the stream connection of a TURN server, the connection must be opened on first use
    SendStream { server: SocketAddr, data: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offerer,
    Answerer,
}

/// One peer to peer media transport
///
/// Combines an ICE agent, a DTLS-SRTP session and data channels. Like everything in this crate it does no IO
/// itself, it is driven using [`poll`](Mediaflow::poll), [`receive`](Mediaflow::receive) and
/// [`timeout`](Mediaflow::timeout) and returns everything it wants to send through
/// [`pop_event`](Mediaflow::pop_event).
pub struct Mediaflow {
    identity: DtlsIdentity,
    local_addr: SocketAddr,
    crypto: CryptoKind,
    audio_bandwidth: u32,
    video_bandwidth: u32,

    audio_codecs: Vec<Codec>,
    video_codecs: Vec<Codec>,

    session_id: u64,
    session_version: u64,
    cname: String,
    audio_ssrc: u32,
    video_ssrc: u32,

    video: bool,
    data: bool,
    privacy: PrivacyFilter,

    ice: IceAgent,
    local_eoc: bool,
    source_errors: Vec<(SocketAddr, Error)>,

    role: Option<Role>,
    local_sdp: bool,
    remote: Option<RemoteDescription>,

    /// DTLS role, known once the remote description was applied
    dtls_setup: Option<DtlsSetup>,
    dtls: Option<DtlsSession>,
    early_dtls: Vec<Vec<u8>>,
    srtp: Option<SrtpKeys>,
    channels: DataChannels,

    milestones: Milestones,
    closed: Option<CloseReason>,

    events: VecDeque<MediaflowEvent>,
}

impl Mediaflow {
    /// Create a flow, the servers of the config are used to gather candidates right away
    pub fn new(config: MediaflowConfig, identity: DtlsIdentity) -> Self {
        let MediaflowConfig {
            local_addr,
            mut audio_codecs,
            mut video_codecs,
            privacy,
            stun_servers,
            turn_servers,
            audio_bandwidth,
            video_bandwidth,
            crypto,
            ice: ice_config,
        } = config;

        assign_payload_types(audio_codecs.iter_mut().chain(video_codecs.iter_mut()));

        // Start as controlling, the role is changed if the peer sends the offer
        let mut ice = IceAgent::new(ice_config, IceCredentials::random(), true);

        let privacy = PrivacyFilter { enabled: privacy };
        ice.set_filter(privacy);

        for server in stun_servers {
            ice.add_stun_server(server);
        }

        for server in turn_servers {
            ice.add_turn_server(server);
        }

        Mediaflow {
            identity,
            local_addr,
            crypto,
            audio_bandwidth,
            video_bandwidth,
            audio_codecs,
            video_codecs,
            session_id: u64::from(rand::random::<u32>()),
            session_version: 0,
            cname: Alphanumeric.sample_string(&mut rand::rng(), 16),
            audio_ssrc: rand::random(),
            video_ssrc: rand::random(),
            video: false,
            data: false,
            privacy,
            ice,
            local_eoc: false,
            source_errors: vec![],
            role: None,
            local_sdp: false,
            remote: None,
            dtls_setup: None,
            dtls: None,
            early_dtls: vec![],
            srtp: None,
            channels: DataChannels::new(),
            milestones: Milestones::default(),
            closed: None,
            events: VecDeque::new(),
        }
    }

    /// Only signal and accept relayed candidates
    pub fn set_privacy(&mut self, enabled: bool) {
        self.privacy = PrivacyFilter { enabled };
        self.ice.set_filter(self.privacy);
    }

    pub fn privacy(&self) -> bool {
        self.privacy.enabled
    }

    /// Add a video media line, must be called before the offer or answer is created
    pub fn add_video(&mut self) {
        self.video = true;
    }

    /// Add an application media line carrying data channels, must be called before the offer or answer is created
    pub fn add_data(&mut self) {
        self.data = true;
    }

    // ==== Gathering

    /// Add a local host address, the [`TokioIo`](crate::tokio::TokioIo) driver does this for every interface
    pub fn add_local_host_candidate(&mut self, addr: SocketAddr) {
        self.ice.add_host_addr(addr);
    }

    /// Mark local gathering as complete without waiting for the configured servers
    pub fn set_local_eoc(&mut self) {
        self.local_eoc = true;
    }

    pub fn gather_stun(&mut self, server: SocketAddr) {
        self.ice.add_stun_server(server);
    }

    /// Allocate a relayed candidate on a TURN server using UDP
    pub fn gather_turn(&mut self, server: SocketAddr, username: &str, password: &str) {
        self.ice
            .add_turn_server(TurnServer::new(server, TurnTransport::Udp, username, password));
    }

    /// Allocate a relayed candidate on a TURN server using TCP, or TLS over TCP if `secure` is set
    pub fn gather_turn_tcp(&mut self, server: SocketAddr, secure: bool, username: &str, password: &str) {
        let transport = if secure {
            TurnTransport::Tls
        } else {
            TurnTransport::Tcp
        };

        self.ice
            .add_turn_server(TurnServer::new(server, transport, username, password));
    }

    /// Returns if gathering completed, this never triggers any new requests
    pub fn is_gathered(&self) -> bool {
        self.local_eoc || self.ice.gathering_state() == IceGatheringState::Complete
    }

    /// Local or remote candidates of the given kind, as visible under the privacy policy
    pub fn candidates(&self, side: Side, kind: CandidateKind) -> Vec<IceCandidate> {
        self.ice.candidates(side, kind)
    }

    pub fn candidate_count(&self, side: Side, kind: CandidateKind) -> usize {
        self.ice.candidate_count(side, kind)
    }

    // ==== Offer/Answer

    fn local_description(&self) -> LocalDescription<'_> {
        LocalDescription {
            session_id: self.session_id,
            session_version: self.session_version,
            address: self.local_addr,
            cname: &self.cname,
            credentials: self.ice.credentials(),
            fingerprint: self.identity.fingerprint(),
            candidates: self.ice.ice_candidates(),
            end_of_candidates: self.is_gathered(),
            audio: LocalMedia {
                codecs: &self.audio_codecs,
                ssrc: self.audio_ssrc,
                bandwidth: self.audio_bandwidth,
            },
            video: self.video.then_some(LocalMedia {
                codecs: &self.video_codecs,
                ssrc: self.video_ssrc,
                bandwidth: self.video_bandwidth,
            }),
            data: self.data,
        }
    }

    /// Create an SDP offer
    ///
    /// This can be called before gathering completed, the offer then contains the candidates gathered so far
    /// and the rest must be trickled.
    pub fn generate_offer(&mut self) -> Result<String, Error> {
        if self.role == Some(Role::Answerer) {
            return Err(Error::InvalidState("flow already answered an offer"));
        }

        self.role = Some(Role::Offerer);
        self.session_version += 1;
        self.local_sdp = true;
        self.ice.set_controlling(true);

        Ok(sdp::create_offer(&self.local_description()).to_string())
    }

    /// Apply an SDP offer of the peer and create the answer
    pub fn offer_answer(&mut self, offer: &str) -> Result<String, Error> {
        if self.role.is_some() {
            return Err(Error::InvalidState("offer/answer already started"));
        }

        let offer = SessionDescription::parse(&BytesStr::from(offer))?;

        self.session_version += 1;
        let (answer, remote) = sdp::create_answer(&self.local_description(), &offer)?;

        let dtls_setup = match remote.setup.answer() {
            Setup::Active => DtlsSetup::Connect,
            Setup::Passive => DtlsSetup::Accept,
            Setup::ActPass | Setup::HoldConn => {
                return Err(Error::SdpParse("unsupported DTLS setup role".into()));
            }
        };

        self.role = Some(Role::Answerer);
        self.local_sdp = true;
        self.ice.set_controlling(false);
        self.apply_remote(remote, dtls_setup);

        Ok(answer.to_string())
    }

    /// Apply the SDP answer of the peer to the offer created with [`generate_offer`](Mediaflow::generate_offer)
    pub fn handle_answer(&mut self, answer: &str) -> Result<(), Error> {
        if self.role != Some(Role::Offerer) || self.remote.is_some() {
            return Err(Error::InvalidState("no pending offer"));
        }

        let answer = SessionDescription::parse(&BytesStr::from(answer))?;
        let remote = sdp::apply_answer(&self.local_description(), &answer)?;

        let dtls_setup = match remote.setup {
            Setup::Active => DtlsSetup::Accept,
            Setup::Passive => DtlsSetup::Connect,
            Setup::ActPass | Setup::HoldConn => {
                return Err(Error::SdpParse("unsupported DTLS setup role".into()));
            }
        };

        self.apply_remote(remote, dtls_setup);

        Ok(())
    }

    fn apply_remote(&mut self, remote: RemoteDescription, dtls_setup: DtlsSetup) {
        log::debug!(
            "applying remote description, audio={} video={} data={} dtls={dtls_setup:?}",
            remote.audio.is_some(),
            remote.video.is_some(),
            remote.data
        );

        self.ice.set_remote_data(
            remote.credentials.clone(),
            &remote.candidates,
            remote.end_of_candidates,
        );

        self.dtls_setup = Some(dtls_setup);
        self.remote = Some(remote);
    }

    /// Add a candidate trickled by the peer, with or without the `candidate:` prefix
    pub fn add_remote_candidate(&mut self, candidate: &str) -> Result<(), Error> {
        let line = BytesStr::from(candidate.trim());

        let value: &str = &line;
        let value = value.strip_prefix("a=").unwrap_or(value);
        let value = value.strip_prefix("candidate:").unwrap_or(value);

        let (_, candidate) = IceCandidate::parse(line.as_ref(), value)
            .map_err(|e| Error::SdpParse(format!("invalid candidate, {e}")))?;

        self.ice.add_remote_candidate(&candidate);

        Ok(())
    }

    /// The peer will not trickle any more candidates
    pub fn set_remote_eoc(&mut self) {
        self.ice.set_remote_end_of_candidates();
    }

    pub fn remote_eoc(&self) -> bool {
        self.ice.remote_end_of_candidates()
    }

    /// A remote description was applied
    pub fn got_sdp(&self) -> bool {
        self.remote.is_some()
    }

    /// Both the local and remote description are complete
    pub fn sdp_is_complete(&self) -> bool {
        self.local_sdp && self.remote.is_some()
    }

    pub fn has_remote_fingerprint(&self) -> bool {
        self.remote.is_some()
    }

    pub fn has_video(&self) -> bool {
        self.remote.as_ref().is_some_and(|remote| remote.video.is_some())
    }

    pub fn has_data(&self) -> bool {
        self.remote.as_ref().is_some_and(|remote| remote.data)
    }

    pub fn local_ssrc(&self, kind: MediaKind) -> Option<u32> {
        match kind {
            MediaKind::Audio => Some(self.audio_ssrc),
            MediaKind::Video => self.video.then_some(self.video_ssrc),
        }
    }

    pub fn remote_ssrc(&self, kind: MediaKind) -> Option<u32> {
        let remote = self.remote.as_ref()?;

        let media = match kind {
            MediaKind::Audio => remote.audio.as_ref(),
            MediaKind::Video => remote.video.as_ref(),
        };

        media?.remote_ssrc
    }

    pub fn crypto_kind(&self) -> CryptoKind {
        self.crypto
    }

    /// The DTLS handshake completed and SRTP can be used
    pub fn is_ready(&self) -> bool {
        self.srtp.is_some() && self.closed.is_none()
    }

    pub fn is_established(&self) -> bool {
        self.milestones.is_established() && self.closed.is_none()
    }

    /// Returns why the flow was closed, if it was
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed
    }

    /// Fail operations on a closed flow with the error matching its close reason
    fn check_open(&self) -> Result<(), Error> {
        match self.closed {
            None => Ok(()),
            Some(CloseReason::CryptoVerificationFailed) => Err(Error::CryptoVerificationFailed),
            Some(CloseReason::NoUsableCandidates) => Err(Error::NoUsableCandidates),
            Some(_) => Err(Error::InvalidState("flow is closed")),
        }
    }

    // ==== Data channels

    /// Open a data channel, it is opened as soon as the DTLS handshake completed
    ///
    /// If a channel with the same label exists it is returned instead.
    pub fn open_channel(&mut self, now: Instant, label: &str, reliable: bool) -> Result<ChannelId, Error> {
        self.check_open()?;

        if !self.data || self.remote.as_ref().is_some_and(|remote| !remote.data) {
            return Err(Error::InvalidState("data channels are not negotiated"));
        }

        let id = self.channels.open(now, label, reliable);
        self.process(now);

        Ok(id)
    }

    pub fn send_channel(&mut self, now: Instant, id: ChannelId, data: &[u8]) -> Result<(), Error> {
        self.check_open()?;
        self.channels.send(now, id, data)?;
        self.process(now);

        Ok(())
    }

    pub fn close_channel(&mut self, now: Instant, id: ChannelId) -> Result<(), Error> {
        self.channels.close(id)?;
        self.process(now);

        Ok(())
    }

    pub fn channel_state(&self, id: ChannelId) -> Option<ChannelState> {
        self.channels.state(id)
    }

    pub fn channel_label(&self, id: ChannelId) -> Option<&str> {
        self.channels.label(id)
    }

    // ==== Media

    /// Protect and send a RTP packet over the selected candidate pair
    pub fn send_rtp(&mut self, now: Instant, packet: &[u8]) -> Result<(), Error> {
        self.check_open()?;

        let srtp = self
            .srtp
            .as_mut()
            .ok_or(Error::InvalidState("DTLS handshake not completed"))?;

        let protected = srtp.outbound.protect_rtp(packet)?;
        self.send_protected(now, protected)
    }

    /// Protect and send a RTCP compound packet over the selected candidate pair
    pub fn send_rtcp(&mut self, now: Instant, packet: &[u8]) -> Result<(), Error> {
        self.check_open()?;

        let srtp = self
            .srtp
            .as_mut()
            .ok_or(Error::InvalidState("DTLS handshake not completed"))?;

        let protected = srtp.outbound.protect_rtcp(packet)?;
        self.send_protected(now, protected)
    }

    fn send_protected(&mut self, now: Instant, packet: Vec<u8>) -> Result<(), Error> {
        self.ice
            .send(now, packet)
            .map_err(|_| Error::InvalidState("no selected candidate pair"))?;

        self.process(now);

        Ok(())
    }

    // ==== IO

    /// Receive a datagram on the local UDP socket
    pub fn receive(&mut self, now: Instant, pkt: ReceivedPkt) {
        if let Some(pkt) = self.ice.receive(now, pkt) {
            self.receive_media(now, pkt);
        }

        self.process(now);
    }

    /// Receive bytes from the stream connection of a TURN server
    pub fn receive_stream(&mut self, now: Instant, server: SocketAddr, data: &[u8]) {
        for pkt in self.ice.receive_stream(now, server, data) {
            self.receive_media(now, pkt);
        }

        self.process(now);
    }

    /// The stream connection to a TURN server could not be established or was closed
    pub fn stream_failed(&mut self, now: Instant, server: SocketAddr) {
        self.ice.stream_failed(now, server);
        self.process(now);
    }

    /// Everything that is not consumed by ICE or TURN
    fn receive_media(&mut self, now: Instant, pkt: ReceivedPkt) {
        if self.closed.is_some() {
            return;
        }

        match PacketKind::identify(&pkt.data) {
            PacketKind::Dtls => self.receive_dtls(now, pkt.data),
            PacketKind::Rtp => {
                let Some(srtp) = &mut self.srtp else {
                    log::trace!("Dropping RTP packet received before the DTLS handshake completed");
                    return;
                };

                match srtp.inbound.unprotect_rtp(&pkt.data) {
                    Ok(packet) => {
                        let media = ssrc_of(&packet).and_then(|ssrc| self.media_of_ssrc(ssrc));
                        self.events
                            .push_back(MediaflowEvent::RtpReceived { media, packet });
                    }
                    Err(e) => log::debug!("Failed to unprotect RTP packet from {}, {e}", pkt.source),
                }
            }
            PacketKind::Rtcp => {
                let Some(srtp) = &mut self.srtp else {
                    log::trace!("Dropping RTCP packet received before the DTLS handshake completed");
                    return;
                };

                match srtp.inbound.unprotect_rtcp(&pkt.data) {
                    Ok(packet) => self.events.push_back(MediaflowEvent::RtcpReceived(packet)),
                    Err(e) => log::debug!("Failed to unprotect RTCP packet from {}, {e}", pkt.source),
                }
            }
            PacketKind::Stun | PacketKind::Unknown => {
                log::trace!("Dropping unexpected packet from {}", pkt.source);
            }
        }
    }

    fn media_of_ssrc(&self, ssrc: u32) -> Option<MediaKind> {
        [MediaKind::Audio, MediaKind::Video]
            .into_iter()
            .find(|&kind| self.remote_ssrc(kind) == Some(ssrc))
    }

    fn receive_dtls(&mut self, now: Instant, record: Vec<u8>) {
        let Some(dtls) = &mut self.dtls else {
            // The peer selected its pair before this side did
            if self.early_dtls.len() < MAX_EARLY_DTLS {
                self.early_dtls.push(record);
            } else {
                log::debug!("Dropping DTLS record, too many records received before pair selection");
            }

            return;
        };

        let result = dtls.receive(now, record);
        self.after_dtls(now, result);
    }

    /// Handle the outcome of an operation on the DTLS session
    fn after_dtls(&mut self, now: Instant, result: Result<(), DtlsError>) {
        if let Err(e) = result {
            log::warn!("DTLS failed, {e}");

            let reason = match e {
                DtlsError::FingerprintMismatch => CloseReason::CryptoVerificationFailed,
                _ => CloseReason::DtlsFailed,
            };

            self.terminate(now, reason);
            return;
        }

        let Some(dtls) = &mut self.dtls else {
            return;
        };

        if self.srtp.is_none()
            && let Some(keys) = dtls.take_srtp()
        {
            let is_client = dtls.setup() == DtlsSetup::Connect;

            self.srtp = Some(keys);

            if self.has_data() {
                self.channels.start(now, is_client);
            }

            self.reach(Milestone::HandshakeComplete);
        }

        while let Some(data) = self.dtls.as_mut().and_then(DtlsSession::pop_app_data) {
            if self.has_data() {
                self.channels.receive(&data);
            } else {
                log::trace!("Dropping DTLS application data, data channels were not negotiated");
            }
        }

        if self.dtls.as_ref().is_some_and(DtlsSession::is_closed) {
            log::debug!("DTLS session closed by peer");
            self.terminate(now, CloseReason::Normal);
        }
    }

    fn start_dtls(&mut self, now: Instant) {
        if self.dtls.is_some() {
            return;
        }

        let (Some(remote), Some(setup)) = (&self.remote, self.dtls_setup) else {
            return;
        };

        match DtlsSession::new(now, &self.identity, remote.fingerprint.clone(), setup) {
            Ok(dtls) => {
                log::debug!("Starting DTLS handshake as {setup:?}");
                self.dtls = Some(dtls);
            }
            Err(e) => {
                log::warn!("Failed to create DTLS session, {e}");
                self.terminate(now, CloseReason::DtlsFailed);
                return;
            }
        }

        for record in take(&mut self.early_dtls) {
            self.receive_dtls(now, record);

            if self.closed.is_some() {
                return;
            }
        }
    }

    // ==== Driving

    /// Drive the flow forward, must be called after the duration returned by [`timeout`](Mediaflow::timeout)
    pub fn poll(&mut self, now: Instant) {
        self.ice.poll(now);

        if self.closed.is_none() {
            if let Some(dtls) = &mut self.dtls {
                let result = dtls.poll(now);
                self.after_dtls(now, result);
            }

            self.channels.poll(now);
        }

        self.process(now);
    }

    /// Returns a duration after which [`poll`](Mediaflow::poll) must be called
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        let mut timeout = self.ice.timeout(now);

        if self.closed.is_some() {
            return timeout;
        }

        // Gathering completion and ICE failure are evaluated while polling
        let ice_failed = self.ice.connection_state() == IceConnectionState::Failed
            && self.ice.remote_end_of_candidates();

        if ice_failed || self.gathering_decided() {
            return Some(Duration::ZERO);
        }

        if let Some(dtls) = &self.dtls {
            timeout = opt_min(timeout, dtls.timeout(now));
        }

        opt_min(timeout, self.channels.timeout(now))
    }

    /// Returns if there are events that must be handled using [`pop_event`](Mediaflow::pop_event)
    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn pop_event(&mut self) -> Option<MediaflowEvent> {
        self.events.pop_front()
    }

    /// Close the flow, releases TURN allocations and notifies the peer using a DTLS close_notify
    pub fn close(&mut self, now: Instant) {
        self.terminate(now, CloseReason::Normal);
    }

    /// Move data between the subsystems until nothing is left to do
    fn process(&mut self, now: Instant) {
        loop {
            self.flush_channels(now);
            self.flush_dtls(now);

            let Some(event) = self.ice.pop_event() else {
                break;
            };

            self.handle_ice_event(now, event);
        }

        if self.closed.is_some() {
            return;
        }

        if self.gathering_decided() {
            self.on_gathered(now);
        }

        self.check_ice_state(now);
    }

    fn flush_channels(&mut self, now: Instant) {
        while let Some(event) = self.channels.pop_event() {
            self.events.push_back(match event {
                ChannelEvent::Opened { id, label } => MediaflowEvent::ChannelOpen { id, label },
                ChannelEvent::Message { id, data } => MediaflowEvent::ChannelMessage { id, data },
                ChannelEvent::Closed { id } => MediaflowEvent::ChannelClosed { id },
            });
        }

        let Some(dtls) = self.dtls.as_mut().filter(|dtls| dtls.is_connected()) else {
            return;
        };

        while let Some(message) = self.channels.pop_outbound() {
            if let Err(e) = dtls.send(&message) {
                log::warn!("Failed to send data channel message, {e}");
                self.terminate(now, CloseReason::DtlsFailed);
                return;
            }
        }
    }

    fn flush_dtls(&mut self, now: Instant) {
        let Some(dtls) = &mut self.dtls else {
            return;
        };

        while let Some(record) = dtls.pop_to_send() {
            if self.ice.send(now, record).is_err() {
                log::debug!("Dropping DTLS record, no selected candidate pair");
            }
        }
    }

    fn handle_ice_event(&mut self, now: Instant, event: IceEvent) {
        match event {
            IceEvent::SendData {
                data,
                source,
                target,
            } => self.events.push_back(MediaflowEvent::SendData {
                data,
                source,
                target,
            }),
            IceEvent::SendStream { server, data } => {
                self.events.push_back(MediaflowEvent::SendStream { server, data })
            }
            _ if self.closed.is_some() => {}
            IceEvent::GatheringStateChanged { old, new } => {
                log::debug!("gathering state {old:?} -> {new:?}");
            }
            IceEvent::ConnectionStateChanged { old, new } => {
                log::debug!("ICE connection state {old:?} -> {new:?}");
            }
            IceEvent::LocalCandidate(candidate) => self
                .events
                .push_back(MediaflowEvent::LocalCandidate(candidate.to_string())),
            IceEvent::SourceFailed { server, error } => {
                log::warn!("Candidate source {server} failed, {error}");
                self.source_errors.push((server, error.into()));
            }
            IceEvent::Selected(pair) => self.on_selected(now, pair),
            IceEvent::RelayExpired { server } => {
                if self.milestones.pair_selected() && self.ice.selected().is_none() {
                    log::warn!("Relay on {server} carrying the selected pair expired");
                    self.terminate(now, CloseReason::RelayExpired);
                }
            }
        }
    }

    fn on_selected(&mut self, now: Instant, pair: SelectedPair) {
        log::debug!(
            "Selected pair {:?} {} -> {:?} {}",
            pair.local,
            pair.local_addr,
            pair.remote,
            pair.remote_addr
        );

        self.start_dtls(now);

        if self.closed.is_none() {
            self.reach(Milestone::PairSelected);
        }
    }

    /// Gathering is complete but not yet handled
    ///
    /// Without a usable candidate the outcome is only known once every source finished, a pending TURN
    /// allocation may still produce one even if the local end-of-candidates was set.
    fn gathering_decided(&self) -> bool {
        if self.milestones.gathered() || !self.is_gathered() {
            return false;
        }

        self.ice.gathering_state() == IceGatheringState::Complete || !self.ice.ice_candidates().is_empty()
    }

    fn on_gathered(&mut self, now: Instant) {
        log::debug!("Gathering completed");

        if self.ice.ice_candidates().is_empty() {
            log::warn!("Gathering completed without usable candidates");
            self.terminate(now, CloseReason::NoUsableCandidates);
            return;
        }

        let failed = take(&mut self.source_errors);
        self.events.push_back(MediaflowEvent::Gathered { failed });

        self.reach(Milestone::Gathered);
    }

    /// ICE failure is only final once the peer has no more candidates to trickle
    fn check_ice_state(&mut self, now: Instant) {
        if self.ice.connection_state() != IceConnectionState::Failed {
            return;
        }

        if self.milestones.pair_selected() {
            self.terminate(now, CloseReason::RelayExpired);
        } else if self.ice.remote_end_of_candidates() {
            self.terminate(now, CloseReason::IceFailed);
        }
    }

    fn reach(&mut self, milestone: Milestone) {
        if !self.milestones.reach(milestone) {
            return;
        }

        let Some(pair) = self.ice.selected() else {
            return;
        };

        let audio_codec = self
            .remote
            .as_ref()
            .and_then(|remote| remote.audio.as_ref())
            .and_then(|audio| audio.codecs.first())
            .map(|(_, codec)| codec.name().to_owned())
            .unwrap_or_default();

        log::debug!("Flow established using {} over {:?}", audio_codec, pair.local);

        self.events
            .push_back(MediaflowEvent::Established(Established {
                crypto: self.crypto,
                audio_codec,
                local: pair.local,
                remote: pair.remote,
                remote_addr: pair.remote_addr,
            }));
    }

    fn terminate(&mut self, now: Instant, reason: CloseReason) {
        if self.closed.is_some() {
            return;
        }

        log::debug!("Closing flow, {reason}");
        self.closed = Some(reason);

        if let Some(dtls) = &mut self.dtls {
            dtls.close();
        }

        self.flush_dtls(now);
        self.ice.shutdown(now);
        self.srtp = None;

        self.events.push_back(MediaflowEvent::Closed(reason));

        // forward the deallocations
        while let Some(event) = self.ice.pop_event() {
            self.handle_ice_event(now, event);
        }
    }
}

fn ssrc_of(packet: &[u8]) -> Option<u32> {
    let ssrc = packet.get(8..12)?.try_into().ok()?;
    Some(u32::from_be_bytes(ssrc))
}
