use ice::{IceConfig, TurnServer};
use std::borrow::Cow;
use std::net::{Ipv4Addr, SocketAddr};

/// Crypto mode of a flow, only DTLS-SRTP is supported
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CryptoKind {
    #[default]
    DtlsSrtp,
}

impl CryptoKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CryptoKind::DtlsSrtp => "DTLS-SRTP",
        }
    }
}

/// Audio or video, used to query per media SSRCs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Capability descriptor of a codec, only used to generate and match SDP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec {
    /// Either a static payload type of the codec, or assigned when the flow is created
    pub(crate) pt: Option<u8>,
    pub(crate) pt_is_static: bool,
    pub(crate) name: Cow<'static, str>,
    pub(crate) clock_rate: u32,
    pub(crate) channels: Option<u32>,
    pub(crate) fmtp: Option<String>,
    pub(crate) rtcp_fb: Vec<Cow<'static, str>>,
}

impl Codec {
    pub const PCMU: Self = Self::new("PCMU", 8000).with_static_pt(0);
    pub const PCMA: Self = Self::new("PCMA", 8000).with_static_pt(8);
    pub const G722: Self = Self::new("G722", 8000).with_static_pt(9);
    pub const OPUS: Self = Self::new("opus", 48_000).with_channels(2);

    pub const VP8: Self = Self::new("VP8", 90_000);
    pub const H264: Self = Self::new("H264", 90_000);

    pub const fn new(name: &'static str, clock_rate: u32) -> Self {
        Codec {
            pt: None,
            pt_is_static: false,
            name: Cow::Borrowed(name),
            clock_rate,
            channels: None,
            fmtp: None,
            rtcp_fb: Vec::new(),
        }
    }

    pub const fn with_static_pt(mut self, static_pt: u8) -> Self {
        assert!(
            static_pt < 35,
            "static payload type must not be in the dynamic/rtcp range"
        );
        self.pt = Some(static_pt);
        self.pt_is_static = true;
        self
    }

    pub const fn with_channels(mut self, channels: u32) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_fmtp(mut self, fmtp: impl Into<String>) -> Self {
        self.fmtp = Some(fmtp.into());
        self
    }

    /// Add a `a=rtcp-fb` feedback type (e.g. `nack pli`), only used for video codecs
    pub fn with_rtcp_fb(mut self, feedback: impl Into<Cow<'static, str>>) -> Self {
        self.rtcp_fb.push(feedback.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Payload type used in the local SDP
    pub fn pt(&self) -> Option<u8> {
        self.pt
    }

    /// Codec registered for a static payload type which may be used without a rtpmap
    pub(crate) fn from_static_pt(pt: u8) -> Option<Self> {
        match pt {
            0 => Some(Self::PCMU),
            8 => Some(Self::PCMA),
            9 => Some(Self::G722),
            _ => None,
        }
    }

    pub(crate) fn same_codec(&self, name: &str, clock_rate: u32) -> bool {
        self.name.eq_ignore_ascii_case(name) && self.clock_rate == clock_rate
    }
}

/// Per flow configuration, built by the caller and passed to [`Mediaflow::new`](crate::Mediaflow::new)
#[derive(Debug, Clone)]
pub struct MediaflowConfig {
    /// Local address announced in the connection lines of the SDP, the port is used for the media lines
    pub local_addr: SocketAddr,
    /// Audio codecs in order of preference
    pub audio_codecs: Vec<Codec>,
    /// Video codecs in order of preference, only used after [`add_video`](crate::Mediaflow::add_video)
    pub video_codecs: Vec<Codec>,
    /// Only offer and accept relayed candidates
    pub privacy: bool,
    pub stun_servers: Vec<SocketAddr>,
    pub turn_servers: Vec<TurnServer>,
    /// Bandwidth ceiling of the audio media line in kbit/s (`b=AS`)
    pub audio_bandwidth: u32,
    /// Bandwidth ceiling of the video media line in kbit/s (`b=AS`)
    pub video_bandwidth: u32,
    pub crypto: CryptoKind,
    pub ice: IceConfig,
}

impl Default for MediaflowConfig {
    fn default() -> Self {
        Self {
            local_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            audio_codecs: vec![],
            video_codecs: vec![],
            privacy: false,
            stun_servers: vec![],
            turn_servers: vec![],
            audio_bandwidth: 50,
            video_bandwidth: 800,
            crypto: CryptoKind::default(),
            ice: IceConfig::default(),
        }
    }
}

/// Assign dynamic payload types to every codec which doesn't have a static one
pub(crate) fn assign_payload_types<'a>(codecs: impl IntoIterator<Item = &'a mut Codec>) {
    let mut next_pt = 96u8;

    for codec in codecs {
        if codec.pt.is_none() {
            codec.pt = Some(next_pt);
            next_pt = next_pt.saturating_add(1).min(127);
        }
    }
}
