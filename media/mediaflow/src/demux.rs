/// Classification of a datagram arriving on the flow's transport (RFC 7983)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PacketKind {
    Rtp,
    Rtcp,
    Stun,
    Dtls,
    Unknown,
}

impl PacketKind {
    pub(crate) fn identify(bytes: &[u8]) -> Self {
        let [first, second, ..] = bytes else {
            return PacketKind::Unknown;
        };

        match first {
            0..=3 => PacketKind::Stun,
            20..=63 => PacketKind::Dtls,
            128..=191 => {
                // RTCP packet types 192-223 collide with the RTP marker bit + payload type 64-95
                if let 64..=95 = second & 0x7F {
                    PacketKind::Rtcp
                } else {
                    PacketKind::Rtp
                }
            }
            _ => PacketKind::Unknown,
        }
    }
}
