//! SRTP & SRTCP with the `AES_CM_128_HMAC_SHA1_80` protection profile
//!
//! [RFC3711](https://www.rfc-editor.org/rfc/rfc3711)

use hmac::{Mac, SimpleHmac};
use openssl::{error::ErrorStack, memcmp, symm};
use sha1::Sha1;
use std::collections::HashMap;

pub(crate) const MASTER_KEY_LEN: usize = 16;
pub(crate) const MASTER_SALT_LEN: usize = 14;

const SESSION_AUTH_KEY_LEN: usize = 20;
const AUTH_TAG_LEN: usize = 10;
const SRTCP_INDEX_LEN: usize = 4;
const RTP_HEADER_LEN: usize = 12;
const RTCP_HEADER_LEN: usize = 8;

// Key derivation labels
const LABEL_RTP_ENCRYPTION: u8 = 0x00;
const LABEL_RTP_AUTH: u8 = 0x01;
const LABEL_RTP_SALT: u8 = 0x02;
const LABEL_RTCP_ENCRYPTION: u8 = 0x03;
const LABEL_RTCP_AUTH: u8 = 0x04;
const LABEL_RTCP_SALT: u8 = 0x05;

#[derive(Debug, thiserror::Error)]
pub enum SrtpError {
    #[error("packet is too short or malformed")]
    InvalidPacket,
    #[error("authentication tag does not match")]
    AuthenticationFailed,
    #[error(transparent)]
    Crypto(#[from] ErrorStack),
}

/// Session keys derived from a master key for either RTP or RTCP
struct SessionKeys {
    cipher_key: [u8; MASTER_KEY_LEN],
    salt: [u8; MASTER_SALT_LEN],
    auth: SimpleHmac<Sha1>,
}

impl SessionKeys {
    fn derive(
        master_key: &[u8],
        master_salt: &[u8],
        labels: [u8; 3],
    ) -> Result<Self, ErrorStack> {
        let [encryption, auth, salt] = labels;

        let mut cipher_key = [0u8; MASTER_KEY_LEN];
        cipher_key.copy_from_slice(&kdf(master_key, master_salt, encryption, MASTER_KEY_LEN)?);

        let mut session_salt = [0u8; MASTER_SALT_LEN];
        session_salt.copy_from_slice(&kdf(master_key, master_salt, salt, MASTER_SALT_LEN)?);

        let auth_key = kdf(master_key, master_salt, auth, SESSION_AUTH_KEY_LEN)?;

        Ok(Self {
            cipher_key,
            salt: session_salt,
            auth: SimpleHmac::new_from_slice(&auth_key).expect("any key length is valid"),
        })
    }

    fn iv(&self, ssrc: u32, index: u64) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..MASTER_SALT_LEN].copy_from_slice(&self.salt);

        for (b, s) in iv[4..8].iter_mut().zip(ssrc.to_be_bytes()) {
            *b ^= s;
        }

        // 48 bit index
        for (b, i) in iv[8..14].iter_mut().zip(&index.to_be_bytes()[2..]) {
            *b ^= i;
        }

        iv
    }

    fn apply_keystream(&self, ssrc: u32, index: u64, data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
        let iv = self.iv(ssrc, index);
        symm::encrypt(symm::Cipher::aes_128_ctr(), &self.cipher_key, Some(&iv), data)
    }

    fn tag(&self, parts: &[&[u8]]) -> [u8; AUTH_TAG_LEN] {
        let mut hmac = self.auth.clone();

        for part in parts {
            hmac.update(part);
        }

        let digest = hmac.finalize().into_bytes();

        let mut tag = [0u8; AUTH_TAG_LEN];
        tag.copy_from_slice(&digest[..AUTH_TAG_LEN]);
        tag
    }
}

/// AES-CM key derivation function with a key derivation rate of 0
fn kdf(master_key: &[u8], master_salt: &[u8], label: u8, len: usize) -> Result<Vec<u8>, ErrorStack> {
    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(master_salt);
    iv[7] ^= label;

    symm::encrypt(
        symm::Cipher::aes_128_ctr(),
        master_key,
        Some(&iv),
        &vec![0u8; len],
    )
}

/// Tracks the rollover counter of a single SSRC
#[derive(Debug, Clone, Copy)]
struct RolloverCounter {
    roc: u32,
    highest_seq: u16,
}

impl RolloverCounter {
    fn new(seq: u16) -> Self {
        Self {
            roc: 0,
            highest_seq: seq,
        }
    }

    /// Estimate the ROC a packet with the given sequence number was sent with
    fn estimate(&self, seq: u16) -> u32 {
        let s_l = i32::from(self.highest_seq);
        let seq_i = i32::from(seq);

        if s_l < 32768 {
            if seq_i - s_l > 32768 {
                self.roc.wrapping_sub(1)
            } else {
                self.roc
            }
        } else if s_l - 32768 > seq_i {
            self.roc.wrapping_add(1)
        } else {
            self.roc
        }
    }

    /// Remember the packet after it has been authenticated (or sent)
    fn update(&mut self, seq: u16, roc: u32) {
        if roc == self.roc.wrapping_add(1) {
            self.roc = roc;
            self.highest_seq = seq;
        } else if roc == self.roc && seq > self.highest_seq {
            self.highest_seq = seq;
        }
    }
}

/// One direction of an SRTP session
pub(crate) struct SrtpSession {
    rtp: SessionKeys,
    rtcp: SessionKeys,
    rollover_counters: HashMap<u32, RolloverCounter>,
    srtcp_index: u32,
}

impl SrtpSession {
    pub(crate) fn new(master_key: &[u8], master_salt: &[u8]) -> Result<Self, SrtpError> {
        if master_key.len() != MASTER_KEY_LEN || master_salt.len() != MASTER_SALT_LEN {
            return Err(SrtpError::InvalidPacket);
        }

        Ok(Self {
            rtp: SessionKeys::derive(
                master_key,
                master_salt,
                [LABEL_RTP_ENCRYPTION, LABEL_RTP_AUTH, LABEL_RTP_SALT],
            )?,
            rtcp: SessionKeys::derive(
                master_key,
                master_salt,
                [LABEL_RTCP_ENCRYPTION, LABEL_RTCP_AUTH, LABEL_RTCP_SALT],
            )?,
            rollover_counters: HashMap::new(),
            srtcp_index: 0,
        })
    }

    fn packet_index(&self, ssrc: u32, seq: u16) -> (u32, u64) {
        let roc = self
            .rollover_counters
            .get(&ssrc)
            .map(|counter| counter.estimate(seq))
            .unwrap_or(0);

        (roc, (u64::from(roc) << 16) | u64::from(seq))
    }

    fn update_roc(&mut self, ssrc: u32, seq: u16, roc: u32) {
        self.rollover_counters
            .entry(ssrc)
            .or_insert_with(|| RolloverCounter::new(seq))
            .update(seq, roc);
    }

    pub(crate) fn protect_rtp(&mut self, packet: &[u8]) -> Result<Vec<u8>, SrtpError> {
        let header_len = rtp_header_len(packet)?;
        let (seq, ssrc) = rtp_seq_ssrc(packet);

        let (roc, index) = self.packet_index(ssrc, seq);

        let mut out = Vec::with_capacity(packet.len() + AUTH_TAG_LEN);
        out.extend_from_slice(&packet[..header_len]);
        out.extend_from_slice(&self.rtp.apply_keystream(ssrc, index, &packet[header_len..])?);

        let tag = self.rtp.tag(&[&out, &roc.to_be_bytes()]);
        out.extend_from_slice(&tag);

        self.update_roc(ssrc, seq, roc);

        Ok(out)
    }

    pub(crate) fn unprotect_rtp(&mut self, packet: &[u8]) -> Result<Vec<u8>, SrtpError> {
        if packet.len() < RTP_HEADER_LEN + AUTH_TAG_LEN {
            return Err(SrtpError::InvalidPacket);
        }

        let (authenticated, tag) = packet.split_at(packet.len() - AUTH_TAG_LEN);
        let header_len = rtp_header_len(authenticated)?;
        let (seq, ssrc) = rtp_seq_ssrc(authenticated);

        let (roc, index) = self.packet_index(ssrc, seq);

        let expected = self.rtp.tag(&[authenticated, &roc.to_be_bytes()]);
        if !memcmp::eq(&expected, tag) {
            return Err(SrtpError::AuthenticationFailed);
        }

        let mut out = Vec::with_capacity(authenticated.len());
        out.extend_from_slice(&authenticated[..header_len]);
        out.extend_from_slice(
            &self
                .rtp
                .apply_keystream(ssrc, index, &authenticated[header_len..])?,
        );

        self.update_roc(ssrc, seq, roc);

        Ok(out)
    }

    pub(crate) fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Vec<u8>, SrtpError> {
        if packet.len() < RTCP_HEADER_LEN {
            return Err(SrtpError::InvalidPacket);
        }

        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let index = self.srtcp_index;
        self.srtcp_index = (self.srtcp_index + 1) & 0x7FFF_FFFF;

        let mut out = Vec::with_capacity(packet.len() + SRTCP_INDEX_LEN + AUTH_TAG_LEN);
        out.extend_from_slice(&packet[..RTCP_HEADER_LEN]);
        out.extend_from_slice(&self.rtcp.apply_keystream(
            ssrc,
            u64::from(index),
            &packet[RTCP_HEADER_LEN..],
        )?);

        // E flag set, the payload is always encrypted
        out.extend_from_slice(&(index | 0x8000_0000).to_be_bytes());

        let tag = self.rtcp.tag(&[&out]);
        out.extend_from_slice(&tag);

        Ok(out)
    }

    pub(crate) fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Vec<u8>, SrtpError> {
        if packet.len() < RTCP_HEADER_LEN + SRTCP_INDEX_LEN + AUTH_TAG_LEN {
            return Err(SrtpError::InvalidPacket);
        }

        let (authenticated, tag) = packet.split_at(packet.len() - AUTH_TAG_LEN);

        let expected = self.rtcp.tag(&[authenticated]);
        if !memcmp::eq(&expected, tag) {
            return Err(SrtpError::AuthenticationFailed);
        }

        let (payload, e_index) = authenticated.split_at(authenticated.len() - SRTCP_INDEX_LEN);
        let e_index = u32::from_be_bytes([e_index[0], e_index[1], e_index[2], e_index[3]]);
        let ssrc = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);

        let mut out = Vec::with_capacity(payload.len());
        out.extend_from_slice(&payload[..RTCP_HEADER_LEN]);

        if e_index & 0x8000_0000 != 0 {
            out.extend_from_slice(&self.rtcp.apply_keystream(
                ssrc,
                u64::from(e_index & 0x7FFF_FFFF),
                &payload[RTCP_HEADER_LEN..],
            )?);
        } else {
            out.extend_from_slice(&payload[RTCP_HEADER_LEN..]);
        }

        Ok(out)
    }
}

/// Length of the RTP header including CSRCs and the header extension
fn rtp_header_len(packet: &[u8]) -> Result<usize, SrtpError> {
    if packet.len() < RTP_HEADER_LEN || packet[0] >> 6 != 2 {
        return Err(SrtpError::InvalidPacket);
    }

    let csrc_count = usize::from(packet[0] & 0x0F);
    let mut len = RTP_HEADER_LEN + 4 * csrc_count;

    if packet[0] & 0x10 != 0 {
        let ext = packet.get(len..len + 4).ok_or(SrtpError::InvalidPacket)?;
        let ext_words = usize::from(u16::from_be_bytes([ext[2], ext[3]]));

        len += 4 + 4 * ext_words;
    }

    if len > packet.len() {
        return Err(SrtpError::InvalidPacket);
    }

    Ok(len)
}

fn rtp_seq_ssrc(packet: &[u8]) -> (u16, u32) {
    (
        u16::from_be_bytes([packet[2], packet[3]]),
        u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    const MASTER_KEY: &str = "E1F97A0D3E018BE0D64FA32C06DE4139";
    const MASTER_SALT: &str = "0EC675AD498AFEEBB6960B3AABE6";

    #[test]
    fn key_derivation_test_vectors() {
        let key = hex(MASTER_KEY);
        let salt = hex(MASTER_SALT);

        assert_eq!(
            kdf(&key, &salt, LABEL_RTP_ENCRYPTION, 16).unwrap(),
            hex("C61E7A93744F39EE10734AFE3FF7A087")
        );
        assert_eq!(
            kdf(&key, &salt, LABEL_RTP_SALT, 14).unwrap(),
            hex("30CBBC08863D8C85D49DB34A9AE1")
        );
        assert_eq!(
            kdf(&key, &salt, LABEL_RTP_AUTH, 20).unwrap(),
            hex("CEBE321F6FF7716B6FD4AB49AF256A156D38BAA4")
        );
    }

    fn rtp_packet(seq: u16, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x80, 0x60];
        packet.extend_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(&1234u32.to_be_bytes());
        packet.extend_from_slice(&ssrc.to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    fn session_pair() -> (SrtpSession, SrtpSession) {
        let key = hex(MASTER_KEY);
        let salt = hex(MASTER_SALT);

        (
            SrtpSession::new(&key, &salt).unwrap(),
            SrtpSession::new(&key, &salt).unwrap(),
        )
    }

    #[test]
    fn rtp_protect_unprotect() {
        let (mut sender, mut receiver) = session_pair();

        let packet = rtp_packet(1, 0xCAFEBABE, b"hello world");
        let protected = sender.protect_rtp(&packet).unwrap();

        assert_eq!(protected.len(), packet.len() + AUTH_TAG_LEN);
        assert_eq!(&protected[..RTP_HEADER_LEN], &packet[..RTP_HEADER_LEN]);
        assert_ne!(&protected[RTP_HEADER_LEN..packet.len()], b"hello world");

        assert_eq!(receiver.unprotect_rtp(&protected).unwrap(), packet);
    }

    #[test]
    fn tampered_rtp_is_rejected() {
        let (mut sender, mut receiver) = session_pair();

        let mut protected = sender
            .protect_rtp(&rtp_packet(7, 1, b"payload"))
            .unwrap();
        protected[RTP_HEADER_LEN] ^= 1;

        assert!(matches!(
            receiver.unprotect_rtp(&protected),
            Err(SrtpError::AuthenticationFailed)
        ));
    }

    #[test]
    fn sequence_number_wrap_increments_roc() {
        let (mut sender, mut receiver) = session_pair();

        for seq in [65534, 65535, 0, 1] {
            let packet = rtp_packet(seq, 42, b"x");
            let protected = sender.protect_rtp(&packet).unwrap();
            assert_eq!(receiver.unprotect_rtp(&protected).unwrap(), packet);
        }

        assert_eq!(receiver.rollover_counters[&42].roc, 1);
        assert_eq!(sender.rollover_counters[&42].roc, 1);
    }

    #[test]
    fn rtcp_protect_unprotect() {
        let (mut sender, mut receiver) = session_pair();

        // receiver report without report blocks + some padding payload
        let mut packet = vec![0x80, 201, 0x00, 0x03];
        packet.extend_from_slice(&0x11223344u32.to_be_bytes());
        packet.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let protected = sender.protect_rtcp(&packet).unwrap();
        assert_eq!(protected.len(), packet.len() + SRTCP_INDEX_LEN + AUTH_TAG_LEN);

        assert_eq!(receiver.unprotect_rtcp(&protected).unwrap(), packet);

        let second = sender.protect_rtcp(&packet).unwrap();
        assert_ne!(protected, second);
        assert_eq!(receiver.unprotect_rtcp(&second).unwrap(), packet);
    }

    #[test]
    fn header_extension_is_not_encrypted() {
        let (mut sender, _) = session_pair();

        let mut packet = rtp_packet(1, 1, &[]);
        packet[0] |= 0x10;
        packet.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01, 0xAA, 0xBB, 0xCC, 0xDD]);
        packet.extend_from_slice(b"media");

        assert_eq!(rtp_header_len(&packet).unwrap(), RTP_HEADER_LEN + 8);

        let protected = sender.protect_rtp(&packet).unwrap();
        assert_eq!(&protected[..RTP_HEADER_LEN + 8], &packet[..RTP_HEADER_LEN + 8]);
    }
}
