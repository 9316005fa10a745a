//! STUN (RFC 8489) and TURN (RFC 8656) message codec.
//!
//! Messages are built with [`MessageBuilder`] and read with [`Message::parse`]. Attributes implement
//! [`attributes::Attribute`] and are encoded/decoded lazily against the raw message buffer.
//! TURN ChannelData frames and stream (TCP/TLS) framing live in [`channel_data`] and [`stream`].

use byteorder::ByteOrder;
use header::{MessageHead, STUN_HEADER_LENGTH};
use std::io;
use std::num::TryFromIntError;
use std::str::Utf8Error;

pub mod attributes;
pub mod builder;
pub mod channel_data;
pub mod header;
pub mod parse;
pub mod stream;

pub use builder::MessageBuilder;
pub use header::{Class, Method};
pub use parse::{AttrSpan, Message};

type NE = byteorder::NetworkEndian;

const COOKIE: u32 = 0x2112A442;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input data, {0}")]
    InvalidData(&'static str),
    #[error("failed to convert integer")]
    TryFromInt(#[from] TryFromIntError),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => Self::InvalidData("buffer seems incomplete"),
            _ => Self::InvalidData("failed to read from buffer"),
        }
    }
}

/// Number of bytes required to pad `n` to a multiple of 4
fn padding_usize(n: usize) -> usize {
    (4 - n % 4) % 4
}

fn padding_u16(n: u16) -> u16 {
    (4 - n % 4) % 4
}

/// 96 bit STUN transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    pub fn new(v: [u8; 12]) -> Self {
        Self(v)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

/// Return value of [`is_stun_message`]
#[derive(Debug, PartialEq, Eq)]
pub enum IsStunMessageInfo {
    /// Message is shorter than 20 bytes (STUN message header length),
    /// making it impossible to check.
    TooShort,

    /// Buffer does not contain a STUN message.
    No,

    /// Buffer contains a STUN message.
    /// Variant contains the remaining amount of bytes after the message.
    Yes { remaining: usize },

    /// Buffer contains the start of a STUN message, but its incomplete.
    /// Variant contains the amount of bytes still missing.
    YesIncomplete { needed: usize },
}

/// Inspect the given input to find out if it starts with a STUN message.
pub fn is_stun_message(i: &[u8]) -> IsStunMessageInfo {
    if i.len() < STUN_HEADER_LENGTH {
        return IsStunMessageInfo::TooShort;
    }

    let head = MessageHead(NE::read_u32(&i[0..4]));

    if head.z() != 0 || NE::read_u32(&i[4..8]) != COOKIE {
        return IsStunMessageInfo::No;
    }

    let expected_msg_len = usize::from(head.len()) + STUN_HEADER_LENGTH;

    if i.len() < expected_msg_len {
        IsStunMessageInfo::YesIncomplete {
            needed: expected_msg_len - i.len(),
        }
    } else {
        IsStunMessageInfo::Yes {
            remaining: i.len() - expected_msg_len,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::attributes::Software;

    #[test]
    fn detect_stun_message() {
        let mut builder =
            MessageBuilder::new(Class::Request, Method::Binding, TransactionId::random());
        builder.add_attr(Software::new("mediaflow"));
        let mut bytes = builder.finish();

        assert_eq!(
            is_stun_message(&bytes),
            IsStunMessageInfo::Yes { remaining: 0 }
        );

        assert_eq!(
            is_stun_message(&bytes[..bytes.len() - 4]),
            IsStunMessageInfo::YesIncomplete { needed: 4 }
        );

        bytes.extend_from_slice(&[1, 2, 3]);
        assert_eq!(
            is_stun_message(&bytes),
            IsStunMessageInfo::Yes { remaining: 3 }
        );

        assert_eq!(is_stun_message(&[0u8; 8]), IsStunMessageInfo::TooShort);
        assert_eq!(
            is_stun_message(&[0x16; STUN_HEADER_LENGTH]),
            IsStunMessageInfo::No
        );
    }

    #[test]
    fn padding() {
        assert_eq!(padding_usize(0), 0);
        assert_eq!(padding_usize(1), 3);
        assert_eq!(padding_usize(6), 2);
        assert_eq!(padding_u16(7), 1);
    }
}
