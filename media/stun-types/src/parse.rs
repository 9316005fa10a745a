use crate::attributes::{Attribute, Fingerprint, MessageIntegrity, MessageIntegritySha256};
use crate::header::{Class, MessageHead, Method, STUN_HEADER_LENGTH};
use crate::{COOKIE, Error, NE, TransactionId, padding_usize};
use byteorder::ByteOrder;

/// Location of a single attribute inside a parsed message buffer
#[derive(Debug, Clone, Copy)]
pub struct AttrSpan {
    /// Index where the attribute's value begins
    pub begin: usize,

    /// Index of end of the attribute's value
    pub end: usize,

    /// End of the attribute's value including padding
    pub padding_end: usize,

    /// Attribute type id
    pub typ: u16,
}

impl AttrSpan {
    pub fn get_value<'b>(&self, buf: &'b [u8]) -> &'b [u8] {
        &buf[self.begin..self.end]
    }
}

/// A parsed STUN message. Attributes are only decoded on access.
pub struct Message {
    buffer: Vec<u8>,
    head: MessageHead,
    class: Class,
    method: Method,
    transaction_id: TransactionId,
    attributes: Vec<AttrSpan>,
}

impl Message {
    pub fn parse(buffer: impl Into<Vec<u8>>) -> Result<Message, Error> {
        let buffer = buffer.into();

        if buffer.len() < STUN_HEADER_LENGTH {
            return Err(Error::InvalidData("buffer shorter than the STUN header"));
        }

        let head = MessageHead(NE::read_u32(&buffer[0..4]));

        if head.z() != 0 || NE::read_u32(&buffer[4..8]) != COOKIE {
            return Err(Error::InvalidData("not a stun message"));
        }

        if usize::from(head.len()) + STUN_HEADER_LENGTH != buffer.len() {
            return Err(Error::InvalidData("message length does not match buffer"));
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&buffer[8..STUN_HEADER_LENGTH]);

        let class = Class::from_type(head.typ());
        let method = Method::from_type(head.typ())?;

        let mut attributes = vec![];
        let mut position = STUN_HEADER_LENGTH;

        while position < buffer.len() {
            if position + 4 > buffer.len() {
                return Err(Error::InvalidData("truncated attribute header"));
            }

            let typ = NE::read_u16(&buffer[position..]);
            let len = usize::from(NE::read_u16(&buffer[position + 2..]));

            let begin = position + 4;
            let end = begin + len;
            let padding_end = end + padding_usize(len);

            if padding_end > buffer.len() {
                return Err(Error::InvalidData(
                    "Invalid attribute length in STUN message",
                ));
            }

            attributes.push(AttrSpan {
                begin,
                end,
                padding_end,
                typ,
            });

            position = padding_end;
        }

        Ok(Message {
            buffer,
            head,
            class,
            method,
            transaction_id: TransactionId::new(transaction_id),
            attributes,
        })
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Magic cookie followed by the transaction id, used as XOR key for IPv6 addresses
    pub(crate) fn id(&self) -> u128 {
        NE::read_u128(&self.buffer[4..STUN_HEADER_LENGTH])
    }

    /// Returns if the message contains an attribute with the given type, without decoding it
    pub fn has_attribute(&self, typ: u16) -> bool {
        self.attributes.iter().any(|attr| attr.typ == typ)
    }

    /// Try to read an attribute from the message
    pub fn attribute<'a, A>(&'a mut self) -> Option<Result<A, Error>>
    where
        A: Attribute<'a, Context = ()> + 'a,
    {
        self.attribute_with(())
    }

    /// Try to read an attribute from the message with a required context (like a key to verify the integrity of the message)
    pub fn attribute_with<'a, A>(&'a mut self, ctx: A::Context) -> Option<Result<A, Error>>
    where
        A: Attribute<'a> + 'a,
    {
        let mut after_integrity = false;

        for attr in self.attributes.iter().copied() {
            // Attributes following MESSAGE-INTEGRITY are ignored,
            // except MESSAGE-INTEGRITY-SHA256 and FINGERPRINT
            if after_integrity
                && !matches!(attr.typ, MessageIntegritySha256::TYPE | Fingerprint::TYPE)
            {
                return None;
            }

            if attr.typ == A::TYPE {
                return Some(A::decode(ctx, self, attr));
            }

            if matches!(
                attr.typ,
                MessageIntegrity::TYPE | MessageIntegritySha256::TYPE
            ) {
                after_integrity = true;
            }
        }

        None
    }

    /// Access the message with the given length set.
    ///
    /// Integrity and fingerprint are computed over a message whose length points at the end of their attribute.
    pub fn with_msg_len<F, R>(&mut self, len: u16, f: F) -> R
    where
        F: FnOnce(&mut Self) -> R,
    {
        let old_len = self.head.len();
        self.set_msg_len(len);

        let result = f(self);

        self.set_msg_len(old_len);

        result
    }

    fn set_msg_len(&mut self, len: u16) {
        self.head.set_len(len);
        self.buffer[..4].copy_from_slice(&self.head.0.to_be_bytes());
    }

    /// Return the raw message
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the message and return the raw bytes
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}
