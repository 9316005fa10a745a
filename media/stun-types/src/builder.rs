use crate::attributes::Attribute;
use crate::header::{Class, MessageHead, Method, STUN_HEADER_LENGTH, message_type};
use crate::{COOKIE, TransactionId, padding_u16, padding_usize};
use bytes::BufMut;

/// Builder for a STUN message
pub struct MessageBuilder {
    head: MessageHead,
    transaction_id: TransactionId,
    buffer: Vec<u8>,
}

impl MessageBuilder {
    /// Create a new message builder.
    pub fn new(class: Class, method: Method, transaction_id: TransactionId) -> Self {
        let mut head = MessageHead(0);
        head.set_typ(message_type(class, method));

        let mut buffer = Vec::with_capacity(128);
        buffer.put_u32(head.0);
        buffer.put_u32(COOKIE);
        buffer.put_slice(transaction_id.as_bytes());

        Self {
            head,
            transaction_id,
            buffer,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Overwrite the length field of the message header
    pub fn set_len(&mut self, len: u16) {
        self.head.set_len(len);
        self.buffer[..4].copy_from_slice(&self.head.0.to_be_bytes());
    }

    /// Serialize the attribute into the builder
    pub fn add_attr<'a, A>(&mut self, attr: A)
    where
        A: Attribute<'a, Context = ()>,
    {
        self.add_attr_with(attr, ())
    }

    /// Serialize the attribute into the builder with a given context (e.g. the key used for message integrity)
    pub fn add_attr_with<'a, A>(&mut self, attr: A, ctx: A::Context)
    where
        A: Attribute<'a>,
    {
        let enc_len = attr
            .encode_len()
            .expect("attribute values must fit into 65535 bytes");

        self.buffer.put_u16(A::TYPE);
        self.buffer.put_u16(enc_len);

        attr.encode(ctx, self);

        self.buffer
            .extend(std::iter::repeat_n(0, usize::from(padding_u16(enc_len))));
    }

    /// Magic cookie followed by the transaction id, used as XOR key for IPv6 addresses
    pub(crate) fn id(&self) -> u128 {
        let mut id = [0u8; 16];
        id[..4].copy_from_slice(&COOKIE.to_be_bytes());
        id[4..].copy_from_slice(self.transaction_id.as_bytes());
        u128::from_be_bytes(id)
    }

    pub fn finish(mut self) -> Vec<u8> {
        debug_assert_eq!(padding_usize(self.buffer.len()), 0);

        let len = self.buffer.len() - STUN_HEADER_LENGTH;
        self.set_len(
            len.try_into()
                .expect("stun messages must fit within 65535 bytes"),
        );
        self.buffer
    }

    pub fn buffer(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }
}
