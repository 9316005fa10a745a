use super::{ATTRIBUTE_HEADER_LEN, Attribute};
use crate::Error;
use crate::builder::MessageBuilder;
use crate::header::STUN_HEADER_LENGTH;
use crate::parse::{AttrSpan, Message};
use hmac::digest::core_api::BlockSizeUser;
use hmac::digest::{Digest, Update};
use hmac::{Mac, SimpleHmac};
use sha1::Sha1;
use sha2::Sha256;

/// Long-term credential key (`MD5(username ":" realm ":" password)`)
///
/// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-9.2.2)
pub fn long_term_password_md5(username: &str, realm: &str, password: &str) -> Vec<u8> {
    md5::compute(format!("{username}:{realm}:{password}").as_bytes()).to_vec()
}

pub struct MessageIntegrityKey(SimpleHmac<Sha1>);

impl MessageIntegrityKey {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self(SimpleHmac::new_from_slice(key.as_ref()).expect("any key length is valid"))
    }
}

/// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.5)
pub struct MessageIntegrity;

impl Attribute<'_> for MessageIntegrity {
    type Context = MessageIntegrityKey;
    const TYPE: u16 = 0x0008;

    fn decode(ctx: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        verify_digest(ctx.0, msg, attr)?;
        Ok(Self)
    }

    fn encode(&self, ctx: Self::Context, builder: &mut MessageBuilder) {
        append_digest(ctx.0, builder)
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(u16::try_from(<Sha1 as Digest>::output_size())?)
    }
}

pub struct MessageIntegritySha256Key(SimpleHmac<Sha256>);

impl MessageIntegritySha256Key {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self(SimpleHmac::new_from_slice(key.as_ref()).expect("any key length is valid"))
    }
}

/// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.6)
pub struct MessageIntegritySha256;

impl Attribute<'_> for MessageIntegritySha256 {
    type Context = MessageIntegritySha256Key;
    const TYPE: u16 = 0x001C;

    fn decode(ctx: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        verify_digest(ctx.0, msg, attr)?;
        Ok(Self)
    }

    fn encode(&self, ctx: Self::Context, builder: &mut MessageBuilder) {
        append_digest(ctx.0, builder)
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(u16::try_from(<Sha256 as Digest>::output_size())?)
    }
}

// The HMAC covers the message up to the attribute preceding the integrity attribute,
// with the header length pointing at the end of the integrity attribute.
fn verify_digest<D>(mut hmac: SimpleHmac<D>, msg: &mut Message, attr: AttrSpan) -> Result<(), Error>
where
    D: Digest + BlockSizeUser,
{
    let len = u16::try_from(attr.padding_end - STUN_HEADER_LENGTH)?;

    msg.with_msg_len(len, |msg| {
        let received_digest = attr.get_value(msg.buffer());
        let covered = &msg.buffer()[..attr.begin - ATTRIBUTE_HEADER_LEN];

        Update::update(&mut hmac, covered);
        let calculated_digest = hmac.finalize().into_bytes();

        if calculated_digest.as_slice() != received_digest {
            return Err(Error::InvalidData("failed to verify message integrity"));
        }

        Ok(())
    })
}

fn append_digest<D>(mut hmac: SimpleHmac<D>, builder: &mut MessageBuilder)
where
    D: Digest + BlockSizeUser,
{
    // type & length of the attribute are already written
    let len = builder.buffer().len() + <D as Digest>::output_size() - STUN_HEADER_LENGTH;

    builder.set_len(
        len.try_into()
            .expect("stun messages must fit within 65535 bytes"),
    );

    let data = builder.buffer();
    Update::update(&mut hmac, &data[..data.len() - ATTRIBUTE_HEADER_LEN]);
    let digest = hmac.finalize().into_bytes();

    builder.buffer().extend_from_slice(&digest);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::attributes::{Realm, Software, Username};
    use crate::{Class, Method, TransactionId};

    #[test]
    fn short_term_sha1() {
        let mut message =
            MessageBuilder::new(Class::Request, Method::Binding, TransactionId::new([7; 12]));
        message.add_attr(Username::new("remote:local"));
        message.add_attr_with(MessageIntegrity, MessageIntegrityKey::new("abc123"));

        let mut msg = Message::parse(message.finish()).unwrap();

        assert!(
            msg.attribute_with::<MessageIntegrity>(MessageIntegrityKey::new("abc123"))
                .unwrap()
                .is_ok()
        );
        assert!(
            msg.attribute_with::<MessageIntegrity>(MessageIntegrityKey::new("wrong"))
                .unwrap()
                .is_err()
        );
    }

    #[test]
    fn long_term_sha256() {
        let key = long_term_password_md5("user", "example.org", "pass");
        assert_eq!(key.len(), 16);

        let mut message =
            MessageBuilder::new(Class::Request, Method::Allocate, TransactionId::random());
        message.add_attr(Software::new("mediaflow"));
        message.add_attr(Realm::new("example.org"));
        message.add_attr_with(
            MessageIntegritySha256,
            MessageIntegritySha256Key::new(&key),
        );

        let mut msg = Message::parse(message.finish()).unwrap();

        msg.attribute_with::<MessageIntegritySha256>(MessageIntegritySha256Key::new(&key))
            .unwrap()
            .unwrap();
    }

    #[test]
    fn attributes_after_integrity_are_ignored() {
        let mut message =
            MessageBuilder::new(Class::Request, Method::Binding, TransactionId::random());
        message.add_attr_with(MessageIntegrity, MessageIntegrityKey::new("pwd"));
        message.add_attr(Software::new("injected"));

        let mut msg = Message::parse(message.finish()).unwrap();
        assert!(msg.attribute::<Software>().is_none());
    }
}
