use super::{ATTRIBUTE_HEADER_LEN, Attribute, fixed_value};
use crate::Error;
use crate::builder::MessageBuilder;
use crate::header::STUN_HEADER_LENGTH;
use crate::parse::{AttrSpan, Message};
use bytes::BufMut;

const FINGERPRINT_XOR: u32 = 0x5354554e;

/// Reflected CRC-32 (ISO-HDLC) lookup table
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;

    while i < 256 {
        let mut c = i as u32;
        let mut bit = 0;

        while bit < 8 {
            c = if c & 1 == 1 {
                0xedb88320 ^ (c >> 1)
            } else {
                c >> 1
            };
            bit += 1;
        }

        table[i] = c;
        i += 1;
    }

    table
};

fn crc32(buf: &[u8]) -> u32 {
    !buf.iter().fold(!0u32, |c, &b| {
        CRC32_TABLE[((c ^ u32::from(b)) & 0xff) as usize] ^ (c >> 8)
    })
}

/// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.7)
pub struct Fingerprint;

impl Attribute<'_> for Fingerprint {
    type Context = ();
    const TYPE: u16 = 0x8028;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        let len = u16::try_from(attr.padding_end - STUN_HEADER_LENGTH)?;

        msg.with_msg_len(len, |msg| {
            let received =
                u32::from_be_bytes(fixed_value(msg, attr, "fingerprint value must be 4 bytes")?);

            let covered = &msg.buffer()[..attr.begin - ATTRIBUTE_HEADER_LEN];

            if crc32(covered) ^ FINGERPRINT_XOR != received {
                return Err(Error::InvalidData("failed to verify message fingerprint"));
            }

            Ok(Self)
        })
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        // type & length of the attribute are already written
        let len = builder.buffer().len() + 4 - STUN_HEADER_LENGTH;

        builder.set_len(
            len.try_into()
                .expect("stun messages must fit within 65535 bytes"),
        );

        let data = builder.buffer();
        let crc = crc32(&data[..data.len() - ATTRIBUTE_HEADER_LEN]) ^ FINGERPRINT_XOR;

        builder.buffer().put_u32(crc);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(4)
    }
}
