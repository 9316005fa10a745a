use openssl::{
    asn1::{Asn1Time, Asn1Type},
    bn::{BigNum, MsbOption},
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    ssl::{SslAcceptor, SslContext, SslMethod, SslVersion},
    x509::{X509, X509Name},
};
use crate::Error;
use sdp_types::{Fingerprint, FingerprintAlgorithm};
use std::sync::Arc;

pub(crate) const SRTP_PROFILE: &str = "SRTP_AES128_CM_SHA1_80";

/// Self certificate and key used for the DTLS handshake of every flow it is passed to
///
/// Generating the identity is expensive, it should be created once per process and cloned into flows.
/// The key material is released when the last clone is dropped.
#[derive(Clone)]
pub struct DtlsIdentity {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: SslContext,
    fingerprint: Vec<u8>,
}

impl DtlsIdentity {
    /// Create a new self-signed certificate and the DTLS context using it
    pub fn generate() -> Result<Self, Error> {
        let (cert, pkey) = make_self_cert()?;

        let mut ctx = SslAcceptor::mozilla_modern(SslMethod::dtls())?;
        ctx.set_tlsext_use_srtp(SRTP_PROFILE)?;
        ctx.set_min_proto_version(Some(SslVersion::DTLS1_2))?;
        ctx.set_private_key(&pkey)?;
        ctx.set_certificate(&cert)?;
        ctx.check_private_key()?;

        let fingerprint = cert.digest(MessageDigest::sha256())?.to_vec();

        log::debug!("generated DTLS identity");

        Ok(Self {
            inner: Arc::new(Inner {
                ctx: ctx.build().into_context(),
                fingerprint,
            }),
        })
    }

    pub(crate) fn context(&self) -> &SslContext {
        &self.inner.ctx
    }

    /// SHA-256 fingerprint of the certificate as announced in SDP
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            algorithm: FingerprintAlgorithm::SHA256,
            fingerprint: self.inner.fingerprint.clone(),
        }
    }
}

fn make_self_cert() -> Result<(X509, PKey<Private>), ErrorStack> {
    openssl::init();

    let rsa = Rsa::generate(2048)?;
    let pkey = PKey::from_rsa(rsa)?;

    let mut cert_builder = X509::builder()?;
    cert_builder.set_version(2)?;

    let serial_number = {
        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        serial.to_asn1_integer()?
    };
    cert_builder.set_serial_number(&serial_number)?;

    cert_builder.set_pubkey(&pkey)?;
    cert_builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    cert_builder.set_not_after(Asn1Time::days_from_now(30)?.as_ref())?;

    let mut name = X509Name::builder()?;
    name.append_entry_by_nid_with_type(Nid::COMMONNAME, "mediaflow", Asn1Type::UTF8STRING)?;
    let name = name.build();

    cert_builder.set_subject_name(&name)?;
    cert_builder.set_issuer_name(&name)?;

    cert_builder.sign(&pkey, MessageDigest::sha256())?;

    Ok((cert_builder.build(), pkey))
}

/// Map the SDP hash name to the digest used to verify the peer certificate
pub(crate) fn message_digest(algorithm: &FingerprintAlgorithm) -> Option<MessageDigest> {
    match algorithm {
        FingerprintAlgorithm::SHA1 => Some(MessageDigest::sha1()),
        FingerprintAlgorithm::SHA224 => Some(MessageDigest::sha224()),
        FingerprintAlgorithm::SHA256 => Some(MessageDigest::sha256()),
        FingerprintAlgorithm::SHA384 => Some(MessageDigest::sha384()),
        FingerprintAlgorithm::SHA512 => Some(MessageDigest::sha512()),
        FingerprintAlgorithm::MD5 => Some(MessageDigest::md5()),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fingerprint_is_sha256_of_certificate() {
        let identity = DtlsIdentity::generate().unwrap();
        let fingerprint = identity.fingerprint();

        assert_eq!(fingerprint.algorithm, FingerprintAlgorithm::SHA256);
        assert_eq!(fingerprint.fingerprint.len(), 32);

        let cert = identity.context().certificate().unwrap();
        assert_eq!(
            cert.digest(MessageDigest::sha256()).unwrap().to_vec(),
            fingerprint.fingerprint
        );

        // clones share the certificate
        assert_eq!(identity.clone().fingerprint(), fingerprint);
    }
}
