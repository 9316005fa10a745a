use crate::TurnServer;
use stun_types::attributes::{
    MessageIntegrity, MessageIntegrityKey, Nonce, Realm, Username, long_term_password_md5,
};
use stun_types::{Message, MessageBuilder};

/// TURN long-term credentials, established after the server challenged the first request
///
/// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-9.2)
pub(crate) struct LongTermAuth {
    username: String,
    realm: String,
    nonce: Vec<u8>,
    key: Vec<u8>,
}

impl LongTermAuth {
    /// Read REALM & NONCE from a 401 response
    pub(crate) fn from_challenge(server: &TurnServer, msg: &mut Message) -> Option<Self> {
        let realm = match msg.attribute::<Realm>()? {
            Ok(realm) => realm.0.to_string(),
            Err(e) => {
                log::warn!("TURN server sent invalid REALM, {e}");
                return None;
            }
        };

        let nonce = msg.attribute::<Nonce>()?.ok()?.0.to_vec();

        Some(Self {
            key: long_term_password_md5(&server.username, &realm, &server.password),
            username: server.username.clone(),
            realm,
            nonce,
        })
    }

    /// Take REALM & NONCE of a later 401 or 438 response, returns false if neither changed
    ///
    /// An unchanged challenge means the server rejected the credentials themselves.
    pub(crate) fn rechallenge(&mut self, server: &TurnServer, msg: &mut Message) -> bool {
        let nonce = match msg.attribute::<Nonce>() {
            Some(Ok(nonce)) => nonce.0.to_vec(),
            _ => return false,
        };

        let realm = match msg.attribute::<Realm>() {
            Some(Ok(realm)) => realm.0.to_string(),
            _ => self.realm.clone(),
        };

        if nonce == self.nonce && realm == self.realm {
            return false;
        }

        if realm != self.realm {
            self.key = long_term_password_md5(&server.username, &realm, &server.password);
            self.realm = realm;
        }

        self.nonce = nonce;
        true
    }

    /// Append USERNAME, REALM, NONCE and MESSAGE-INTEGRITY, must be the last attributes of a request
    pub(crate) fn authenticate(&self, builder: &mut MessageBuilder) {
        builder.add_attr(Username::new(&self.username));
        builder.add_attr(Realm::new(&self.realm));
        builder.add_attr(Nonce::new(&self.nonce));
        builder.add_attr_with(MessageIntegrity, MessageIntegrityKey::new(&self.key));
    }

    /// Responses without MESSAGE-INTEGRITY are accepted, a wrong one is not
    pub(crate) fn verify(&self, msg: &mut Message) -> bool {
        match msg.attribute_with::<MessageIntegrity>(MessageIntegrityKey::new(&self.key)) {
            None => true,
            Some(result) => result.is_ok(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::TurnTransport;
    use stun_types::attributes::{ErrorCode, Software};
    use stun_types::{Class, Method, TransactionId};

    #[test]
    fn challenge_and_authenticate() {
        let server = TurnServer::new(
            "192.0.2.1:3478".parse().unwrap(),
            TurnTransport::Udp,
            "user",
            "secret",
        );

        let mut challenge =
            MessageBuilder::new(Class::Error, Method::Allocate, TransactionId::random());
        challenge.add_attr(ErrorCode {
            number: ErrorCode::UNAUTHORIZED,
            reason: "Unauthorized",
        });
        challenge.add_attr(Realm::new("example.org"));
        challenge.add_attr(Nonce::new(b"abcdef"));
        let mut challenge = Message::parse(challenge.finish()).unwrap();

        let auth = LongTermAuth::from_challenge(&server, &mut challenge).unwrap();

        let mut request =
            MessageBuilder::new(Class::Request, Method::Allocate, TransactionId::random());
        request.add_attr(Software::new("mediaflow"));
        auth.authenticate(&mut request);
        let mut request = Message::parse(request.finish()).unwrap();

        // the server computes the same key from its own user database
        let key = long_term_password_md5("user", "example.org", "secret");
        request
            .attribute_with::<MessageIntegrity>(MessageIntegrityKey::new(&key))
            .unwrap()
            .unwrap();

        assert_eq!(request.attribute::<Nonce>().unwrap().unwrap().0, b"abcdef");
        assert!(auth.verify(&mut request));
    }

    #[test]
    fn rechallenge_takes_new_realm_and_nonce() {
        let server = TurnServer::new(
            "192.0.2.1:3478".parse().unwrap(),
            TurnTransport::Udp,
            "user",
            "secret",
        );

        let challenge = |realm: &str, nonce: &[u8]| {
            let mut challenge =
                MessageBuilder::new(Class::Error, Method::Refresh, TransactionId::random());
            challenge.add_attr(Realm::new(realm));
            challenge.add_attr(Nonce::new(nonce));
            Message::parse(challenge.finish()).unwrap()
        };

        let mut auth = LongTermAuth::from_challenge(&server, &mut challenge("a.org", b"1")).unwrap();

        assert!(!auth.rechallenge(&server, &mut challenge("a.org", b"1")));
        assert!(auth.rechallenge(&server, &mut challenge("b.org", b"2")));

        let mut request =
            MessageBuilder::new(Class::Request, Method::Refresh, TransactionId::random());
        auth.authenticate(&mut request);
        let mut request = Message::parse(request.finish()).unwrap();

        let key = long_term_password_md5("user", "b.org", "secret");
        request
            .attribute_with::<MessageIntegrity>(MessageIntegrityKey::new(&key))
            .unwrap()
            .unwrap();
        assert_eq!(request.attribute::<Nonce>().unwrap().unwrap().0, b"2");
    }

    #[test]
    fn challenge_without_nonce_is_ignored() {
        let server = TurnServer::new(
            "192.0.2.1:3478".parse().unwrap(),
            TurnTransport::Udp,
            "user",
            "secret",
        );

        let mut challenge =
            MessageBuilder::new(Class::Error, Method::Allocate, TransactionId::random());
        challenge.add_attr(Realm::new("example.org"));
        let mut challenge = Message::parse(challenge.finish()).unwrap();

        assert!(LongTermAuth::from_challenge(&server, &mut challenge).is_none());
    }
}
