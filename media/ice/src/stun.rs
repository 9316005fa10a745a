use crate::candidate::Candidate;
use crate::{GatherError, IceConfig, IceCredentials, IceEvent};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use stun_types::attributes::{
    ErrorCode, Fingerprint, IceControlled, IceControlling, MessageIntegrity, MessageIntegrityKey,
    Priority, UseCandidate, Username, XorMappedAddress,
};
use stun_types::{Class, Message, MessageBuilder, Method, TransactionId};

pub(crate) const ROLE_CONFLICT: u32 = 487;

pub(crate) fn make_binding_request(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    remote_credentials: &IceCredentials,
    local_candidate: &Candidate,
    is_controlling: bool,
    control_tie_breaker: u64,
) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(Class::Request, Method::Binding, transaction_id);

    let username = format!("{}:{}", remote_credentials.ufrag, local_credentials.ufrag);
    stun_message.add_attr(Username::new(&username));
    stun_message.add_attr(Priority(local_candidate.priority));

    if is_controlling {
        stun_message.add_attr(IceControlling(control_tie_breaker));
        // aggressive nomination, the first pair to succeed is used
        stun_message.add_attr(UseCandidate);
    } else {
        stun_message.add_attr(IceControlled(control_tie_breaker));
    }

    stun_message.add_attr_with(
        MessageIntegrity,
        MessageIntegrityKey::new(&remote_credentials.pwd),
    );

    stun_message.add_attr(Fingerprint);

    stun_message.finish()
}

pub(crate) fn make_success_response(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    source: SocketAddr,
) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(Class::Success, Method::Binding, transaction_id);

    stun_message.add_attr(XorMappedAddress(source));
    stun_message.add_attr_with(
        MessageIntegrity,
        MessageIntegrityKey::new(&local_credentials.pwd),
    );

    stun_message.add_attr(Fingerprint);

    stun_message.finish()
}

pub(crate) fn make_role_error(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    source: SocketAddr,
    is_controlling: bool,
    control_tie_breaker: u64,
) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(Class::Error, Method::Binding, transaction_id);

    stun_message.add_attr(ErrorCode {
        number: ROLE_CONFLICT,
        reason: "Role Conflict",
    });

    if is_controlling {
        stun_message.add_attr(IceControlling(control_tie_breaker));
    } else {
        stun_message.add_attr(IceControlled(control_tie_breaker));
    }

    stun_message.add_attr(XorMappedAddress(source));
    stun_message.add_attr_with(
        MessageIntegrity,
        MessageIntegrityKey::new(&local_credentials.pwd),
    );
    stun_message.add_attr(Fingerprint);

    stun_message.finish()
}

/// Requests are protected with our password, responses with the peer's
pub(crate) fn verify_integrity(
    local_credentials: &IceCredentials,
    remote_credentials: &IceCredentials,
    stun_msg: &mut Message,
) -> bool {
    let is_request = match stun_msg.class() {
        Class::Request | Class::Indication => true,
        Class::Success | Class::Error => false,
    };

    let key = if is_request {
        &local_credentials.pwd
    } else {
        &remote_credentials.pwd
    };

    let passed_integrity_check = stun_msg
        .attribute_with::<MessageIntegrity>(MessageIntegrityKey::new(key))
        .is_some_and(|r| r.is_ok());

    if !passed_integrity_check {
        return false;
    }

    if is_request {
        // STUN requests require the USERNAME attribute to be set, validate that is contains the one we expect
        let expected_username = format!("{}:{}", local_credentials.ufrag, remote_credentials.ufrag);
        let username = match stun_msg.attribute::<Username>() {
            Some(Ok(username)) => username,
            Some(Err(e)) => {
                log::debug!("Failed to parse STUN username attribute, {e}");
                return false;
            }
            None => {
                log::debug!("STUN request is missing the USERNAME attribute");
                return false;
            }
        };

        if username.0 != expected_username {
            return false;
        }
    }

    true
}

/// Server reflexive candidate gathering against a single STUN server
pub(crate) struct StunServerBinding {
    server: SocketAddr,
    state: StunServerBindingState,
    /// XorMappedAddress from last STUN response
    last_mapped_addr: Option<SocketAddr>,
}

enum StunServerBindingState {
    /// Waiting to be polled to send their first request
    Waiting,
    /// Mid STUN transaction to create binding
    InProgress {
        transaction_id: TransactionId,
        stun_request: Vec<u8>,
        retransmit_at: Instant,
        retransmits: u32,
    },
    /// Waiting to refresh the binding
    WaitingForRefresh { refresh_at: Instant },
    /// Failed to reach the STUN server
    Failed,
}

impl StunServerBinding {
    pub(crate) fn new(server: SocketAddr) -> Self {
        Self {
            server,
            state: StunServerBindingState::Waiting,
            last_mapped_addr: None,
        }
    }

    pub(crate) fn server(&self) -> SocketAddr {
        self.server
    }

    /// Returns if the binding has either been completed or failed to complete
    pub(crate) fn is_completed(&self) -> bool {
        self.last_mapped_addr.is_some() || matches!(self.state, StunServerBindingState::Failed)
    }

    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        match &self.state {
            StunServerBindingState::Waiting => Some(Duration::ZERO),
            StunServerBindingState::InProgress { retransmit_at, .. } => {
                Some(retransmit_at.saturating_duration_since(now))
            }
            StunServerBindingState::WaitingForRefresh { refresh_at } => {
                Some(refresh_at.saturating_duration_since(now))
            }
            StunServerBindingState::Failed => None,
        }
    }

    pub(crate) fn poll(&mut self, now: Instant, config: &IceConfig, mut on_event: impl FnMut(IceEvent)) {
        match &mut self.state {
            StunServerBindingState::Waiting => self.start_binding_request(now, config, on_event),
            StunServerBindingState::InProgress {
                transaction_id: _,
                stun_request,
                retransmit_at,
                retransmits,
            } => {
                if *retransmit_at > now {
                    return;
                }

                if *retransmits >= config.max_retransmits {
                    log::debug!("STUN server {} did not respond", self.server);

                    self.state = StunServerBindingState::Failed;

                    // only the initial binding is reported, a failed refresh keeps the candidate
                    if self.last_mapped_addr.is_none() {
                        on_event(IceEvent::SourceFailed {
                            server: self.server,
                            error: GatherError::Timeout,
                        });
                    }

                    return;
                }

                *retransmits += 1;
                *retransmit_at += config.retransmit_delta(*retransmits);

                on_event(IceEvent::SendData {
                    data: stun_request.clone(),
                    source: None,
                    target: self.server,
                });
            }
            StunServerBindingState::WaitingForRefresh { refresh_at } => {
                if now >= *refresh_at {
                    self.start_binding_request(now, config, on_event);
                }
            }
            StunServerBindingState::Failed => {
                // nothing to do
            }
        }
    }

    fn start_binding_request(
        &mut self,
        now: Instant,
        config: &IceConfig,
        mut on_event: impl FnMut(IceEvent),
    ) {
        let transaction_id = TransactionId::random();

        let mut builder = MessageBuilder::new(Class::Request, Method::Binding, transaction_id);
        builder.add_attr(Fingerprint);

        let stun_request = builder.finish();

        on_event(IceEvent::SendData {
            data: stun_request.clone(),
            source: None,
            target: self.server,
        });

        self.state = StunServerBindingState::InProgress {
            transaction_id,
            stun_request,
            retransmit_at: now + config.retransmit_delta(0),
            retransmits: 0,
        };
    }

    pub(crate) fn wants_stun_response(&self, transaction_id: TransactionId) -> bool {
        matches!(&self.state, StunServerBindingState::InProgress { transaction_id: tsx_id, .. } if transaction_id == *tsx_id)
    }

    /// Receive a STUN success response
    ///
    /// Returns the address discovered through the STUN binding
    pub(crate) fn receive_stun_response(
        &mut self,
        now: Instant,
        config: &IceConfig,
        stun_msg: &mut Message,
    ) -> Option<SocketAddr> {
        let mapped = match stun_msg.attribute::<XorMappedAddress>() {
            Some(Ok(mapped)) => mapped.0,
            Some(Err(e)) => {
                log::debug!("Invalid XOR-MAPPED-ADDRESS in STUN server response, {e}");
                return None;
            }
            None => {
                log::debug!("STUN server response is missing XOR-MAPPED-ADDRESS");
                return None;
            }
        };

        self.state = StunServerBindingState::WaitingForRefresh {
            refresh_at: now + config.binding_refresh_interval,
        };
        self.last_mapped_addr = Some(mapped);

        Some(mapped)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn binding_times_out_after_retransmits() {
        let config = IceConfig::default();
        let server: SocketAddr = "192.0.2.10:3478".parse().unwrap();
        let mut binding = StunServerBinding::new(server);

        let mut now = Instant::now();
        let mut sent = 0;
        let mut failed = None;

        while !binding.is_completed() {
            binding.poll(now, &config, |event| match event {
                IceEvent::SendData { target, .. } => {
                    assert_eq!(target, server);
                    sent += 1;
                }
                IceEvent::SourceFailed { error, .. } => failed = Some(error),
                _ => panic!("unexpected event"),
            });

            if let Some(timeout) = binding.timeout(now) {
                now += timeout;
            }
        }

        assert_eq!(sent, 1 + config.max_retransmits);
        assert_eq!(failed, Some(GatherError::Timeout));
        assert!(binding.timeout(now).is_none());
    }

    #[test]
    fn binding_response_yields_mapped_address() {
        let config = IceConfig::default();
        let server: SocketAddr = "192.0.2.10:3478".parse().unwrap();
        let mapped: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        let mut binding = StunServerBinding::new(server);

        let now = Instant::now();
        let mut request = None;
        binding.poll(now, &config, |event| {
            if let IceEvent::SendData { data, .. } = event {
                request = Some(data);
            }
        });

        let request = Message::parse(request.unwrap()).unwrap();
        assert!(binding.wants_stun_response(request.transaction_id()));

        let mut response =
            MessageBuilder::new(Class::Success, Method::Binding, request.transaction_id());
        response.add_attr(XorMappedAddress(mapped));
        let mut response = Message::parse(response.finish()).unwrap();

        assert_eq!(
            binding.receive_stun_response(now, &config, &mut response),
            Some(mapped)
        );
        assert!(binding.is_completed());
        assert_eq!(binding.timeout(now), Some(config.binding_refresh_interval));
    }
}
