use crate::identity::{DtlsIdentity, SRTP_PROFILE, message_digest};
use crate::srtp::{MASTER_KEY_LEN, MASTER_SALT_LEN, SrtpError, SrtpSession};
use foreign_types::ForeignTypeRef;
use openssl::ssl::{ErrorCode, Ssl, SslRef, SslStream, SslVerifyMode};
use sdp_types::Fingerprint;
use std::{
    cmp::min,
    collections::VecDeque,
    ffi::c_int,
    io::{self, Cursor, Read, Write},
    ptr,
    time::{Duration, Instant},
};

const MTU: u32 = 1200;

const INITIAL_RETRANSMIT: Duration = Duration::from_millis(500);
const MAX_RETRANSMIT: Duration = Duration::from_secs(4);
const MAX_RETRANSMITS: u32 = 8;

// DTLSv1_handle_timeout is a macro around SSL_ctrl, the safe API does not expose it
const DTLS_CTRL_HANDLE_TIMEOUT: c_int = 74;

#[derive(Debug, thiserror::Error)]
pub(crate) enum DtlsError {
    #[error("failed to create DTLS session: {0}")]
    Create(#[from] openssl::error::ErrorStack),
    #[error("DTLS handshake failed: {0}")]
    Handshake(#[from] openssl::ssl::Error),
    #[error("DTLS handshake timed out")]
    Timeout,
    #[error("peer certificate does not match the announced fingerprint")]
    FingerprintMismatch,
    #[error("peer did not negotiate {SRTP_PROFILE}")]
    MissingSrtpProfile,
    #[error("failed to create SRTP session: {0}")]
    Srtp(#[from] SrtpError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DtlsSetup {
    Accept,
    Connect,
}

enum DtlsState {
    Handshaking {
        retransmit_at: Instant,
        retransmits: u32,
    },
    Connected,
    /// The peer sent a close_notify or the session was shut down locally
    Closed,
    Failed,
}

/// SRTP contexts exported from a completed handshake
pub(crate) struct SrtpKeys {
    pub(crate) inbound: SrtpSession,
    pub(crate) outbound: SrtpSession,
}

/// DTLS endpoint of a flow, records are exchanged through [`receive`](DtlsSession::receive) and
/// [`pop_to_send`](DtlsSession::pop_to_send)
pub(crate) struct DtlsSession {
    stream: SslStream<IoQueue>,
    setup: DtlsSetup,
    state: DtlsState,
    /// OpenSSL completed the handshake, independent of the fingerprint verification
    handshake_done: bool,
    remote_fingerprint: Fingerprint,
    srtp: Option<SrtpKeys>,
    app_data: VecDeque<Vec<u8>>,
}

impl DtlsSession {
    pub(crate) fn new(
        now: Instant,
        identity: &DtlsIdentity,
        remote_fingerprint: Fingerprint,
        setup: DtlsSetup,
    ) -> Result<Self, DtlsError> {
        let mut ssl = Ssl::new(identity.context())?;
        ssl.set_mtu(MTU)?;

        // The certificate is self signed, it is checked against the fingerprint once the handshake completed
        ssl.set_verify_callback(
            SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
            |_preverify_ok, _x509_store| true,
        );

        let stream = SslStream::new(
            ssl,
            IoQueue {
                to_read: None,
                out: VecDeque::new(),
            },
        )?;

        let mut this = DtlsSession {
            stream,
            setup,
            state: DtlsState::Handshaking {
                retransmit_at: now + INITIAL_RETRANSMIT,
                retransmits: 0,
            },
            handshake_done: false,
            remote_fingerprint,
            srtp: None,
            app_data: VecDeque::new(),
        };

        // Put the ClientHello into the queue
        this.handshake()?;

        Ok(this)
    }

    pub(crate) fn setup(&self) -> DtlsSetup {
        self.setup
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(self.state, DtlsState::Connected)
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state, DtlsState::Closed)
    }

    /// Take the SRTP sessions after the handshake completed, returns `None` if they were already taken
    pub(crate) fn take_srtp(&mut self) -> Option<SrtpKeys> {
        self.srtp.take()
    }

    pub(crate) fn receive(&mut self, now: Instant, data: Vec<u8>) -> Result<(), DtlsError> {
        self.stream.get_mut().to_read = Some(Cursor::new(data));

        match self.state {
            DtlsState::Handshaking { .. } => {
                self.handshake()?;

                if let DtlsState::Handshaking { retransmits, .. } = self.state {
                    // Progress was made, restart the retransmit timer
                    self.state = DtlsState::Handshaking {
                        retransmit_at: now + retransmit_delta(retransmits),
                        retransmits,
                    };
                }

                // Application data may be pipelined right after the peer's last flight
                if self.is_connected() {
                    self.read_app_data()?;
                }
            }
            DtlsState::Connected => self.read_app_data()?,
            DtlsState::Closed | DtlsState::Failed => {}
        }

        self.stream.get_mut().to_read = None;

        Ok(())
    }

    fn handshake(&mut self) -> Result<(), DtlsError> {
        let result = match self.setup {
            DtlsSetup::Accept => self.stream.accept(),
            DtlsSetup::Connect => self.stream.connect(),
        };

        if let Err(e) = result {
            if e.code() == ErrorCode::WANT_READ {
                return Ok(());
            }

            self.state = DtlsState::Failed;
            return Err(DtlsError::Handshake(e));
        }

        self.handshake_done = true;

        match self.on_connected() {
            Ok(srtp) => {
                log::debug!("DTLS handshake completed as {:?}", self.setup);

                self.srtp = Some(srtp);
                self.state = DtlsState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = DtlsState::Failed;
                Err(e)
            }
        }
    }

    fn on_connected(&self) -> Result<SrtpKeys, DtlsError> {
        let ssl = self.stream.ssl();

        verify_fingerprint(ssl, &self.remote_fingerprint)?;

        match ssl.selected_srtp_profile() {
            Some(profile) if profile.name() == SRTP_PROFILE => {}
            _ => return Err(DtlsError::MissingSrtpProfile),
        }

        let mut material = [0u8; (MASTER_KEY_LEN + MASTER_SALT_LEN) * 2];
        ssl.export_keying_material(&mut material, "EXTRACTOR-dtls_srtp", None)?;

        // client_key | server_key | client_salt | server_salt
        let (keys, salts) = material.split_at(MASTER_KEY_LEN * 2);
        let (client_key, server_key) = keys.split_at(MASTER_KEY_LEN);
        let (client_salt, server_salt) = salts.split_at(MASTER_SALT_LEN);

        let client = || SrtpSession::new(client_key, client_salt);
        let server = || SrtpSession::new(server_key, server_salt);

        let keys = match self.setup {
            DtlsSetup::Accept => SrtpKeys {
                inbound: client()?,
                outbound: server()?,
            },
            DtlsSetup::Connect => SrtpKeys {
                inbound: server()?,
                outbound: client()?,
            },
        };

        Ok(keys)
    }

    fn read_app_data(&mut self) -> Result<(), DtlsError> {
        let mut buf = vec![0u8; 65535];

        loop {
            match self.stream.ssl_read(&mut buf) {
                Ok(0) => break,
                Ok(len) => self.app_data.push_back(buf[..len].to_vec()),
                Err(e) if e.code() == ErrorCode::WANT_READ => break,
                Err(e) if e.code() == ErrorCode::ZERO_RETURN => {
                    log::debug!("DTLS peer closed the session");
                    self.state = DtlsState::Closed;
                    break;
                }
                Err(e) => {
                    self.state = DtlsState::Failed;
                    return Err(DtlsError::Handshake(e));
                }
            }
        }

        Ok(())
    }

    /// Send application data, only valid after the handshake completed
    pub(crate) fn send(&mut self, data: &[u8]) -> Result<(), DtlsError> {
        debug_assert!(self.is_connected());

        self.stream.ssl_write(data)?;
        Ok(())
    }

    pub(crate) fn pop_app_data(&mut self) -> Option<Vec<u8>> {
        self.app_data.pop_front()
    }

    pub(crate) fn pop_to_send(&mut self) -> Option<Vec<u8>> {
        self.stream.get_mut().out.pop_front()
    }

    /// Send a close_notify to the peer
    ///
    /// This also works after a failed fingerprint verification, the handshake itself completed in that case.
    pub(crate) fn close(&mut self) {
        if !self.is_closed() && self.handshake_done {
            if let Err(e) = self.stream.shutdown() {
                log::debug!("Failed to shutdown DTLS session, {e}");
            }
        }

        self.state = DtlsState::Closed;
    }

    pub(crate) fn poll(&mut self, now: Instant) -> Result<(), DtlsError> {
        let DtlsState::Handshaking {
            retransmit_at,
            retransmits,
        } = self.state
        else {
            return Ok(());
        };

        if now < retransmit_at {
            return Ok(());
        }

        if retransmits >= MAX_RETRANSMITS {
            log::debug!("DTLS handshake timed out after {retransmits} retransmits");
            self.state = DtlsState::Failed;
            return Err(DtlsError::Timeout);
        }

        handle_timeout(self.stream.ssl());
        self.handshake()?;

        if let DtlsState::Handshaking { .. } = self.state {
            self.state = DtlsState::Handshaking {
                retransmit_at: now + retransmit_delta(retransmits + 1),
                retransmits: retransmits + 1,
            };
        }

        Ok(())
    }

    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        match self.state {
            DtlsState::Handshaking { retransmit_at, .. } => {
                Some(retransmit_at.saturating_duration_since(now))
            }
            DtlsState::Connected | DtlsState::Closed | DtlsState::Failed => None,
        }
    }
}

fn retransmit_delta(retransmits: u32) -> Duration {
    min(INITIAL_RETRANSMIT * (1 << retransmits.min(8)), MAX_RETRANSMIT)
}

fn verify_fingerprint(ssl: &SslRef, expected: &Fingerprint) -> Result<(), DtlsError> {
    let certificate = ssl
        .peer_certificate()
        .ok_or(DtlsError::FingerprintMismatch)?;

    let digest = message_digest(&expected.algorithm).ok_or(DtlsError::FingerprintMismatch)?;
    let actual = certificate.digest(digest)?;

    if actual.as_ref() == expected.fingerprint.as_slice() {
        Ok(())
    } else {
        Err(DtlsError::FingerprintMismatch)
    }
}

/// Retransmit the last flight if OpenSSL's own timer expired
fn handle_timeout(ssl: &SslRef) {
    // SAFETY: the pointer is valid for the lifetime of the reference, the ctrl does not take ownership
    unsafe {
        openssl_sys::SSL_ctrl(ssl.as_ptr(), DTLS_CTRL_HANDLE_TIMEOUT, 0, ptr::null_mut());
    }
}

struct IoQueue {
    to_read: Option<Cursor<Vec<u8>>>,
    out: VecDeque<Vec<u8>>,
}

impl Read for IoQueue {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(to_read) = &mut self.to_read else {
            return Err(io::ErrorKind::WouldBlock.into());
        };

        let result = to_read.read(buf)?;

        let position = usize::try_from(to_read.position()).expect("position must fit into usize");

        if position == to_read.get_ref().len() {
            self.to_read = None;
        }

        Ok(result)
    }
}

impl Write for IoQueue {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
