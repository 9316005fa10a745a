//! TLS client for TURN over TLS, driven through in-memory buffers

use bytes::{Buf, BytesMut};
use openssl::ssl::{ErrorCode, HandshakeError, MidHandshakeSslStream, Ssl, SslConnector, SslMethod, SslStream, SslVerifyMode};
use std::io::{self, Read, Write};
use std::mem::take;

#[derive(Debug, thiserror::Error)]
pub(crate) enum TlsError {
    #[error(transparent)]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Ssl(#[from] openssl::ssl::Error),
    #[error("tls handshake failed: {0}")]
    Handshake(String),
}

/// Bytes received from the network waiting to be read by openssl, and records openssl wants to send
#[derive(Default)]
pub(crate) struct StreamQueue {
    incoming: BytesMut,
    outgoing: Vec<u8>,
}

impl Read for StreamQueue {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let len = buf.len().min(self.incoming.len());
        buf[..len].copy_from_slice(&self.incoming[..len]);
        self.incoming.advance(len);

        Ok(len)
    }
}

impl Write for StreamQueue {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum State {
    Handshaking(MidHandshakeSslStream<StreamQueue>),
    Connected(SslStream<StreamQueue>),
    /// Only used while transitioning between states
    Poisoned,
}

pub(crate) struct TlsClient {
    state: State,
    /// Plaintext written before the handshake completed
    pending: Vec<u8>,
}

impl TlsClient {
    /// Start the handshake, the ClientHello is available through [`TlsClient::take_outgoing`] afterwards
    pub(crate) fn new(domain: Option<&str>) -> Result<Self, TlsError> {
        let mut connector = SslConnector::builder(SslMethod::tls_client())?;

        if domain.is_none() {
            connector.set_verify(SslVerifyMode::NONE);
        }

        let mut config = connector.build().configure()?;

        let ssl = match domain {
            Some(domain) => config.into_ssl(domain)?,
            None => {
                config.set_verify_hostname(false);
                config.set_use_server_name_indication(false);
                config.into_ssl("")?
            }
        };

        Self::from_ssl(ssl)
    }

    pub(crate) fn from_ssl(ssl: Ssl) -> Result<Self, TlsError> {
        let state = match ssl.connect(StreamQueue::default()) {
            Ok(stream) => State::Connected(stream),
            Err(HandshakeError::WouldBlock(mid)) => State::Handshaking(mid),
            Err(HandshakeError::SetupFailure(e)) => return Err(TlsError::OpenSsl(e)),
            Err(HandshakeError::Failure(mid)) => {
                return Err(TlsError::Handshake(mid.error().to_string()));
            }
        };

        Ok(Self {
            state,
            pending: vec![],
        })
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected(..))
    }

    /// Encrypt application data, buffering it until the handshake is complete
    pub(crate) fn write(&mut self, data: &[u8]) -> Result<(), TlsError> {
        match &mut self.state {
            State::Connected(stream) => {
                stream.ssl_write(data)?;
            }
            _ => self.pending.extend_from_slice(data),
        }

        Ok(())
    }

    /// Feed bytes received from the TCP stream, returns the decrypted application data
    pub(crate) fn receive(&mut self, data: &[u8]) -> Result<Vec<u8>, TlsError> {
        match &mut self.state {
            State::Handshaking(mid) => mid.get_mut().incoming.extend_from_slice(data),
            State::Connected(stream) => stream.get_mut().incoming.extend_from_slice(data),
            State::Poisoned => return Ok(vec![]),
        }

        if let State::Handshaking(..) = self.state {
            self.handshake()?;
        }

        let mut plaintext = vec![];

        if let State::Connected(stream) = &mut self.state {
            let mut buf = [0u8; 4096];

            loop {
                match stream.ssl_read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => plaintext.extend_from_slice(&buf[..n]),
                    Err(e) if e.code() == ErrorCode::WANT_READ => break,
                    Err(e) if e.code() == ErrorCode::ZERO_RETURN => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(plaintext)
    }

    fn handshake(&mut self) -> Result<(), TlsError> {
        let State::Handshaking(mid) = std::mem::replace(&mut self.state, State::Poisoned) else {
            return Ok(());
        };

        match mid.handshake() {
            Ok(mut stream) => {
                log::debug!("TLS handshake with TURN server completed");

                let pending = take(&mut self.pending);
                if !pending.is_empty() {
                    stream.ssl_write(&pending)?;
                }

                self.state = State::Connected(stream);
                Ok(())
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                self.state = State::Handshaking(mid);
                Ok(())
            }
            Err(HandshakeError::SetupFailure(e)) => Err(TlsError::OpenSsl(e)),
            Err(HandshakeError::Failure(mid)) => Err(TlsError::Handshake(mid.error().to_string())),
        }
    }

    /// Take the bytes that must be written to the TCP stream
    pub(crate) fn take_outgoing(&mut self) -> Vec<u8> {
        match &mut self.state {
            State::Handshaking(mid) => take(&mut mid.get_mut().outgoing),
            State::Connected(stream) => take(&mut stream.get_mut().outgoing),
            State::Poisoned => vec![],
        }
    }
}
