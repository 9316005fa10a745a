//! IO for a single [`Mediaflow`] using tokio
//!
//! [`TokioIo`] owns the UDP socket of a flow and the TCP streams to TURN servers. It is a companion to the
//! flow and not a wrapper, the flow stays accessible for the whole time.

use crate::{Mediaflow, MediaflowEvent};
use ice::ReceivedPkt;
use std::{
    collections::{HashMap, VecDeque},
    future::{Future, poll_fn},
    io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpStream, UdpSocket},
    time::{Sleep, sleep_until},
};

const RECV_BUFFER_SIZE: usize = 2500;
const QUEUE_MAX_SIZE: usize = 200;

type Connecting = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

enum StreamState {
    Connecting(Connecting),
    Connected(TcpStream),
}

/// Stream connection to a TURN server
struct Stream {
    state: StreamState,
    to_write: VecDeque<u8>,
}

/// IO implementation to be used alongside a [`Mediaflow`]
pub struct TokioIo {
    socket: UdpSocket,
    local_addr: SocketAddr,
    to_send: VecDeque<(Vec<u8>, SocketAddr)>,
    streams: HashMap<SocketAddr, Stream>,
    sleep: Option<Pin<Box<Sleep>>>,
    buf: Box<[u8; RECV_BUFFER_SIZE]>,
}

impl TokioIo {
    /// Bind the UDP socket of the flow
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            to_send: VecDeque::new(),
            streams: HashMap::new(),
            sleep: Some(Box::pin(sleep_until(Instant::now().into()))),
            buf: Box::new([0u8; RECV_BUFFER_SIZE]),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Add a host candidate for the bound address, or for every local interface if the socket is bound to
    /// the unspecified address
    pub fn add_host_candidates(&self, flow: &mut Mediaflow) -> Result<(), local_ip_address::Error> {
        if !self.local_addr.ip().is_unspecified() {
            flow.add_local_host_candidate(self.local_addr);
            return Ok(());
        }

        let ips: Vec<IpAddr> = local_ip_address::list_afinet_netifas()?
            .into_iter()
            .map(|(_, ip)| ip)
            .filter(|ip| ip.is_ipv4() == self.local_addr.is_ipv4())
            .collect();

        for ip in ips {
            flow.add_local_host_candidate(SocketAddr::new(ip, self.local_addr.port()));
        }

        Ok(())
    }

    /// Poll the flow until an event is available which is not about sending data
    ///
    /// This function is cancel safe.
    pub async fn poll_flow(&mut self, flow: &mut Mediaflow) -> io::Result<MediaflowEvent> {
        loop {
            while let Some(event) = flow.pop_event() {
                match event {
                    MediaflowEvent::SendData { data, target, .. } => {
                        self.to_send.push_back((data, target));
                    }
                    MediaflowEvent::SendStream { server, data } => self.send_stream(server, data),
                    event => return Ok(event),
                }
            }

            poll_fn(|cx| self.poll(cx, flow)).await?;
        }
    }

    fn send_stream(&mut self, server: SocketAddr, data: Vec<u8>) {
        let stream = self.streams.entry(server).or_insert_with(|| {
            log::debug!("Connecting to TURN server {server}");

            Stream {
                state: StreamState::Connecting(Box::pin(TcpStream::connect(server))),
                to_write: VecDeque::new(),
            }
        });

        stream.to_write.extend(data);
    }

    /// Poll the sockets and the flow
    ///
    /// Returns `Poll::Ready` when the flow has events to handle.
    pub fn poll(&mut self, cx: &mut Context<'_>, flow: &mut Mediaflow) -> Poll<io::Result<()>> {
        let now = Instant::now();

        let mut received = false;

        self.send_pending(cx);

        loop {
            let mut buf = ReadBuf::new(&mut self.buf[..]);

            match self.socket.poll_recv_from(cx, &mut buf) {
                Poll::Ready(Ok(source)) => {
                    flow.receive(
                        now,
                        ReceivedPkt {
                            data: buf.filled().to_vec(),
                            source,
                            destination: self.local_addr,
                        },
                    );

                    received = true;
                }
                // ICMP port unreachable of a previous send, not an error of the socket
                Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }

        received |= self.poll_streams(cx, now, flow);

        if self.to_send.len() >= QUEUE_MAX_SIZE {
            return Poll::Pending;
        }

        // Polled without IO being the reason, ignore sleep and poll the flow once
        if !received {
            flow.poll(now);
            self.update_sleep(flow, now);
        }

        while let Some(sleep) = &mut self.sleep
            && sleep.as_mut().poll(cx).is_ready()
        {
            flow.poll(now);
            self.update_sleep(flow, now);
        }

        if flow.has_events() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    fn send_pending(&mut self, cx: &mut Context<'_>) {
        while let Some((data, target)) = self.to_send.front() {
            match self.socket.poll_send_to(cx, data, *target) {
                Poll::Ready(Ok(_)) => {}
                Poll::Ready(Err(e)) => log::debug!("Failed to send datagram to {target}, {e}"),
                Poll::Pending => return,
            }

            self.to_send.pop_front();
        }
    }

    /// Drive the TURN stream connections, returns if data was received
    fn poll_streams(&mut self, cx: &mut Context<'_>, now: Instant, flow: &mut Mediaflow) -> bool {
        let mut received = false;
        let mut failed = vec![];

        for (server, stream) in &mut self.streams {
            match stream.poll(cx, &mut self.buf[..]) {
                Ok(data) => {
                    for data in data {
                        flow.receive_stream(now, *server, &data);
                        received = true;
                    }
                }
                Err(e) => {
                    log::debug!("Stream to TURN server {server} failed, {e}");
                    failed.push(*server);
                }
            }
        }

        for server in failed {
            self.streams.remove(&server);
            flow.stream_failed(now, server);
            received = true;
        }

        received
    }

    fn update_sleep(&mut self, flow: &Mediaflow, now: Instant) {
        match flow.timeout(now) {
            Some(duration) => {
                let deadline = tokio::time::Instant::from(now + duration);

                if let Some(sleep) = &mut self.sleep {
                    sleep.as_mut().reset(deadline);
                } else {
                    self.sleep = Some(Box::pin(sleep_until(deadline)));
                }
            }
            None => self.sleep = None,
        }
    }
}

impl Stream {
    /// Connect, write pending bytes and read everything available
    fn poll(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> io::Result<Vec<Vec<u8>>> {
        if let StreamState::Connecting(connecting) = &mut self.state {
            match connecting.as_mut().poll(cx) {
                Poll::Ready(result) => self.state = StreamState::Connected(result?),
                Poll::Pending => return Ok(vec![]),
            }
        }

        let StreamState::Connected(stream) = &mut self.state else {
            return Ok(vec![]);
        };

        while !self.to_write.is_empty() {
            let (front, _) = self.to_write.as_slices();

            match Pin::new(&mut *stream).poll_write(cx, front) {
                Poll::Ready(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Poll::Ready(Ok(n)) => {
                    self.to_write.drain(..n);
                }
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => break,
            }
        }

        let mut received = vec![];

        loop {
            let mut read_buf = ReadBuf::new(buf);

            match Pin::new(&mut *stream).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) if read_buf.filled().is_empty() => {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Poll::Ready(Ok(())) => received.push(read_buf.filled().to_vec()),
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => break,
            }
        }

        Ok(received)
    }
}
