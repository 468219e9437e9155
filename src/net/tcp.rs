//! The plain transport: framing-agnostic bytes over a non-blocking TCP socket.

use std::{
    io::ErrorKind,
    net::{Shutdown, SocketAddr},
    sync::Arc,
    time::Duration,
};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::{
    format_address,
    selector::{self, PeekResult, Readiness, WaitBudget},
    AddressForm, NetIo, SharedKeepAlive, Transport, READ_CHUNK,
};
use crate::{
    config::{KeepAliveConfig, RpcConfig},
    error::{Direction, DuplexError, Error},
};

/// The buffer size assumed when the socket won't tell.
pub const DEFAULT_SOCKET_BUFFER: usize = 4096;

fn apply_fudge(reported: usize, percent: usize) -> usize {
    match cfg!(target_os = "linux") {
        true => reported * percent / 100,
        false => reported,
    }
}

fn configure_keepalive(stream: &TcpStream, config: &KeepAliveConfig) {
    let sock = SockRef::from(stream);

    let result = match config.enabled {
        false => sock.set_keepalive(false),
        true => {
            let mut keepalive = TcpKeepalive::new();
            if let Some(idle) = config.idle {
                keepalive = keepalive.with_time(idle);
            }

            #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd", windows))]
            if let Some(interval) = config.interval {
                keepalive = keepalive.with_interval(interval);
            }

            sock.set_tcp_keepalive(&keepalive)
        }
    };

    if let Err(error) = result {
        debug!(%error, "Could not configure TCP keepalive");
    }
}

pub struct TcpTransport {
    stream: Option<TcpStream>,
    accepted: bool,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    requested_host: String,
    max_wait: Option<Duration>,
    close_max_wait: Duration,
    keepalive: Option<SharedKeepAlive>,
    fudge_percent: usize,

    /// Whether the last thing that happened on the socket was a read. If so, the peer is
    /// probably about to close and we wait for its FIN so we don't end up in TIME_WAIT.
    last_read: bool,
    shutdown_called: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, accepted: bool, requested_host: impl Into<String>, config: &RpcConfig) -> Self {
        if let Err(error) = stream.set_nodelay(true) {
            debug!(%error, "Could not set TCP_NODELAY");
        }

        configure_keepalive(&stream, &config.keepalive);

        Self {
            local_addr: stream.local_addr().ok(),
            peer_addr: stream.peer_addr().ok(),
            stream: Some(stream),
            accepted,
            requested_host: requested_host.into(),
            max_wait: config.max_wait,
            close_max_wait: config.close_max_wait,
            keepalive: None,
            fudge_percent: config.buffer_fudge_percent,
            last_read: false,
            shutdown_called: false,
        }
    }

    pub(crate) fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    pub(crate) fn max_wait(&self) -> Option<Duration> {
        self.max_wait
    }

    pub(crate) fn keepalive(&self) -> Option<&SharedKeepAlive> {
        self.keepalive.as_ref()
    }

    pub(crate) fn set_last_read(&mut self, last_read: bool) {
        self.last_read = last_read;
    }

    pub fn requested_host(&self) -> &str {
        &self.requested_host
    }

    /// Whether the liveness callback asks us to stop.
    pub(crate) fn is_broken(&self) -> bool {
        self.keepalive.as_ref().is_some_and(|k| !k.is_alive())
    }

    fn buffering(&self, send: bool) -> usize {
        let Some(stream) = &self.stream else {
            return DEFAULT_SOCKET_BUFFER;
        };

        let sock = SockRef::from(stream);
        let reported = match send {
            true => sock.send_buffer_size(),
            false => sock.recv_buffer_size(),
        };

        match reported {
            Ok(size) if size > 0 => apply_fudge(size, self.fudge_percent).max(1),
            _ => DEFAULT_SOCKET_BUFFER,
        }
    }

    /// Waits, bounded by the close max-wait, for the peer to half-close its side.
    async fn drain_eof(&self, stream: &TcpStream) {
        let ready = selector::select(stream, Readiness::new(true, false), Some(self.close_max_wait)).await;
        if matches!(ready, Ok(r) if r.read) {
            let mut buf = [0u8; 1];
            let _ = stream.try_read(&mut buf);
        }
    }
}

impl Transport for TcpTransport {
    async fn send_or_receive(&mut self, io: &mut NetIo<'_>, errors: &mut DuplexError) -> bool {
        let budget = WaitBudget::new(self.max_wait, self.keepalive.as_ref());

        loop {
            let do_write = !io.send.is_empty() && errors.send.is_none();
            let do_read = io.recv_room > 0 && !io.eof && errors.recv.is_none();
            if !do_write && !do_read {
                return false;
            }

            let Some(stream) = self.stream.as_ref() else {
                if do_write {
                    errors.set_send(Error::NotConnected);
                }
                errors.set_recv(Error::NotConnected);
                return false;
            };

            let ready = match selector::select(stream, Readiness::new(do_read, do_write), budget.next_slice()).await {
                Ok(ready) => ready,
                Err(error) => {
                    let error = Error::Select(Arc::new(error));
                    if do_write {
                        errors.set_send(error.clone());
                    }
                    errors.set_recv(error);
                    return false;
                }
            };

            if !ready.any() {
                if budget.expired() {
                    self.last_read = false;
                    let direction = match do_write {
                        true => Direction::Send,
                        false => Direction::Receive,
                    };
                    let error = Error::MaxWait {
                        direction,
                        millis: budget.millis(),
                    };

                    if do_write {
                        errors.set_send(error.clone());
                    }
                    errors.set_recv(error);
                    return false;
                }

                if self.is_broken() {
                    self.last_read = false;
                    if do_write {
                        errors.set_send(Error::Break);
                    }
                    errors.set_recv(Error::Break);
                    return false;
                }

                continue;
            }

            let mut progress = false;

            if ready.write {
                match stream.try_write(io.send) {
                    Ok(len) => {
                        trace!("TCP sent {len} bytes");
                        io.send = &io.send[len..];
                        self.last_read = false;
                        progress = true;
                    }
                    Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                    Err(error) => errors.set_send(Error::TcpSend(Arc::new(error))),
                }
            }

            if ready.read {
                let start = io.recv.len();
                let room = io.recv_room.min(READ_CHUNK);
                io.recv.resize(start + room, 0);

                match stream.try_read(&mut io.recv[start..]) {
                    Ok(0) => {
                        io.recv.truncate(start);
                        trace!("TCP peer closed its side");
                        io.eof = true;
                        progress = true;
                    }
                    Ok(len) => {
                        io.recv.truncate(start + len);
                        trace!("TCP received {len} bytes");
                        io.recv_room -= len;
                        self.last_read = true;
                        progress = true;
                    }
                    Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                        io.recv.truncate(start);
                    }
                    Err(error) => {
                        io.recv.truncate(start);
                        errors.set_recv(Error::TcpRecv(Arc::new(error)));
                    }
                }
            }

            if progress {
                return true;
            }
        }
    }

    async fn close(&mut self) -> bool {
        let Some(stream) = &self.stream else {
            return false;
        };

        debug!(
            "TCP closing {} <-> {}, last_read={}",
            format_address(self.local_addr, "", AddressForm::IpPort),
            format_address(self.peer_addr, "", AddressForm::IpPort),
            self.last_read,
        );

        if self.last_read {
            self.drain_eof(stream).await;
        }

        self.shutdown();
        self.stream = None;
        true
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn shutdown(&mut self) {
        // The connecting side initiates the shutdown, so TIME_WAIT lands on it.
        if self.shutdown_called || self.accepted {
            return;
        }

        if let Some(stream) = &self.stream {
            self.shutdown_called = true;
            if let Err(error) = SockRef::from(stream).shutdown(Shutdown::Write) {
                debug!(%error, "TCP shutdown failed");
            }
        }
    }

    async fn client_mismatch(&mut self) -> Result<(), Error> {
        if !self.accepted {
            return Ok(());
        }

        let Some(stream) = &self.stream else {
            return Ok(());
        };

        match selector::check_for_handshake(stream).await {
            Ok(PeekResult::Tls) => {
                warn!(peer = %self.peer_address(AddressForm::IpPort), "Plaintext listener received a TLS handshake");
                self.close().await;
                Err(Error::TcpPeerSsl)
            }
            Ok(_) => Ok(()),
            Err(error) => Err(Error::Accept(Arc::new(error))),
        }
    }

    async fn is_alive(&self) -> bool {
        let Some(stream) = &self.stream else {
            return false;
        };

        let mut buf = [0u8; 1];
        match selector::peek(stream, &mut buf, Duration::ZERO).await {
            Ok(None) => true,
            Ok(Some(len)) => len != 0,
            Err(_) => false,
        }
    }

    fn address(&self, form: AddressForm) -> String {
        format_address(self.local_addr, "", form)
    }

    fn peer_address(&self, form: AddressForm) -> String {
        format_address(self.peer_addr, &self.requested_host, form)
    }

    fn send_buffering(&self) -> usize {
        self.buffering(true)
    }

    fn recv_buffering(&self) -> usize {
        self.buffering(false)
    }

    fn set_buffer_sizes(&mut self, send: usize, recv: usize) {
        let Some(stream) = &self.stream else {
            return;
        };

        let sock = SockRef::from(stream);
        if sock.send_buffer_size().is_ok_and(|current| current < send) {
            if let Err(error) = sock.set_send_buffer_size(send) {
                debug!(%error, "Could not grow the send buffer to {send}");
            }
        }

        if sock.recv_buffer_size().is_ok_and(|current| current < recv) {
            if let Err(error) = sock.set_recv_buffer_size(recv) {
                debug!(%error, "Could not grow the receive buffer to {recv}");
            }
        }
    }

    fn set_max_wait(&mut self, max_wait: Option<Duration>) {
        self.max_wait = max_wait;
    }

    fn set_break(&mut self, keepalive: Option<SharedKeepAlive>) {
        self.keepalive = keepalive;
    }

    fn is_accepted(&self) -> bool {
        self.accepted
    }
}
