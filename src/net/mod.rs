//! Byte-stream transports with non-blocking semantics.
//!
//! Every transport is driven through a single primitive, [`Transport::send_or_receive`], which
//! moves bytes in either or both directions at once. Both directions are serviced together so
//! that a peer pushing data at us while we push data at it can never deadlock on full socket
//! buffers. Each call is bounded by the configured max-wait and by the liveness callback.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use crate::error::{DuplexError, Error};

pub mod address;
pub mod credentials;
pub mod endpoint;
pub mod handshake;
pub mod selector;
pub mod ssl;
pub mod tcp;
pub mod tls;

use credentials::PeerCredentials;
use ssl::SslTransport;
use tcp::TcpTransport;

/// The largest amount of bytes read from a socket in one go.
pub const READ_CHUNK: usize = 0x10000;

/// Lets an embedding application cancel in-flight operations.
///
/// The callback is re-checked every time a transport wakes up from a readiness wait with nothing
/// to do. Returning `false` aborts the operation with [`Error::Break`].
pub trait KeepAlive {
    fn is_alive(&self) -> bool;

    /// How often, in milliseconds, [`KeepAlive::is_alive`] should be polled while waiting.
    fn poll_ms(&self) -> Option<u64> {
        None
    }
}

impl<F: Fn() -> bool> KeepAlive for F {
    fn is_alive(&self) -> bool {
        self()
    }
}

pub type SharedKeepAlive = Arc<dyn KeepAlive + Send + Sync>;

/// Which form of an address to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressForm {
    /// The numeric IP address.
    Ip,

    /// The numeric IP address with the port, e.g. `10.0.0.1:1666` or `[::1]:1666`.
    IpPort,

    /// The host name as it was requested when connecting, falling back to the IP address.
    Host,

    /// Like [`AddressForm::Host`], with the port.
    HostPort,
}

/// Formats a socket address in the requested form.
pub fn format_address(addr: Option<SocketAddr>, requested_host: &str, form: AddressForm) -> String {
    let Some(addr) = addr else {
        return String::new();
    };

    let host_given = !requested_host.is_empty();
    match form {
        AddressForm::Ip => addr.ip().to_string(),
        AddressForm::IpPort => addr.to_string(),
        AddressForm::Host if host_given => requested_host.to_string(),
        AddressForm::Host => addr.ip().to_string(),
        AddressForm::HostPort if host_given && requested_host.contains(':') => format!("[{requested_host}]:{}", addr.port()),
        AddressForm::HostPort if host_given => format!("{requested_host}:{}", addr.port()),
        AddressForm::HostPort => addr.to_string(),
    }
}

/// The buffers a single [`Transport::send_or_receive`] call works on.
///
/// Bytes written are consumed from the front of `send`. Bytes read are appended to `recv`, at most
/// `recv_room` of them, and `recv_room` is decreased accordingly.
#[derive(Debug)]
pub struct NetIo<'a> {
    pub send: &'a [u8],
    pub recv: &'a mut Vec<u8>,
    pub recv_room: usize,

    /// Set when the peer has closed its sending side.
    pub eof: bool,
}

impl<'a> NetIo<'a> {
    pub fn new(send: &'a [u8], recv: &'a mut Vec<u8>, recv_room: usize) -> Self {
        Self {
            send,
            recv,
            recv_room,
            eof: false,
        }
    }
}

/// A bidirectional byte stream with non-blocking semantics.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Writes from `io.send` and reads into `io.recv`, whichever is possible first, waiting at
    /// most the configured max-wait. Returns whether any bytes moved. Errors are recorded in
    /// `errors`, in the slot of the direction that failed.
    async fn send_or_receive(&mut self, io: &mut NetIo<'_>, errors: &mut DuplexError) -> bool;

    /// Writes all of `buf`.
    async fn send(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut scratch = Vec::new();
        let mut io = NetIo::new(buf, &mut scratch, 0);
        let mut errors = DuplexError::new();

        while !io.send.is_empty() {
            if !self.send_or_receive(&mut io, &mut errors).await {
                errors.to_result()?;
                return Err(Error::Closed);
            }
        }

        Ok(())
    }

    /// Reads at most `max` bytes, appending them to `buf`. Returns 0 if the peer closed the
    /// connection.
    async fn receive(&mut self, buf: &mut Vec<u8>, max: usize) -> Result<usize, Error> {
        let before = buf.len();
        let mut io = NetIo::new(&[], buf, max);
        let mut errors = DuplexError::new();

        while io.recv.len() == before && !io.eof {
            if !self.send_or_receive(&mut io, &mut errors).await {
                errors.to_result()?;
                break;
            }
        }

        Ok(io.recv.len() - before)
    }

    /// Sends the TLS close notification if there is one, shuts down the write side and waits,
    /// bounded, for the peer's own half-close. Returns whether this call tore the socket down;
    /// later calls do nothing.
    async fn close(&mut self) -> bool;

    fn is_closed(&self) -> bool;

    /// Shuts down the write side of the connection, if this side initiated it.
    fn shutdown(&mut self);

    /// Peeks at the first bytes sent by the peer to detect a plaintext client talking to a TLS
    /// server, or the other way around. The connection is closed when a mismatch is found.
    async fn client_mismatch(&mut self) -> Result<(), Error>;

    /// Completes the TLS handshake if it hasn't been done yet.
    async fn do_handshake(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Whether the peer is still connected, checked without consuming any data.
    async fn is_alive(&self) -> bool;

    fn address(&self, form: AddressForm) -> String;

    fn peer_address(&self, form: AddressForm) -> String;

    /// How many bytes the socket can hold in flight when sending.
    fn send_buffering(&self) -> usize;

    /// How many bytes the socket can hold when receiving.
    fn recv_buffering(&self) -> usize;

    /// Grows the socket buffers toward the given sizes. Sizes smaller than the current ones are
    /// ignored.
    fn set_buffer_sizes(&mut self, send: usize, recv: usize);

    /// Whether the reverse direction can take more data without risking a deadlock.
    fn duplex_ready(&self) -> bool {
        true
    }

    fn set_max_wait(&mut self, max_wait: Option<Duration>);

    fn set_break(&mut self, keepalive: Option<SharedKeepAlive>);

    fn is_ssl(&self) -> bool {
        false
    }

    fn is_accepted(&self) -> bool;

    /// The negotiated protocol version and cipher suite, for secure transports.
    fn encryption_type(&self) -> Option<String> {
        None
    }

    fn peer_credentials(&self) -> Option<&dyn PeerCredentials> {
        None
    }

    fn peer_fingerprint(&self) -> Option<&str> {
        self.peer_credentials().map(|c| c.fingerprint())
    }
}

/// Either kind of transport, as produced by an endpoint.
pub enum NetTransport {
    Tcp(TcpTransport),
    Ssl(Box<SslTransport>),
}

macro_rules! delegate {
    ($self:ident, $t:ident => $e:expr) => {
        match $self {
            NetTransport::Tcp($t) => $e,
            NetTransport::Ssl($t) => $e,
        }
    };
}

impl Transport for NetTransport {
    async fn send_or_receive(&mut self, io: &mut NetIo<'_>, errors: &mut DuplexError) -> bool {
        delegate!(self, t => t.send_or_receive(io, errors).await)
    }

    async fn close(&mut self) -> bool {
        delegate!(self, t => t.close().await)
    }

    fn is_closed(&self) -> bool {
        delegate!(self, t => t.is_closed())
    }

    fn shutdown(&mut self) {
        delegate!(self, t => t.shutdown())
    }

    async fn client_mismatch(&mut self) -> Result<(), Error> {
        delegate!(self, t => t.client_mismatch().await)
    }

    async fn do_handshake(&mut self) -> Result<(), Error> {
        delegate!(self, t => t.do_handshake().await)
    }

    async fn is_alive(&self) -> bool {
        delegate!(self, t => t.is_alive().await)
    }

    fn address(&self, form: AddressForm) -> String {
        delegate!(self, t => t.address(form))
    }

    fn peer_address(&self, form: AddressForm) -> String {
        delegate!(self, t => t.peer_address(form))
    }

    fn send_buffering(&self) -> usize {
        delegate!(self, t => t.send_buffering())
    }

    fn recv_buffering(&self) -> usize {
        delegate!(self, t => t.recv_buffering())
    }

    fn set_buffer_sizes(&mut self, send: usize, recv: usize) {
        delegate!(self, t => t.set_buffer_sizes(send, recv))
    }

    fn duplex_ready(&self) -> bool {
        delegate!(self, t => t.duplex_ready())
    }

    fn set_max_wait(&mut self, max_wait: Option<Duration>) {
        delegate!(self, t => t.set_max_wait(max_wait))
    }

    fn set_break(&mut self, keepalive: Option<SharedKeepAlive>) {
        delegate!(self, t => t.set_break(keepalive))
    }

    fn is_ssl(&self) -> bool {
        matches!(self, Self::Ssl(_))
    }

    fn is_accepted(&self) -> bool {
        delegate!(self, t => t.is_accepted())
    }

    fn encryption_type(&self) -> Option<String> {
        delegate!(self, t => t.encryption_type())
    }

    fn peer_credentials(&self) -> Option<&dyn PeerCredentials> {
        delegate!(self, t => t.peer_credentials())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::{format_address, AddressForm};

    #[test]
    fn test_address_forms() {
        let addr: SocketAddr = "10.0.0.7:1666".parse().unwrap();
        assert_eq!(format_address(Some(addr), "perforce.example.com", AddressForm::Ip), "10.0.0.7");
        assert_eq!(format_address(Some(addr), "perforce.example.com", AddressForm::IpPort), "10.0.0.7:1666");
        assert_eq!(format_address(Some(addr), "perforce.example.com", AddressForm::Host), "perforce.example.com");
        assert_eq!(format_address(Some(addr), "perforce.example.com", AddressForm::HostPort), "perforce.example.com:1666");
        assert_eq!(format_address(Some(addr), "", AddressForm::HostPort), "10.0.0.7:1666");
        assert_eq!(format_address(None, "x", AddressForm::Host), "");
    }

    #[test]
    fn test_ipv6_address_forms() {
        let addr: SocketAddr = "[::1]:1666".parse().unwrap();
        assert_eq!(format_address(Some(addr), "", AddressForm::IpPort), "[::1]:1666");
        assert_eq!(format_address(Some(addr), "::1", AddressForm::HostPort), "[::1]:1666");
        assert_eq!(format_address(Some(addr), "", AddressForm::Ip), "::1");
    }
}
