//! Error types shared by the transports and the RPC engine.
//!
//! [`Error`] identifies what went wrong. [`RpcError`] is the per-message error object handed to
//! handlers, which accumulates errors along with their [`Severity`]. [`DuplexError`] keeps the
//! send and receive sides of a connection apart, as a failure in one direction must not stop the
//! other from draining.

use std::{fmt, io, sync::Arc};

/// How bad an error is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Severity {
    #[default]
    Empty,
    Info,
    Warn,
    Failed,
    Fatal,
}

/// The direction of a stalled transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => write!(f, "send"),
            Self::Receive => write!(f, "receive"),
        }
    }
}

/// Which side of a TLS handshake we were.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Accept,
    Connect,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Connect => write!(f, "connect"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Invalid address '{0}'")]
    BadAddress(String),

    #[error("Connect to {address} failed: {source}")]
    Connect { address: String, source: Arc<io::Error> },

    #[error("Connect to {address} timed out after {millis} ms")]
    ConnectTimeout { address: String, millis: u64 },

    #[error("Listen on {address} failed: {source}")]
    Listen { address: String, source: Arc<io::Error> },

    #[error("Accept failed: {0}")]
    Accept(Arc<io::Error>),

    #[error("Accept timed out after {millis} ms")]
    AcceptTimeout { millis: u64 },

    #[error("Endpoint is not listening")]
    NotListening,

    #[error("Connection is already established")]
    Reconnect,

    #[error("Connection is not established")]
    NotConnected,

    #[error("Partner closed the connection")]
    Closed,

    #[error("TCP {direction} exceeded maximum configured duration of {millis} ms")]
    MaxWait { direction: Direction, millis: u64 },

    #[error("Operation interrupted")]
    Break,

    #[error("TCP send failed: {0}")]
    TcpSend(Arc<io::Error>),

    #[error("TCP receive failed: {0}")]
    TcpRecv(Arc<io::Error>),

    #[error("Readiness wait failed: {0}")]
    Select(Arc<io::Error>),

    #[error("Plaintext server received a TLS connection, the client should use a tcp: address")]
    TcpPeerSsl,

    #[error("TLS server received a plaintext connection, the client should use an ssl: address")]
    SslCleartext,

    #[error("TLS protocol version mismatch with {address}: {detail}")]
    SslProtocol { address: String, detail: String },

    #[error("TLS certificate rejected during {side} with {address}: {detail}")]
    SslCertificate { side: Side, address: String, detail: String },

    #[error("TLS handshake {side} with {address} failed: {detail}")]
    SslHandshake { side: Side, address: String, detail: String },

    #[error("TLS handshake {side} timed out after {millis} ms")]
    HandshakeTimeout { side: Side, millis: u64 },

    #[error("TLS connection with {address} dropped without a close notification")]
    SslAbruptClose { address: String },

    #[error("TLS send failed: {0}")]
    SslSend(String),

    #[error("TLS receive failed: {0}")]
    SslRecv(String),

    #[error("Invalid TLS configuration: {0}")]
    SslConfig(String),

    #[error("Peer certificate is outside its validity period")]
    CertDateRange,

    #[error("Certificate is malformed: {0}")]
    CertMalformed(String),

    #[error("Certificate chain failed validation: {0}")]
    CertBad(String),

    #[error("Certificate chain has non-critical problems: {0}")]
    CertBadChain(String),

    #[error("Certificate subject '{common_name}' does not match '{name}'")]
    CertBadSubject { common_name: String, name: String },

    #[error(
        "The fingerprint for the key sent by {address} does not match the one on record, someone may be impersonating it. \
        The fingerprint sent was {fingerprint}"
    )]
    HostKeyMismatch { address: String, fingerprint: String },

    #[error("The authenticity of {address} can't be established, its key fingerprint is {fingerprint}")]
    HostKeyUnknown { address: String, fingerprint: String },

    #[error("Trust store failure: {0}")]
    TrustStore(Arc<io::Error>),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message has no function name")]
    NoFunction,

    #[error("Function '{0}' is not registered")]
    Unregistered(String),

    #[error("Operation '{0}' failed")]
    Operation(String),

    #[error("Message of {0} bytes is too large to send")]
    TooBig(usize),

    #[error("Invalid tunable: {0}")]
    BadTunable(String),

    #[error("{0}")]
    Handler(String),
}

impl Error {
    /// The severity an error gets when recorded without an explicit one.
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::Handler(_) | Self::Unregistered(_) | Self::HostKeyUnknown { .. } | Self::CertBadChain(_) | Self::CertBadSubject { .. } => {
                Severity::Failed
            }
            _ => Severity::Fatal,
        }
    }

    /// Whether this error means the connection can't carry any more messages. Such errors always
    /// end the current dispatch loop.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Closed
                | Self::MaxWait { .. }
                | Self::HandshakeTimeout { .. }
                | Self::ConnectTimeout { .. }
                | Self::AcceptTimeout { .. }
                | Self::SslAbruptClose { .. }
                | Self::HostKeyMismatch { .. }
                | Self::Break
        )
    }

    /// Whether this is a timeout of any phase.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::MaxWait { .. } | Self::HandshakeTimeout { .. } | Self::ConnectTimeout { .. } | Self::AcceptTimeout { .. }
        )
    }
}

/// Accumulates the errors raised while processing one message.
///
/// Errors are appended in the order they're raised, and the overall severity is the highest one
/// seen. Handlers may [`clear`](RpcError::clear) non-fatal errors and carry on.
#[derive(Debug, Clone, Default)]
pub struct RpcError {
    errors: Vec<(Severity, Error)>,
}

impl RpcError {
    pub const fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Records an error with its default severity.
    pub fn set(&mut self, error: Error) {
        let severity = error.default_severity();
        self.set_with(severity, error);
    }

    pub fn set_with(&mut self, severity: Severity, error: Error) {
        self.errors.push((severity, error));
    }

    /// Whether any error has been recorded.
    pub fn test(&self) -> bool {
        self.errors.iter().any(|(severity, _)| *severity > Severity::Empty)
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() >= Severity::Fatal
    }

    pub fn severity(&self) -> Severity {
        self.errors.iter().map(|(s, _)| *s).max().unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }

    /// The first error recorded, which is usually the cause of the rest.
    pub fn first(&self) -> Option<&Error> {
        self.errors.first().map(|(_, e)| e)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Error> {
        self.errors.iter().map(|(_, e)| e)
    }

    /// Finds the first recorded error that is connection-fatal.
    pub fn connection_fatal(&self) -> Option<&Error> {
        self.errors().find(|e| e.is_connection_fatal())
    }

    /// Turns this into a result, failing with the first recorded error.
    pub fn into_result(self) -> Result<(), Error> {
        match self.errors.into_iter().next() {
            Some((_, error)) => Err(error),
            None => Ok(()),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut iter = self.errors();
        if let Some(first) = iter.next() {
            write!(f, "{first}")?;
        }

        for error in iter {
            write!(f, "\n{error}")?;
        }

        Ok(())
    }
}

impl From<Error> for RpcError {
    fn from(value: Error) -> Self {
        let mut e = RpcError::new();
        e.set(value);
        e
    }
}

/// Independent send and receive error slots of one connection.
///
/// Once a slot is filled it stays filled until cleared, so the first error in each direction is
/// the one reported.
#[derive(Debug, Clone, Default)]
pub struct DuplexError {
    pub send: Option<Error>,
    pub recv: Option<Error>,
}

impl DuplexError {
    pub const fn new() -> Self {
        Self { send: None, recv: None }
    }

    pub fn set_send(&mut self, error: Error) {
        if self.send.is_none() {
            self.send = Some(error);
        }
    }

    pub fn set_recv(&mut self, error: Error) {
        if self.recv.is_none() {
            self.recv = Some(error);
        }
    }

    /// Records the same error in both directions.
    pub fn set_both(&mut self, error: Error) {
        self.set_send(error.clone());
        self.set_recv(error);
    }

    pub fn test(&self) -> bool {
        self.send.is_some() || self.recv.is_some()
    }

    pub fn clear(&mut self) {
        self.send = None;
        self.recv = None;
    }

    /// Fails with the send error if there's one, otherwise with the receive error.
    pub fn to_result(&self) -> Result<(), Error> {
        match (&self.send, &self.recv) {
            (Some(e), _) | (None, Some(e)) => Err(e.clone()),
            (None, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Arc};

    use super::{Direction, DuplexError, Error, RpcError, Severity};

    #[test]
    fn test_rpc_error_severity() {
        let mut e = RpcError::new();
        assert!(!e.test());
        assert_eq!(e.severity(), Severity::Empty);

        e.set(Error::Handler("no such file".into()));
        assert!(e.test());
        assert!(!e.is_fatal());

        e.set(Error::Operation("user-sync".into()));
        assert!(e.is_fatal());
        assert!(matches!(e.first(), Some(Error::Handler(_))));

        e.clear();
        assert!(!e.test());
        assert!(e.into_result().is_ok());
    }

    #[test]
    fn test_info_is_still_an_error() {
        let mut e = RpcError::new();
        e.set_with(Severity::Info, Error::Handler("fyi".into()));
        assert!(e.test());
        assert!(!e.is_fatal());
    }

    #[test]
    fn test_connection_fatal_classes() {
        assert!(Error::Closed.is_connection_fatal());
        assert!(Error::Break.is_connection_fatal());
        assert!(Error::MaxWait { direction: Direction::Receive, millis: 10 }.is_connection_fatal());
        assert!(Error::HostKeyMismatch { address: "a".into(), fingerprint: "f".into() }.is_connection_fatal());
        assert!(!Error::HostKeyUnknown { address: "a".into(), fingerprint: "f".into() }.is_connection_fatal());
        assert!(!Error::Unregistered("x".into()).is_connection_fatal());

        let mut e = RpcError::new();
        e.set(Error::Handler("meh".into()));
        assert!(e.connection_fatal().is_none());
        e.set(Error::Closed);
        assert!(matches!(e.connection_fatal(), Some(Error::Closed)));
    }

    #[test]
    fn test_duplex_error_keeps_first() {
        let mut errors = DuplexError::new();
        assert!(errors.to_result().is_ok());

        errors.set_recv(Error::Closed);
        errors.set_recv(Error::Break);
        assert!(matches!(errors.recv, Some(Error::Closed)));
        assert!(errors.send.is_none());
        assert!(matches!(errors.to_result(), Err(Error::Closed)));

        errors.set_send(Error::TcpSend(Arc::new(io::Error::from(io::ErrorKind::BrokenPipe))));
        assert!(matches!(errors.to_result(), Err(Error::TcpSend(_))));

        errors.clear();
        assert!(!errors.test());
    }

    #[test]
    fn test_timeout_messages_name_the_direction() {
        let send = Error::MaxWait { direction: Direction::Send, millis: 300 };
        let recv = Error::MaxWait { direction: Direction::Receive, millis: 300 };
        assert!(send.to_string().contains("send"));
        assert!(recv.to_string().contains("receive"));
        assert!(send.is_timeout());
    }
}
