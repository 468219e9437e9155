//! The non-blocking TLS handshake state machine.
//!
//! [`step`] advances a rustls connection as far as the socket allows without waiting, and
//! reports what it needs next:
//!
//! | state       | meaning                                                   |
//! |-------------|-----------------------------------------------------------|
//! | `WantRead`  | the peer's next flight hasn't fully arrived yet            |
//! | `WantWrite` | our flight is queued but the socket buffer is full        |
//! | `Done`      | the handshake finished and every record we owe was sent   |
//! | `Failed`    | the handshake can't complete                              |
//!
//! The caller waits for the requested readiness and calls [`step`] again. Partial records stay
//! buffered inside the connection between steps.

use std::{
    fmt,
    io::{self, ErrorKind, Read, Write},
};

use rustls::{AlertDescription, CertificateError, Connection};
use tokio::net::TcpStream;

use crate::error::{Error, Side};

/// Adapts a non-blocking socket to the [`Read`] and [`Write`] traits rustls works with.
pub(crate) struct SocketIo<'a>(pub &'a TcpStream);

impl Read for SocketIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SocketIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) fn would_block(error: &io::Error) -> bool {
    matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

#[derive(Debug)]
pub enum HandshakeFailure {
    Tls(rustls::Error),
    Io(io::Error),
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls(error) => write!(f, "{error}"),
            Self::Io(error) if error.kind() == ErrorKind::UnexpectedEof => write!(f, "peer closed the connection"),
            Self::Io(error) => write!(f, "{error}"),
        }
    }
}

#[derive(Debug)]
pub enum HandshakeState {
    WantRead,
    WantWrite,
    Done,
    Failed(HandshakeFailure),
}

/// Advances the handshake until it needs the socket to become readable or writable.
pub fn step(conn: &mut Connection, stream: &TcpStream) -> HandshakeState {
    loop {
        while conn.wants_write() {
            match conn.write_tls(&mut SocketIo(stream)) {
                Ok(0) => return HandshakeState::WantWrite,
                Ok(_) => {}
                Err(error) if would_block(&error) => return HandshakeState::WantWrite,
                Err(error) => return HandshakeState::Failed(HandshakeFailure::Io(error)),
            }
        }

        if !conn.is_handshaking() {
            return HandshakeState::Done;
        }

        match conn.read_tls(&mut SocketIo(stream)) {
            Ok(0) => return HandshakeState::Failed(HandshakeFailure::Io(ErrorKind::UnexpectedEof.into())),
            Ok(_) => {}
            Err(error) if would_block(&error) => return HandshakeState::WantRead,
            Err(error) => return HandshakeState::Failed(HandshakeFailure::Io(error)),
        }

        if let Err(error) = conn.process_new_packets() {
            // Let the peer know why, if the alert fits in the socket buffer.
            let _ = conn.write_tls(&mut SocketIo(stream));
            return HandshakeState::Failed(HandshakeFailure::Tls(error));
        }
    }
}

fn is_certificate_alert(alert: &AlertDescription) -> bool {
    matches!(
        alert,
        AlertDescription::BadCertificate
            | AlertDescription::UnsupportedCertificate
            | AlertDescription::CertificateRevoked
            | AlertDescription::CertificateExpired
            | AlertDescription::CertificateUnknown
            | AlertDescription::UnknownCA
    )
}

/// Maps a failed handshake to the error reported to the caller.
pub fn map_failure(failure: HandshakeFailure, side: Side, address: String) -> Error {
    let detail = failure.to_string();

    match failure {
        HandshakeFailure::Tls(rustls::Error::PeerIncompatible(_))
        | HandshakeFailure::Tls(rustls::Error::AlertReceived(AlertDescription::ProtocolVersion)) => {
            Error::SslProtocol { address, detail }
        }
        HandshakeFailure::Tls(rustls::Error::InvalidCertificate(CertificateError::Expired | CertificateError::NotValidYet)) => {
            Error::CertDateRange
        }
        HandshakeFailure::Tls(rustls::Error::InvalidCertificate(_)) => Error::SslCertificate { side, address, detail },
        HandshakeFailure::Tls(rustls::Error::AlertReceived(alert)) if is_certificate_alert(&alert) => {
            Error::SslCertificate { side, address, detail }
        }
        _ => Error::SslHandshake { side, address, detail },
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use rustls::{AlertDescription, CertificateError, PeerIncompatible};

    use super::{map_failure, HandshakeFailure};
    use crate::error::{Error, Side};

    fn map(failure: HandshakeFailure) -> Error {
        map_failure(failure, Side::Connect, "127.0.0.1:1666".into())
    }

    #[test]
    fn test_failure_mapping() {
        let version = HandshakeFailure::Tls(rustls::Error::AlertReceived(AlertDescription::ProtocolVersion));
        assert!(matches!(map(version), Error::SslProtocol { .. }));

        let incompatible = HandshakeFailure::Tls(rustls::Error::PeerIncompatible(PeerIncompatible::NoCipherSuitesInCommon));
        assert!(matches!(map(incompatible), Error::SslProtocol { .. }));

        let bad_cert = HandshakeFailure::Tls(rustls::Error::InvalidCertificate(CertificateError::BadEncoding));
        assert!(matches!(map(bad_cert), Error::SslCertificate { side: Side::Connect, .. }));

        let unknown_ca = HandshakeFailure::Tls(rustls::Error::AlertReceived(AlertDescription::UnknownCA));
        assert!(matches!(map(unknown_ca), Error::SslCertificate { .. }));

        let expired = HandshakeFailure::Tls(rustls::Error::InvalidCertificate(CertificateError::Expired));
        assert!(matches!(map(expired), Error::CertDateRange));

        let eof = HandshakeFailure::Io(io::ErrorKind::UnexpectedEof.into());
        match map(eof) {
            Error::SslHandshake { detail, .. } => assert_eq!(detail, "peer closed the connection"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
