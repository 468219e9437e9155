//! The secure transport: TLS over a [`TcpTransport`], driven by hand so that every wait goes
//! through the same bounded selector as plain connections.

use std::{
    io::{ErrorKind, Read, Write},
    sync::Arc,
    time::Duration,
};

use rustls::{ClientConnection, Connection, RootCertStore, ServerConnection, ServerName};
use tracing::{debug, warn};

use super::{
    address::DEFAULT_CONNECT_HOST,
    credentials::{PeerCredentials, X509Credentials},
    handshake::{self, would_block, HandshakeState, SocketIo},
    selector::{self, PeekResult, Readiness, WaitBudget},
    tcp::TcpTransport,
    tls::TlsContext,
    AddressForm, NetIo, SharedKeepAlive, Transport, READ_CHUNK,
};
use crate::{
    config::RpcConfig,
    error::{Direction, DuplexError, Error, Side},
};

pub struct SslTransport {
    tcp: TcpTransport,
    conn: Connection,
    side: Side,
    roots: Arc<RootCertStore>,
    handshake_max_wait: Duration,
    close_max_wait: Duration,
    handshake_done: bool,
    handshake_error: Option<Error>,
    credentials: Option<X509Credentials>,

    /// Set once the socket reported EOF. Whether that was clean depends on whether a close
    /// notification arrived first.
    tcp_eof: bool,
    last_read: bool,
}

impl SslTransport {
    fn new(tcp: TcpTransport, conn: Connection, side: Side, tls: &TlsContext, config: &RpcConfig) -> Self {
        let handshake_max_wait = match config.max_wait {
            Some(max_wait) => max_wait.max(config.handshake_max_wait),
            None => config.handshake_max_wait,
        };

        Self {
            tcp,
            conn,
            side,
            roots: Arc::clone(&tls.roots),
            handshake_max_wait,
            close_max_wait: config.close_max_wait,
            handshake_done: false,
            handshake_error: None,
            credentials: None,
            tcp_eof: false,
            last_read: false,
        }
    }

    /// Wraps a connected socket. The name sent for SNI is the requested host.
    pub fn client(tcp: TcpTransport, tls: &TlsContext, config: &RpcConfig) -> Result<Self, Error> {
        let host = match tcp.requested_host() {
            "" => DEFAULT_CONNECT_HOST,
            host => host,
        };

        let server_name = ServerName::try_from(host)
            .or_else(|_| ServerName::try_from(DEFAULT_CONNECT_HOST))
            .map_err(|e| Error::SslConfig(e.to_string()))?;

        let conn = ClientConnection::new(Arc::clone(&tls.client), server_name).map_err(|e| Error::SslConfig(e.to_string()))?;
        Ok(Self::new(tcp, Connection::from(conn), Side::Connect, tls, config))
    }

    /// Wraps an accepted socket.
    pub fn server(tcp: TcpTransport, tls: &TlsContext, config: &RpcConfig) -> Result<Self, Error> {
        let server_config = tls.server.as_ref().ok_or_else(|| Error::SslConfig("listener has no certificate".into()))?;
        let conn = ServerConnection::new(Arc::clone(server_config)).map_err(|e| Error::SslConfig(e.to_string()))?;
        Ok(Self::new(tcp, Connection::from(conn), Side::Accept, tls, config))
    }

    async fn run_handshake(&mut self) -> Result<(), Error> {
        let budget = WaitBudget::new(Some(self.handshake_max_wait), self.tcp.keepalive());

        loop {
            let Some(stream) = self.tcp.stream() else {
                return Err(Error::NotConnected);
            };

            let want = match handshake::step(&mut self.conn, stream) {
                HandshakeState::Done => break,
                HandshakeState::WantRead => Readiness::new(true, false),
                HandshakeState::WantWrite => Readiness::new(false, true),
                HandshakeState::Failed(failure) => {
                    let address = self.tcp.peer_address(AddressForm::IpPort);
                    return Err(handshake::map_failure(failure, self.side, address));
                }
            };

            let ready = selector::select(stream, want, budget.next_slice())
                .await
                .map_err(|e| Error::Select(Arc::new(e)))?;

            if !ready.any() {
                if budget.expired() {
                    return Err(Error::HandshakeTimeout {
                        side: self.side,
                        millis: budget.millis(),
                    });
                }

                if self.tcp.is_broken() {
                    return Err(Error::Break);
                }
            }
        }

        debug!(
            side = %self.side,
            peer = %self.tcp.peer_address(AddressForm::IpPort),
            encryption = self.encryption_type().unwrap_or_default(),
            "TLS handshake complete"
        );

        if self.side == Side::Connect {
            let chain = self.conn.peer_certificates().map(<[_]>::to_vec).unwrap_or_default();
            let credentials = X509Credentials::new(chain, Arc::clone(&self.roots))?;
            credentials.check_date_range()?;
            self.credentials = Some(credentials);
        }

        Ok(())
    }

    /// Sends whatever TLS records are queued, waiting at most the close max-wait.
    async fn flush_bounded(&mut self) {
        let budget = WaitBudget::new(Some(self.close_max_wait), None);

        while self.conn.wants_write() {
            let Some(stream) = self.tcp.stream() else {
                return;
            };

            match self.conn.write_tls(&mut SocketIo(stream)) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(error) if would_block(&error) => {}
                Err(_) => return,
            }

            match selector::select(stream, Readiness::new(false, true), budget.next_slice()).await {
                Ok(ready) if ready.write => {}
                _ if budget.expired() => return,
                Ok(_) => {}
                Err(_) => return,
            }
        }
    }

    fn abrupt_close(&self) -> Error {
        Error::SslAbruptClose {
            address: self.tcp.peer_address(AddressForm::IpPort),
        }
    }
}

impl Transport for SslTransport {
    async fn send_or_receive(&mut self, io: &mut NetIo<'_>, errors: &mut DuplexError) -> bool {
        if let Err(error) = self.do_handshake().await {
            if !io.send.is_empty() {
                errors.set_send(error.clone());
            }
            errors.set_recv(error);
            return false;
        }

        let budget = WaitBudget::new(self.tcp.max_wait(), self.tcp.keepalive());

        loop {
            let mut progress = false;

            if !io.send.is_empty() && errors.send.is_none() {
                match self.conn.writer().write(io.send) {
                    Ok(0) => {}
                    Ok(len) => {
                        io.send = &io.send[len..];
                        self.last_read = false;
                        progress = true;
                    }
                    Err(error) => errors.set_send(Error::SslSend(error.to_string())),
                }
            }

            let Some(stream) = self.tcp.stream() else {
                errors.set_recv(Error::NotConnected);
                return false;
            };

            // Plaintext is refused while the record buffer is full, so draining records
            // counts as progress on its own.
            let mut write_blocked = false;
            while self.conn.wants_write() && errors.send.is_none() {
                match self.conn.write_tls(&mut SocketIo(stream)) {
                    Ok(0) => break,
                    Ok(_) => progress = true,
                    Err(error) if would_block(&error) => {
                        write_blocked = true;
                        break;
                    }
                    Err(error) => errors.set_send(Error::SslSend(error.to_string())),
                }
            }

            let mut read_blocked = false;
            let do_read = io.recv_room > 0 && !io.eof && errors.recv.is_none();
            while do_read {
                let start = io.recv.len();
                io.recv.resize(start + io.recv_room.min(READ_CHUNK), 0);
                let result = self.conn.reader().read(&mut io.recv[start..]);
                io.recv.truncate(start + *result.as_ref().unwrap_or(&0));

                match result {
                    Ok(0) => {
                        debug!("TLS peer sent close notification");
                        io.eof = true;
                        progress = true;
                        break;
                    }
                    Ok(len) => {
                        io.recv_room -= len;
                        self.last_read = true;
                        progress = true;
                        break;
                    }
                    Err(error) if error.kind() == ErrorKind::WouldBlock => {}
                    Err(error) if error.kind() == ErrorKind::UnexpectedEof => {
                        errors.set_recv(self.abrupt_close());
                        break;
                    }
                    Err(error) => {
                        errors.set_recv(Error::SslRecv(error.to_string()));
                        break;
                    }
                }

                // No plaintext is buffered, so pull more records off the socket.
                if self.tcp_eof {
                    errors.set_recv(self.abrupt_close());
                    break;
                }

                match self.conn.read_tls(&mut SocketIo(stream)) {
                    Ok(0) => self.tcp_eof = true,
                    Ok(_) => {}
                    Err(error) if would_block(&error) => {
                        read_blocked = true;
                        break;
                    }
                    Err(error) => {
                        errors.set_recv(Error::SslRecv(error.to_string()));
                        break;
                    }
                }

                if let Err(error) = self.conn.process_new_packets() {
                    let _ = self.conn.write_tls(&mut SocketIo(stream));
                    errors.set_recv(Error::SslRecv(error.to_string()));
                    break;
                }
            }

            if progress {
                return true;
            }

            let want = Readiness::new(read_blocked, write_blocked);
            if !want.any() {
                return false;
            }

            let ready = match selector::select(stream, want, budget.next_slice()).await {
                Ok(ready) => ready,
                Err(error) => {
                    let error = Error::Select(Arc::new(error));
                    if write_blocked {
                        errors.set_send(error.clone());
                    }
                    errors.set_recv(error);
                    return false;
                }
            };

            if !ready.any() {
                if budget.expired() {
                    self.last_read = false;
                    let direction = match write_blocked {
                        true => Direction::Send,
                        false => Direction::Receive,
                    };
                    let error = Error::MaxWait {
                        direction,
                        millis: budget.millis(),
                    };

                    if write_blocked {
                        errors.set_send(error.clone());
                    }
                    errors.set_recv(error);
                    return false;
                }

                if self.tcp.is_broken() {
                    self.last_read = false;
                    if write_blocked {
                        errors.set_send(Error::Break);
                    }
                    errors.set_recv(Error::Break);
                    return false;
                }
            }
        }
    }

    async fn close(&mut self) -> bool {
        if self.tcp.is_closed() {
            return false;
        }

        if self.handshake_done {
            self.conn.send_close_notify();
            self.flush_bounded().await;
        }

        self.tcp.set_last_read(self.last_read);
        self.tcp.close().await
    }

    fn is_closed(&self) -> bool {
        self.tcp.is_closed()
    }

    fn shutdown(&mut self) {
        self.tcp.shutdown();
    }

    async fn client_mismatch(&mut self) -> Result<(), Error> {
        if !self.tcp.is_accepted() {
            return Ok(());
        }

        let Some(stream) = self.tcp.stream() else {
            return Ok(());
        };

        match selector::check_for_handshake(stream).await {
            Ok(PeekResult::Cleartext) => {
                warn!(peer = %self.tcp.peer_address(AddressForm::IpPort), "TLS listener received a plaintext connection");
                self.tcp.close().await;
                Err(Error::SslCleartext)
            }
            Ok(_) => Ok(()),
            Err(error) => Err(Error::Accept(Arc::new(error))),
        }
    }

    async fn do_handshake(&mut self) -> Result<(), Error> {
        if self.handshake_done {
            return Ok(());
        }

        if let Some(error) = &self.handshake_error {
            return Err(error.clone());
        }

        match self.run_handshake().await {
            Ok(()) => {
                self.handshake_done = true;
                Ok(())
            }
            Err(error) => {
                warn!(side = %self.side, %error, "TLS handshake failed");
                self.handshake_error = Some(error.clone());
                Err(error)
            }
        }
    }

    async fn is_alive(&self) -> bool {
        self.tcp.is_alive().await
    }

    fn address(&self, form: AddressForm) -> String {
        self.tcp.address(form)
    }

    fn peer_address(&self, form: AddressForm) -> String {
        self.tcp.peer_address(form)
    }

    fn send_buffering(&self) -> usize {
        self.tcp.send_buffering()
    }

    fn recv_buffering(&self) -> usize {
        self.tcp.recv_buffering()
    }

    fn set_buffer_sizes(&mut self, send: usize, recv: usize) {
        self.tcp.set_buffer_sizes(send, recv);
    }

    fn set_max_wait(&mut self, max_wait: Option<Duration>) {
        self.tcp.set_max_wait(max_wait);
    }

    fn set_break(&mut self, keepalive: Option<SharedKeepAlive>) {
        self.tcp.set_break(keepalive);
    }

    fn is_ssl(&self) -> bool {
        true
    }

    fn is_accepted(&self) -> bool {
        self.tcp.is_accepted()
    }

    fn encryption_type(&self) -> Option<String> {
        let version = self.conn.protocol_version()?;
        let suite = self.conn.negotiated_cipher_suite()?;
        Some(format!("{version:?}/{:?}", suite.suite()))
    }

    fn peer_credentials(&self) -> Option<&dyn PeerCredentials> {
        self.credentials.as_ref().map(|c| c as &dyn PeerCredentials)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tokio::io::AsyncWriteExt;

    use super::SslTransport;
    use crate::{
        config::{RpcConfig, TlsVersion},
        error::{Error, Side},
        net::{
            credentials::ServerCredentials,
            tcp::{tests::socket_pair, TcpTransport},
            tls::TlsContext,
            Transport,
        },
    };

    fn contexts(client_config: &RpcConfig, server_config: &RpcConfig) -> (TlsContext, TlsContext, ServerCredentials) {
        let credentials = ServerCredentials::generate_self_signed(vec!["localhost".into()]).unwrap();
        let client = TlsContext::new(client_config).unwrap();
        let server = TlsContext::new(server_config)
            .unwrap()
            .with_server(&server_config.tls, &credentials)
            .unwrap();
        (client, server, credentials)
    }

    async fn ssl_pair(client_config: &RpcConfig, server_config: &RpcConfig) -> (SslTransport, SslTransport, ServerCredentials) {
        let (client_tls, server_tls, credentials) = contexts(client_config, server_config);
        let (client, server) = socket_pair().await;

        let client = TcpTransport::new(client, false, "localhost", client_config);
        let server = TcpTransport::new(server, true, "", server_config);
        (
            SslTransport::client(client, &client_tls, client_config).unwrap(),
            SslTransport::server(server, &server_tls, server_config).unwrap(),
            credentials,
        )
    }

    #[tokio::test]
    async fn test_handshake_and_exchange() {
        let config = RpcConfig::new();
        let (mut client, mut server, credentials) = ssl_pair(&config, &config).await;

        let (c, s) = tokio::join!(client.do_handshake(), server.do_handshake());
        c.unwrap();
        s.unwrap();

        assert!(client.is_ssl());
        assert!(client.encryption_type().unwrap().contains("TLS"));
        assert_eq!(client.peer_fingerprint(), Some(credentials.fingerprint().unwrap().as_str()));
        assert!(client.peer_credentials().unwrap().is_self_signed());
        assert!(server.peer_credentials().is_none());

        client.send(b"secret payload").await.unwrap();
        let mut buf = Vec::new();
        while buf.len() < 14 {
            server.receive(&mut buf, 64).await.unwrap();
        }
        assert_eq!(buf, b"secret payload");

        let (closed, received) = tokio::join!(client.close(), server.receive(&mut buf, 64));
        assert!(closed);
        assert_eq!(received.unwrap(), 0);
        assert!(!client.close().await);
        assert!(server.close().await);
        assert!(!server.close().await);
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let mut client_config = RpcConfig::new();
        client_config.tls.max_version = TlsVersion::Tls12;
        let mut server_config = RpcConfig::new();
        server_config.tls.min_version = TlsVersion::Tls13;
        let (mut client, mut server, _) = ssl_pair(&client_config, &server_config).await;

        let (c, s) = tokio::join!(client.do_handshake(), server.do_handshake());
        assert!(matches!(c, Err(Error::SslProtocol { .. })), "{c:?}");
        assert!(matches!(s, Err(Error::SslProtocol { .. })), "{s:?}");

        // The failure sticks.
        assert!(matches!(client.do_handshake().await, Err(Error::SslProtocol { .. })));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let mut config = RpcConfig::new();
        config.handshake_max_wait = Duration::from_millis(300);
        let (_, server_tls, _) = contexts(&config, &config);
        let (_idle_client, server) = socket_pair().await;
        let mut server = SslTransport::server(TcpTransport::new(server, true, "", &config), &server_tls, &config).unwrap();

        let start = Instant::now();
        let result = server.do_handshake().await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(Error::HandshakeTimeout { side: Side::Accept, millis: 300 })), "{result:?}");
        assert!(elapsed >= Duration::from_millis(300) && elapsed <= Duration::from_millis(800), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_client_handshake_timeout() {
        let mut config = RpcConfig::new();
        config.handshake_max_wait = Duration::from_millis(300);
        let (client_tls, _, _) = contexts(&config, &config);
        let (client, _silent_server) = socket_pair().await;
        let mut client = SslTransport::client(TcpTransport::new(client, false, "localhost", &config), &client_tls, &config).unwrap();

        let start = Instant::now();
        let result = client.do_handshake().await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(Error::HandshakeTimeout { side: Side::Connect, millis: 300 })), "{result:?}");
        assert!(elapsed >= Duration::from_millis(300) && elapsed <= Duration::from_millis(800), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_large_transfer() {
        const TOTAL: usize = 4 * 1024 * 1024;

        let config = RpcConfig::new();
        let (mut client, mut server, _) = ssl_pair(&config, &config).await;
        let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();

        let send = async {
            client.send(&payload).await.unwrap();
        };

        let receive = async {
            let mut buf = Vec::with_capacity(TOTAL);
            while buf.len() < TOTAL {
                let len = server.receive(&mut buf, 64 * 1024).await.unwrap();
                assert!(len > 0, "peer closed after {} bytes", buf.len());
            }
            buf
        };

        let ((), received) = tokio::join!(send, receive);
        assert_eq!(received.len(), TOTAL);
        assert!(received == payload);

        let mut sink = Vec::new();
        let (closed, _) = tokio::join!(client.close(), server.receive(&mut sink, 64));
        assert!(closed);
    }

    #[tokio::test]
    async fn test_plaintext_client_on_tls_listener() {
        let config = RpcConfig::new();
        let (_, server_tls, _) = contexts(&config, &config);
        let (mut raw_client, server) = socket_pair().await;
        let mut server = SslTransport::server(TcpTransport::new(server, true, "", &config), &server_tls, &config).unwrap();

        raw_client.write_all(b"\x4b\x2f\x00\x00\x00func\x00").await.unwrap();
        assert!(matches!(server.client_mismatch().await, Err(Error::SslCleartext)));
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_drop_without_close_notify() {
        let config = RpcConfig::new();
        let (mut client, mut server, _) = ssl_pair(&config, &config).await;
        let (c, s) = tokio::join!(client.do_handshake(), server.do_handshake());
        c.unwrap();
        s.unwrap();

        assert!(server.tcp.close().await);
        let result = client.receive(&mut Vec::new(), 64).await;
        assert!(matches!(result, Err(Error::SslAbruptClose { .. })), "{result:?}");
    }
}
