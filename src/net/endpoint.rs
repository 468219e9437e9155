//! Listening for and establishing connections on a parsed address.

use std::{io, net::SocketAddr, sync::Arc};

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::{
    address::PortSpec, credentials::ServerCredentials, ssl::SslTransport, tcp::TcpTransport, tls::TlsContext, NetTransport,
};
use crate::{config::RpcConfig, error::Error};

/// One end of a service: either listens and accepts connections, or connects to a server.
pub struct NetEndPoint {
    spec: PortSpec,
    config: Arc<RpcConfig>,
    tls: Option<TlsContext>,
    listener: Option<TcpListener>,
}

impl NetEndPoint {
    pub fn new(address: &str, config: Arc<RpcConfig>) -> Result<Self, Error> {
        let spec: PortSpec = address.parse()?;
        let tls = match spec.is_ssl() {
            true => Some(TlsContext::new(&config)?),
            false => None,
        };

        Ok(Self {
            spec,
            config,
            tls,
            listener: None,
        })
    }

    pub fn spec(&self) -> &PortSpec {
        &self.spec
    }

    pub fn config(&self) -> &Arc<RpcConfig> {
        &self.config
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// The address the listener is bound to, which tells the port when listening on port 0.
    pub fn listen_address(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    async fn resolve(&self, host: &str) -> io::Result<Vec<SocketAddr>> {
        let family = self.spec.family;
        let addresses: Vec<SocketAddr> = tokio::net::lookup_host((host, self.spec.port))
            .await?
            .filter(|addr| family.accepts(&addr.ip()))
            .collect();

        match addresses.is_empty() {
            true => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("The host \"{host}\" could not be resolved to any addresses"),
            )),
            false => Ok(addresses),
        }
    }

    pub async fn listen(&mut self) -> Result<(), Error> {
        let host = self.spec.listen_host().to_string();
        let listen_error = |source: io::Error| Error::Listen {
            address: self.spec.to_string(),
            source: Arc::new(source),
        };

        let addresses = self.resolve(&host).await.map_err(listen_error)?;

        let mut last_error = None;
        let mut listener = None;
        for address in addresses {
            match TcpListener::bind(address).await {
                Ok(l) => {
                    listener = Some(l);
                    break;
                }
                Err(error) => last_error = Some(error),
            }
        }

        let listener = match (listener, last_error) {
            (Some(listener), _) => listener,
            (None, Some(error)) => return Err(listen_error(error)),
            (None, None) => return Err(listen_error(io::ErrorKind::AddrNotAvailable.into())),
        };

        if let Some(tls) = self.tls.take() {
            let credentials = match &self.config.server_credentials {
                Some(credentials) => credentials.clone(),
                None => {
                    warn!("No certificate configured for {}, generating a self-signed one", self.spec);
                    let name = match self.spec.host.is_empty() {
                        true => "localhost".to_string(),
                        false => self.spec.host.clone(),
                    };
                    ServerCredentials::generate_self_signed(vec![name])?
                }
            };

            info!("TLS listener fingerprint is {}", credentials.fingerprint()?);
            self.tls = Some(tls.with_server(&self.config.tls, &credentials)?);
        }

        info!("Listening on {}", listener.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| host));
        self.listener = Some(listener);
        Ok(())
    }

    pub fn unlisten(&mut self) {
        if self.listener.take().is_some() {
            debug!("Stopped listening on {}", self.spec);
        }
    }

    /// Waits for the next connection, bounded by the accept max-wait.
    pub async fn accept(&self) -> Result<NetTransport, Error> {
        let listener = self.listener.as_ref().ok_or(Error::NotListening)?;

        let result = match self.config.accept_max_wait {
            Some(max_wait) => tokio::time::timeout(max_wait, listener.accept())
                .await
                .map_err(|_| Error::AcceptTimeout {
                    millis: max_wait.as_millis() as u64,
                })?,
            None => listener.accept().await,
        };

        let (stream, from) = result.map_err(|e| Error::Accept(Arc::new(e)))?;
        debug!("Accepted connection from {from}");

        let tcp = TcpTransport::new(stream, true, "", &self.config);
        self.wrap(tcp, true)
    }

    /// Connects to the address, trying every address the host resolves to in order.
    pub async fn connect(&self) -> Result<NetTransport, Error> {
        let host = self.spec.connect_host();
        let address = self.spec.to_string();
        let connect_error = |source: io::Error| Error::Connect {
            address: address.clone(),
            source: Arc::new(source),
        };

        let mut last_error = None;
        for target in self.resolve(host).await.map_err(connect_error)? {
            let attempt = match self.config.connect_max_wait {
                Some(max_wait) => match tokio::time::timeout(max_wait, TcpStream::connect(target)).await {
                    Ok(result) => result.map_err(connect_error),
                    Err(_) => Err(Error::ConnectTimeout {
                        address: address.clone(),
                        millis: max_wait.as_millis() as u64,
                    }),
                },
                None => TcpStream::connect(target).await.map_err(connect_error),
            };

            match attempt {
                Ok(stream) => {
                    debug!("Connected to {target}");
                    let tcp = TcpTransport::new(stream, false, host, &self.config);
                    return self.wrap(tcp, false);
                }
                Err(error) => {
                    debug!(%error, "Could not connect to {target}");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| connect_error(io::ErrorKind::NotFound.into())))
    }

    fn wrap(&self, tcp: TcpTransport, accepted: bool) -> Result<NetTransport, Error> {
        let Some(tls) = &self.tls else {
            return Ok(NetTransport::Tcp(tcp));
        };

        let ssl = match accepted {
            true => SslTransport::server(tcp, tls, &self.config)?,
            false => SslTransport::client(tcp, tls, &self.config)?,
        };

        Ok(NetTransport::Ssl(Box::new(ssl)))
    }
}
