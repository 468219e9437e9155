//! rustls configuration for secure transports.
//!
//! The client side accepts any certificate during the handshake. Whether the peer is trusted is
//! decided afterwards, from the credentials the handshake produced, by
//! [`check_known_host`](crate::trust::check_known_host).

use std::sync::Arc;

use rustls::{
    client::{Resumption, ServerCertVerified, ServerCertVerifier},
    server::NoServerSessionStorage,
    version::{TLS12, TLS13},
    Certificate, ClientConfig, ProtocolVersion, RootCertStore, ServerConfig, ServerName, SupportedCipherSuite,
    SupportedProtocolVersion, ALL_CIPHER_SUITES, DEFAULT_CIPHER_SUITES,
};

use super::credentials::ServerCredentials;
use crate::{
    config::{RpcConfig, TlsSettings, TlsVersion},
    error::Error,
};

/// Everything a connection needs to run TLS, built once per endpoint.
#[derive(Clone)]
pub struct TlsContext {
    pub client: Arc<ClientConfig>,
    pub server: Option<Arc<ServerConfig>>,
    pub roots: Arc<RootCertStore>,
}

impl TlsContext {
    /// Builds the client side. The server side is only built by listening endpoints.
    pub fn new(config: &RpcConfig) -> Result<Self, Error> {
        Ok(Self {
            client: Arc::new(client_config(&config.tls)?),
            server: None,
            roots: Arc::new(root_store(&config.trusted_roots)?),
        })
    }

    pub fn with_server(mut self, settings: &TlsSettings, credentials: &ServerCredentials) -> Result<Self, Error> {
        self.server = Some(Arc::new(server_config(settings, credentials)?));
        Ok(self)
    }
}

struct AcceptAnyServerCert;

impl AcceptAnyServerCert {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn protocol_version(version: TlsVersion) -> &'static SupportedProtocolVersion {
    match version {
        TlsVersion::Tls12 => &TLS12,
        TlsVersion::Tls13 => &TLS13,
    }
}

fn versions(settings: &TlsSettings) -> Result<Vec<&'static SupportedProtocolVersion>, Error> {
    if settings.min_version > settings.max_version {
        return Err(Error::SslConfig(format!(
            "minimum version {} is above maximum version {}",
            settings.min_version, settings.max_version
        )));
    }

    Ok([TlsVersion::Tls12, TlsVersion::Tls13]
        .into_iter()
        .filter(|v| (settings.min_version..=settings.max_version).contains(v))
        .map(protocol_version)
        .collect())
}

fn suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

fn pick_suites(
    names: Option<&Vec<String>>,
    version: ProtocolVersion,
    suites: &mut Vec<SupportedCipherSuite>,
) -> Result<(), Error> {
    let of_version = |suite: &&SupportedCipherSuite| suite.version().version == version;

    match names {
        None => suites.extend(DEFAULT_CIPHER_SUITES.iter().filter(of_version).copied()),
        Some(names) => {
            for name in names {
                let suite = ALL_CIPHER_SUITES
                    .iter()
                    .filter(of_version)
                    .find(|suite| suite_name(suite).eq_ignore_ascii_case(name))
                    .ok_or_else(|| Error::SslConfig(format!("unknown cipher suite '{name}'")))?;
                suites.push(*suite);
            }
        }
    }

    Ok(())
}

/// The cipher suites allowed by the settings, TLS 1.3 ones first.
pub fn cipher_suites(settings: &TlsSettings) -> Result<Vec<SupportedCipherSuite>, Error> {
    let mut suites = Vec::new();
    pick_suites(settings.cipher_suites.as_ref(), ProtocolVersion::TLSv1_3, &mut suites)?;
    pick_suites(settings.cipher_list.as_ref(), ProtocolVersion::TLSv1_2, &mut suites)?;

    if suites.is_empty() {
        return Err(Error::SslConfig("no cipher suites enabled".into()));
    }

    Ok(suites)
}

pub fn client_config(settings: &TlsSettings) -> Result<ClientConfig, Error> {
    let mut config = ClientConfig::builder()
        .with_cipher_suites(&cipher_suites(settings)?)
        .with_safe_default_kx_groups()
        .with_protocol_versions(&versions(settings)?)
        .map_err(|e| Error::SslConfig(e.to_string()))?
        .with_custom_certificate_verifier(AcceptAnyServerCert::new())
        .with_no_client_auth();

    config.resumption = Resumption::disabled();
    Ok(config)
}

pub fn server_config(settings: &TlsSettings, credentials: &ServerCredentials) -> Result<ServerConfig, Error> {
    let mut config = ServerConfig::builder()
        .with_cipher_suites(&cipher_suites(settings)?)
        .with_safe_default_kx_groups()
        .with_protocol_versions(&versions(settings)?)
        .map_err(|e| Error::SslConfig(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(credentials.cert_chain.clone(), credentials.key.clone())
        .map_err(|e| Error::SslConfig(e.to_string()))?;

    config.session_storage = Arc::new(NoServerSessionStorage {});
    config.send_tls13_tickets = 0;
    Ok(config)
}

pub fn root_store(roots: &[Certificate]) -> Result<RootCertStore, Error> {
    let mut store = RootCertStore::empty();
    for root in roots {
        store.add(root).map_err(|e| Error::SslConfig(format!("bad trusted root: {e}")))?;
    }

    Ok(store)
}
