//! Deciding whether to trust a TLS peer.
//!
//! Peers are identified by the fingerprint of their public key. Fingerprints are pinned in a
//! [`TrustStore`] keyed by address and identity: the primary identity holds the fingerprint a
//! host is trusted with, and the pending identity holds a replacement that gets promoted the first
//! time the host presents it, which is how a planned key rotation goes through without a
//! mismatch.
//!
//! [`check_known_host`] runs, in order:
//!
//! | round | looks at                                   | outcome                                |
//! |-------|--------------------------------------------|----------------------------------------|
//! | 1     | pinned entries for the peer's `ip:port`    | accept, promote, or reject on mismatch |
//! | 2     | pinned entries for the requested host:port | same as round 1                        |
//! | 3     | the certificate chain and subject          | accept if valid and not self-signed    |
//!
//! If no round decides, the peer is unknown and the caller may offer to pin it.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info};

use crate::{
    config::CertValidation,
    error::{Error, RpcError},
    net::{credentials::PeerCredentials, AddressForm, Transport},
};

/// The identity a host's trusted fingerprint is stored under.
pub const PRIMARY_IDENTITY: &str = "**++**";

/// The identity a replacement fingerprint waits under until the host first presents it.
pub const PENDING_IDENTITY: &str = "++++++";

/// Persistent storage of pinned fingerprints.
pub trait TrustStore {
    fn lookup(&self, address: &str, identity: &str) -> Result<Option<String>, Error>;

    fn replace(&mut self, address: &str, identity: &str, fingerprint: &str) -> Result<(), Error>;

    fn delete(&mut self, address: &str, identity: &str) -> Result<(), Error>;
}

/// A trust store that lives only as long as the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryTrustStore {
    entries: BTreeMap<(String, String), String>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TrustStore for MemoryTrustStore {
    fn lookup(&self, address: &str, identity: &str) -> Result<Option<String>, Error> {
        Ok(self.entries.get(&(address.to_string(), identity.to_string())).cloned())
    }

    fn replace(&mut self, address: &str, identity: &str, fingerprint: &str) -> Result<(), Error> {
        self.entries
            .insert((address.to_string(), identity.to_string()), fingerprint.to_string());
        Ok(())
    }

    fn delete(&mut self, address: &str, identity: &str) -> Result<(), Error> {
        self.entries.remove(&(address.to_string(), identity.to_string()));
        Ok(())
    }
}

/// A trust store kept in a text file with one `address%identity=fingerprint` entry per line.
///
/// The file is re-read on every operation, so several processes may share it.
#[derive(Debug, Clone)]
pub struct FileTrustStore {
    path: PathBuf,
}

fn trust_error(error: io::Error) -> Error {
    Error::TrustStore(Arc::new(error))
}

fn parse_line(line: &str) -> Option<(&str, &str, &str)> {
    let (key, fingerprint) = line.split_once('=')?;
    let (address, identity) = key.rsplit_once('%')?;
    Some((address, identity, fingerprint.trim()))
}

impl FileTrustStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_lines(&self) -> Result<Vec<String>, Error> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.lines().filter(|l| !l.trim().is_empty()).map(String::from).collect()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(error) => Err(trust_error(error)),
        }
    }

    fn write_lines(&self, lines: &[String]) -> Result<(), Error> {
        let mut contents = lines.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }

        fs::write(&self.path, contents).map_err(trust_error)
    }

    fn without_entry(&self, address: &str, identity: &str) -> Result<Vec<String>, Error> {
        let mut lines = self.read_lines()?;
        lines.retain(|line| !matches!(parse_line(line), Some((a, i, _)) if a == address && i == identity));
        Ok(lines)
    }
}

impl TrustStore for FileTrustStore {
    fn lookup(&self, address: &str, identity: &str) -> Result<Option<String>, Error> {
        Ok(self.read_lines()?.iter().find_map(|line| match parse_line(line) {
            Some((a, i, fingerprint)) if a == address && i == identity => Some(fingerprint.to_string()),
            _ => None,
        }))
    }

    fn replace(&mut self, address: &str, identity: &str, fingerprint: &str) -> Result<(), Error> {
        let mut lines = self.without_entry(address, identity)?;
        lines.push(format!("{address}%{identity}={fingerprint}"));
        self.write_lines(&lines)
    }

    fn delete(&mut self, address: &str, identity: &str) -> Result<(), Error> {
        let lines = self.without_entry(address, identity)?;
        self.write_lines(&lines)
    }
}

/// What the trust check needs to know about a connection.
pub struct TrustSubject<'a> {
    /// The peer's certificate. `None` for connections that aren't secured.
    pub credentials: Option<&'a dyn PeerCredentials>,
    pub ip: String,
    pub ip_port: String,
    pub host: String,
    pub host_port: String,
}

impl<'a> TrustSubject<'a> {
    pub fn of<T: Transport>(transport: &'a T) -> Self {
        Self {
            credentials: transport.peer_credentials(),
            ip: transport.peer_address(AddressForm::Ip),
            ip_port: transport.peer_address(AddressForm::IpPort),
            host: transport.peer_address(AddressForm::Host),
            host_port: transport.peer_address(AddressForm::HostPort),
        }
    }
}

enum Pinned {
    Accepted,
    Rejected,
    NotFound,
}

fn check_pinned(store: &mut dyn TrustStore, address: &str, fingerprint: &str, e: &mut RpcError) -> Pinned {
    let stored = match store.lookup(address, PRIMARY_IDENTITY) {
        Ok(stored) => stored,
        Err(error) => {
            e.set(error);
            return Pinned::Rejected;
        }
    };

    if stored.as_deref() == Some(fingerprint) {
        return Pinned::Accepted;
    }

    if let Ok(Some(pending)) = store.lookup(address, PENDING_IDENTITY) {
        if pending == fingerprint {
            info!("Promoting the replacement key of {address}");
            if let Err(error) = store.replace(address, PRIMARY_IDENTITY, fingerprint) {
                e.set(error);
            } else if let Err(error) = store.delete(address, PENDING_IDENTITY) {
                e.set(error);
            }
            return Pinned::Accepted;
        }
    }

    match stored {
        Some(_) => {
            e.set(Error::HostKeyMismatch {
                address: address.to_string(),
                fingerprint: fingerprint.to_string(),
            });
            Pinned::Rejected
        }
        None => Pinned::NotFound,
    }
}

/// Decides whether to trust the peer of a secured connection, recording the reason in `e` if
/// not. Connections that aren't secured are always trusted.
pub fn check_known_host(subject: &TrustSubject<'_>, store: &mut dyn TrustStore, level: CertValidation, e: &mut RpcError) {
    let Some(credentials) = subject.credentials else {
        return;
    };

    let fingerprint = credentials.fingerprint();
    debug!("Checking host {} fingerprint {fingerprint}", subject.ip_port);

    for address in [&subject.ip_port, &subject.host_port] {
        match check_pinned(store, address, fingerprint, e) {
            Pinned::Accepted | Pinned::Rejected => return,
            Pinned::NotFound => {}
        }
    }

    if level != CertValidation::Off && !credentials.is_self_signed() {
        debug!("Checking host {}/{} certificate chain", subject.ip, subject.host);

        // Subject checks stand in for an unknown issuer.
        let critical_only = level == CertValidation::ChainAndSubject;
        credentials.validate_chain(critical_only, e);
        if e.is_fatal() {
            return;
        }

        if level == CertValidation::ChainAndSubject {
            credentials.validate_subject(Some(&subject.host), Some(&subject.ip), e);
        }

        if !e.test() {
            return;
        }
    }

    e.set(Error::HostKeyUnknown {
        address: subject.ip_port.clone(),
        fingerprint: fingerprint.to_string(),
    });
}

/// Pins the peer's current fingerprint as trusted, the "yes, trust this host" answer to an
/// unknown host.
pub fn establish_trust(subject: &TrustSubject<'_>, store: &mut dyn TrustStore) -> Result<(), Error> {
    let Some(credentials) = subject.credentials else {
        return Ok(());
    };

    info!("Trusting {} with fingerprint {}", subject.ip_port, credentials.fingerprint());
    store.replace(&subject.ip_port, PRIMARY_IDENTITY, credentials.fingerprint())
}

/// Pins a fingerprint the host at `address` will switch to, accepted in place of the current one
/// the first time the host presents it.
pub fn install_replacement(address: &str, fingerprint: &str, store: &mut dyn TrustStore) -> Result<(), Error> {
    store.replace(address, PENDING_IDENTITY, fingerprint)
}
