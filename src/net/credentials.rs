//! Certificates presented by TLS peers, and the certificate a TLS listener presents.

use std::{
    fmt,
    net::IpAddr,
    sync::Arc,
    time::SystemTime,
};

use rustls::{
    client::{ServerCertVerifier, WebPkiVerifier},
    Certificate, CertificateError, PrivateKey, RootCertStore, ServerName,
};
use sha2::{Digest, Sha256};
use x509_parser::{extensions::GeneralName, parse_x509_certificate};

use crate::error::{Error, RpcError};

/// The certificate material a secure transport obtained from its peer.
pub trait PeerCredentials {
    /// The peer's own (leaf) certificate.
    fn certificate(&self) -> &Certificate;

    /// The certificate at position `index` of the chain presented by the peer, the leaf being at
    /// position 0.
    fn chain(&self, index: usize) -> Option<&Certificate>;

    /// The fingerprint of the peer's public key, as uppercase hex bytes separated by colons.
    fn fingerprint(&self) -> &str;

    /// Validates the presented chain against the trusted roots. Non-critical problems (unknown
    /// issuer, unsuitable purpose) are ignored when `critical_only` is set.
    fn validate_chain(&self, critical_only: bool, e: &mut RpcError);

    /// Validates that the certificate's subject (common name or subject alternative names)
    /// matches the given host name or IP address.
    fn validate_subject(&self, name: Option<&str>, ip: Option<&str>, e: &mut RpcError);

    fn is_self_signed(&self) -> bool;
}

/// Computes the fingerprint of a DER certificate's public key.
pub fn fingerprint_of(der: &[u8]) -> Result<String, Error> {
    let (_, cert) = parse_x509_certificate(der).map_err(|e| Error::CertMalformed(e.to_string()))?;
    Ok(format_fingerprint(&Sha256::digest(cert.public_key().raw)))
}

fn format_fingerprint(digest: &[u8]) -> String {
    let mut s = String::with_capacity(digest.len() * 3);
    for (i, b) in digest.iter().enumerate() {
        if i != 0 {
            s.push(':');
        }
        s.push_str(&format!("{b:02X}"));
    }

    s
}

/// Credentials parsed from an X.509 chain received during a TLS handshake.
pub struct X509Credentials {
    chain: Vec<Certificate>,
    roots: Arc<RootCertStore>,
    fingerprint: String,
    common_name: Option<String>,
    dns_names: Vec<String>,
    ip_addresses: Vec<IpAddr>,
    malformed: Option<String>,
    self_signed: bool,
    in_date_range: bool,
}

impl X509Credentials {
    /// Parses the peer's chain. Fails if there's no certificate or the leaf can't be parsed.
    pub fn new(chain: Vec<Certificate>, roots: Arc<RootCertStore>) -> Result<Self, Error> {
        let leaf = chain.first().ok_or_else(|| Error::CertMalformed("peer presented no certificate".into()))?;
        let (_, cert) = parse_x509_certificate(&leaf.0).map_err(|e| Error::CertMalformed(e.to_string()))?;

        let fingerprint = format_fingerprint(&Sha256::digest(cert.public_key().raw));
        let mut malformed = None;

        let common_name = match cert.subject().iter_common_name().next().map(|cn| cn.as_str()) {
            Some(Ok(cn)) if cn.contains('\0') => {
                malformed = Some("common name contains a NUL byte".into());
                None
            }
            Some(Ok(cn)) => Some(cn.to_string()),
            Some(Err(e)) => {
                malformed = Some(e.to_string());
                None
            }
            None => None,
        };

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        match cert.subject_alternative_name() {
            Ok(Some(san)) => {
                for name in &san.value.general_names {
                    match name {
                        GeneralName::DNSName(dns) if dns.contains('\0') => malformed = Some("DNS name contains a NUL byte".into()),
                        GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                        GeneralName::IPAddress(bytes) => match ip_from_bytes(bytes) {
                            Some(ip) => ip_addresses.push(ip),
                            None => malformed = Some(format!("IP address of {} bytes", bytes.len())),
                        },
                        _ => {}
                    }
                }
            }
            Ok(None) => {}
            Err(e) => malformed = Some(e.to_string()),
        }

        let self_signed = cert.subject().as_raw() == cert.issuer().as_raw();
        let in_date_range = cert.validity().is_valid();

        Ok(Self {
            chain,
            roots,
            fingerprint,
            common_name,
            dns_names,
            ip_addresses,
            malformed,
            self_signed,
            in_date_range,
        })
    }

    /// Fails if the current time is outside the certificate's validity period.
    pub fn check_date_range(&self) -> Result<(), Error> {
        match self.in_date_range {
            true => Ok(()),
            false => Err(Error::CertDateRange),
        }
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Matches `name` against a `*.example.com` pattern. The wildcard covers exactly one label.
fn wildcard_matches(pattern: &str, name: &str) -> bool {
    let Some(suffix) = pattern.strip_prefix('*') else {
        return false;
    };

    match name.find('.') {
        Some(dot) if dot > 0 && suffix.starts_with('.') => name[dot..].eq_ignore_ascii_case(suffix),
        _ => false,
    }
}

impl PeerCredentials for X509Credentials {
    fn certificate(&self) -> &Certificate {
        &self.chain[0]
    }

    fn chain(&self, index: usize) -> Option<&Certificate> {
        self.chain.get(index)
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn validate_chain(&self, critical_only: bool, e: &mut RpcError) {
        let verifier = WebPkiVerifier::new((*self.roots).clone(), None);

        // Any name will do, subject checks are done separately.
        let Ok(server_name) = ServerName::try_from("localhost") else {
            return;
        };

        let result = verifier.verify_server_cert(
            &self.chain[0],
            &self.chain[1..],
            &server_name,
            &mut std::iter::empty(),
            &[],
            SystemTime::now(),
        );

        match result {
            Ok(_) => {}
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {}
            Err(rustls::Error::InvalidCertificate(err @ (CertificateError::UnknownIssuer | CertificateError::InvalidPurpose))) => {
                if !critical_only {
                    e.set(Error::CertBadChain(format!("{err:?}")));
                }
            }
            Err(rustls::Error::InvalidCertificate(err)) => e.set(Error::CertBad(format!("{err:?}"))),
            Err(err) => e.set(Error::CertBad(err.to_string())),
        }
    }

    fn validate_subject(&self, name: Option<&str>, ip: Option<&str>, e: &mut RpcError) {
        if let Some(reason) = &self.malformed {
            e.set(Error::CertMalformed(reason.clone()));
            return;
        }

        let name = name.filter(|n| !n.is_empty());
        let ip = ip.filter(|i| !i.is_empty());

        if let Some(cn) = &self.common_name {
            let cn_matches = |candidate: Option<&str>| candidate.is_some_and(|c| c.eq_ignore_ascii_case(cn));
            if cn_matches(name) || cn_matches(ip) || name.is_some_and(|n| wildcard_matches(cn, n)) {
                return;
            }
        }

        if let Some(name) = name {
            if self.dns_names.iter().any(|dns| dns.eq_ignore_ascii_case(name) || wildcard_matches(dns, name)) {
                return;
            }
        }

        if let Some(ip) = ip.and_then(|i| i.parse::<IpAddr>().ok()) {
            if self.ip_addresses.contains(&ip) {
                return;
            }
        }

        e.set(Error::CertBadSubject {
            common_name: self.common_name.clone().unwrap_or_default(),
            name: name.or(ip).unwrap_or_default().to_string(),
        });
    }

    fn is_self_signed(&self) -> bool {
        self.self_signed
    }
}

/// The certificate chain and private key a TLS listener presents.
#[derive(Clone)]
pub struct ServerCredentials {
    pub cert_chain: Vec<Certificate>,
    pub key: PrivateKey,
}

impl fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCredentials")
            .field("cert_chain", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

impl ServerCredentials {
    pub fn new(cert_chain: Vec<Certificate>, key: PrivateKey) -> Self {
        Self { cert_chain, key }
    }

    /// Generates a self-signed certificate valid for the given names.
    pub fn generate_self_signed(subject_alt_names: Vec<String>) -> Result<Self, Error> {
        let cert = rcgen::generate_simple_self_signed(subject_alt_names).map_err(|e| Error::SslConfig(e.to_string()))?;
        let cert_der = cert.serialize_der().map_err(|e| Error::SslConfig(e.to_string()))?;
        let key = PrivateKey(cert.serialize_private_key_der());
        Ok(Self::new(vec![Certificate(cert_der)], key))
    }

    /// The fingerprint peers will see for this certificate.
    pub fn fingerprint(&self) -> Result<String, Error> {
        let leaf = self.cert_chain.first().ok_or_else(|| Error::SslConfig("empty certificate chain".into()))?;
        fingerprint_of(&leaf.0)
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rustls::RootCertStore;

    use super::{
        format_fingerprint,
        test_certs::{make_ca, make_leaf},
        wildcard_matches, PeerCredentials, ServerCredentials, X509Credentials,
    };
    use crate::error::{Error, RpcError};

    fn roots(certs: &[&rustls::Certificate]) -> Arc<RootCertStore> {
        let mut store = RootCertStore::empty();
        for cert in certs {
            store.add(cert).unwrap();
        }
        Arc::new(store)
    }

    #[test]
    fn test_fingerprint_format() {
        assert_eq!(format_fingerprint(&[0x0a, 0xff, 0x00]), "0A:FF:00");
        assert_eq!(format_fingerprint(&[]), "");
    }

    #[test]
    fn test_self_signed_credentials() {
        let server = ServerCredentials::generate_self_signed(vec!["localhost".into()]).unwrap();
        let creds = X509Credentials::new(server.cert_chain.clone(), roots(&[])).unwrap();

        assert!(creds.is_self_signed());
        assert!(creds.check_date_range().is_ok());
        assert_eq!(creds.fingerprint(), server.fingerprint().unwrap());
        assert_eq!(creds.fingerprint().len(), 32 * 3 - 1);
        assert_eq!(creds.certificate(), &server.cert_chain[0]);
        assert!(creds.chain(1).is_none());
    }

    #[test]
    fn test_empty_chain_is_malformed() {
        assert!(matches!(X509Credentials::new(Vec::new(), roots(&[])), Err(Error::CertMalformed(_))));
    }

    #[test]
    fn test_chain_validation() {
        let ca = make_ca();
        let leaf = make_leaf(&ca, "perforce.example.com", &["perforce.example.com"], &[]);

        let trusted = X509Credentials::new(leaf.cert_chain.clone(), roots(&[&ca.der])).unwrap();
        assert!(!trusted.is_self_signed());
        let mut e = RpcError::new();
        trusted.validate_chain(false, &mut e);
        assert!(!e.test(), "{e}");

        let untrusted = X509Credentials::new(leaf.cert_chain.clone(), roots(&[])).unwrap();
        let mut e = RpcError::new();
        untrusted.validate_chain(false, &mut e);
        assert!(matches!(e.first(), Some(Error::CertBadChain(_))));
        assert!(!e.is_fatal());

        let mut e = RpcError::new();
        untrusted.validate_chain(true, &mut e);
        assert!(!e.test());
    }

    #[test]
    fn test_subject_validation() {
        let ca = make_ca();
        let leaf = make_leaf(&ca, "*.example.com", &["perforce.internal"], &["10.1.2.3"]);
        let creds = X509Credentials::new(leaf.cert_chain, roots(&[&ca.der])).unwrap();
        assert_eq!(creds.common_name(), Some("*.example.com"));

        let check = |name: Option<&str>, ip: Option<&str>| {
            let mut e = RpcError::new();
            creds.validate_subject(name, ip, &mut e);
            e
        };

        assert!(!check(Some("perforce.example.com"), None).test());
        assert!(!check(Some("PERFORCE.Example.com"), None).test());
        assert!(!check(Some("perforce.internal"), None).test());
        assert!(!check(None, Some("10.1.2.3")).test());

        let e = check(Some("a.b.example.org"), Some("10.9.9.9"));
        assert!(matches!(e.first(), Some(Error::CertBadSubject { name, .. }) if name == "a.b.example.org"));
    }

    #[test]
    fn test_wildcards() {
        assert!(wildcard_matches("*.example.com", "www.example.com"));
        assert!(!wildcard_matches("*.example.com", "example.com"));
        assert!(!wildcard_matches("*.example.com", ".example.com"));
        assert!(!wildcard_matches("www.example.com", "www.example.com"));
        assert!(!wildcard_matches("*example.com", "wwwexample.com"));
    }
}
