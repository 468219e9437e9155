//! Tunables controlling timeouts, flow-control water marks and TLS behavior.

use std::{fmt, time::Duration};

use rustls::Certificate;

use crate::{error::Error, net::credentials::ServerCredentials};

/// The default minimum for auto-derived high-marks.
pub const DEFAULT_HI_MARK_FLOOR: usize = 2000;

/// The default low-mark. Once this many unacknowledged bytes are outstanding, a flow marker is
/// sent before further application data.
pub const DEFAULT_LO_MARK: usize = 700;

/// How many bytes may be read ahead opportunistically while a send is in progress.
pub const DEFAULT_RECV_BUFFERING: usize = 0x10000;

/// The default bounded wait for the peer's half-close when closing a connection.
pub const DEFAULT_CLOSE_MAX_WAIT: Duration = Duration::from_millis(1000);

/// The default TLS handshake timeout.
pub const DEFAULT_HANDSHAKE_MAX_WAIT: Duration = Duration::from_secs(30);

/// Linux reports socket buffer sizes twice as large as what's usable for data. Only this percent
/// of the reported size is used.
pub const DEFAULT_BUFFER_FUDGE_PERCENT: usize = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().trim_start_matches("tls").trim_start_matches('v') {
            "1.2" | "12" => Some(Self::Tls12),
            "1.3" | "13" => Some(Self::Tls13),
            _ => None,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls12 => write!(f, "TLSv1.2"),
            Self::Tls13 => write!(f, "TLSv1.3"),
        }
    }
}

/// How much checking is done on a TLS peer's certificate when it isn't pinned in the trust
/// store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertValidation {
    /// Only pinned fingerprints are accepted.
    Off,

    /// The certificate chain must validate against the trusted roots.
    #[default]
    ChainOnly,

    /// The subject must match the address that was connected to, and the chain must be sound.
    /// An issuer missing from the trusted roots is tolerated.
    ChainAndSubject,
}

/// The high-mark policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiMark {
    /// Derived from the socket buffer sizes advertised during protocol negotiation, never going
    /// below `floor`.
    Auto { floor: usize },

    /// Pinned to this value, ignoring buffer sizes.
    Fixed(usize),
}

impl HiMark {
    pub fn initial(&self) -> usize {
        match *self {
            Self::Auto { floor } => floor,
            Self::Fixed(mark) => mark,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub idle: Option<Duration>,
    pub interval: Option<Duration>,
}

impl KeepAliveConfig {
    pub const fn new() -> Self {
        Self {
            enabled: true,
            idle: None,
            interval: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,

    /// TLS 1.2 cipher suite names overriding the defaults, e.g.
    /// `TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384`.
    pub cipher_list: Option<Vec<String>>,

    /// TLS 1.3 cipher suite names overriding the defaults, e.g. `TLS13_AES_256_GCM_SHA384`.
    pub cipher_suites: Option<Vec<String>>,
}

impl TlsSettings {
    pub const fn new() -> Self {
        Self {
            min_version: TlsVersion::Tls12,
            max_version: TlsVersion::Tls13,
            cipher_list: None,
            cipher_suites: None,
        }
    }
}

/// Configuration shared by every connection of a service.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Bound on any single send or receive. `None` waits forever.
    pub max_wait: Option<Duration>,
    pub connect_max_wait: Option<Duration>,
    pub accept_max_wait: Option<Duration>,
    pub close_max_wait: Duration,
    pub handshake_max_wait: Duration,
    pub keepalive: KeepAliveConfig,
    pub recv_buffering: usize,
    pub buffer_fudge_percent: usize,
    pub hi_mark: HiMark,
    pub lo_mark: usize,
    pub tls: TlsSettings,
    pub cert_validation: CertValidation,

    /// DER certificates trusted as chain anchors.
    pub trusted_roots: Vec<Certificate>,

    /// The certificate presented by TLS listeners. If `None`, one is generated on listen.
    pub server_credentials: Option<ServerCredentials>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, Error> {
    value.trim().parse().map_err(|_| Error::BadTunable(format!("{name}={value}")))
}

/// Parses a flow-control mark, which the engine does signed arithmetic on.
fn parse_mark(name: &str, value: &str) -> Result<usize, Error> {
    let mark: usize = parse_number(name, value)?;
    match i64::try_from(mark) {
        Ok(_) => Ok(mark),
        Err(_) => Err(Error::BadTunable(format!("{name}={value}"))),
    }
}

fn non_zero_millis(millis: u64) -> Option<Duration> {
    match millis {
        0 => None,
        m => Some(Duration::from_millis(m)),
    }
}

fn parse_name_list(value: &str) -> Option<Vec<String>> {
    let names: Vec<String> = value.split(':').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
    match names.is_empty() {
        true => None,
        false => Some(names),
    }
}

impl RpcConfig {
    pub const fn new() -> Self {
        Self {
            max_wait: None,
            connect_max_wait: None,
            accept_max_wait: None,
            close_max_wait: DEFAULT_CLOSE_MAX_WAIT,
            handshake_max_wait: DEFAULT_HANDSHAKE_MAX_WAIT,
            keepalive: KeepAliveConfig::new(),
            recv_buffering: DEFAULT_RECV_BUFFERING,
            buffer_fudge_percent: DEFAULT_BUFFER_FUDGE_PERCENT,
            hi_mark: HiMark::Auto {
                floor: DEFAULT_HI_MARK_FLOOR,
            },
            lo_mark: DEFAULT_LO_MARK,
            tls: TlsSettings::new(),
            cert_validation: CertValidation::ChainOnly,
            trusted_roots: Vec::new(),
            server_credentials: None,
        }
    }

    pub fn add_trusted_root(&mut self, der: Vec<u8>) {
        self.trusted_roots.push(Certificate(der));
    }

    /// Sets a tunable by its dotted name, e.g. `set_tunable("net.maxwait", "60")`.
    pub fn set_tunable(&mut self, name: &str, value: &str) -> Result<(), Error> {
        match name {
            "net.maxwait" => self.max_wait = non_zero_millis(parse_number::<u64>(name, value)?.saturating_mul(1000)),
            "net.maxwait.ms" => self.max_wait = non_zero_millis(parse_number(name, value)?),
            "net.connect.maxwait" => self.connect_max_wait = non_zero_millis(parse_number(name, value)?),
            "net.accept.maxwait" => self.accept_max_wait = non_zero_millis(parse_number(name, value)?),
            "net.maxclosewait" => self.close_max_wait = Duration::from_millis(parse_number(name, value)?),
            "net.keepalive.disable" => self.keepalive.enabled = parse_number::<u32>(name, value)? == 0,
            "net.keepalive.idle" => self.keepalive.idle = non_zero_millis(parse_number::<u64>(name, value)?.saturating_mul(1000)),
            "net.keepalive.interval" => self.keepalive.interval = non_zero_millis(parse_number::<u64>(name, value)?.saturating_mul(1000)),
            "net.recvbuffering" => self.recv_buffering = parse_number(name, value)?,
            "ssl.client.timeout" => self.handshake_max_wait = Duration::from_secs(parse_number(name, value)?),
            "ssl.tls.version.min" => {
                self.tls.min_version = TlsVersion::parse(value).ok_or_else(|| Error::BadTunable(format!("{name}={value}")))?
            }
            "ssl.tls.version.max" => {
                self.tls.max_version = TlsVersion::parse(value).ok_or_else(|| Error::BadTunable(format!("{name}={value}")))?
            }
            "ssl.cipher.list" => self.tls.cipher_list = parse_name_list(value),
            "ssl.cipher.suites" => self.tls.cipher_suites = parse_name_list(value),
            "ssl.client.cert.validate" => {
                self.cert_validation = match parse_number::<u32>(name, value)? {
                    0 => CertValidation::Off,
                    1 => CertValidation::ChainOnly,
                    2 => CertValidation::ChainAndSubject,
                    _ => return Err(Error::BadTunable(format!("{name}={value}"))),
                }
            }
            "rpc.himark" => self.hi_mark = HiMark::Fixed(parse_mark(name, value)?),
            "rpc.himark.floor" => {
                let floor = parse_mark(name, value)?;
                if let HiMark::Auto { floor: f } = &mut self.hi_mark {
                    *f = floor;
                }
            }
            "rpc.lowmark" => self.lo_mark = parse_mark(name, value)?,
            "rpc.buffer.fudge" => {
                let percent = parse_number(name, value)?;
                if !(1..=100).contains(&percent) {
                    return Err(Error::BadTunable(format!("{name}={value}")));
                }
                self.buffer_fudge_percent = percent;
            }
            _ => return Err(Error::BadTunable(format!("unknown tunable '{name}'"))),
        }

        Ok(())
    }

    /// Sets a tunable from a `name=value` string.
    pub fn set_tunable_v(&mut self, spec: &str) -> Result<(), Error> {
        match spec.split_once('=') {
            Some((name, value)) => self.set_tunable(name.trim(), value),
            None => Err(Error::BadTunable(format!("expected name=value, got '{spec}'"))),
        }
    }
}
