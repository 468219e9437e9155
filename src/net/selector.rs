//! Bounded readiness waits on a socket.

use std::{
    io,
    time::{Duration, Instant},
};

use tokio::{io::Interest, net::TcpStream};

use super::SharedKeepAlive;

/// The longest a single readiness wait may take before the caller gets to re-check its max-wait
/// budget and liveness callback.
pub const SELECT_GRANULARITY: Duration = Duration::from_millis(500);

/// How long to wait for the first bytes from a peer when checking for a protocol mismatch.
pub const PEEK_TIMEOUT: Duration = Duration::from_millis(200);

/// The byte a TLS handshake record starts with.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// The major version byte of every TLS record version.
const TLS_MAJOR_VERSION: u8 = 0x03;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub read: bool,
    pub write: bool,
}

impl Readiness {
    pub const fn new(read: bool, write: bool) -> Self {
        Self { read, write }
    }

    pub const fn any(&self) -> bool {
        self.read || self.write
    }
}

/// Tracks how much of a max-wait budget an operation has used, and slices it into readiness waits
/// short enough for the liveness callback to be polled.
#[derive(Debug, Clone, Copy)]
pub struct WaitBudget {
    start: Instant,
    max_wait: Option<Duration>,
    poll: Option<Duration>,
}

impl WaitBudget {
    pub fn new(max_wait: Option<Duration>, keepalive: Option<&SharedKeepAlive>) -> Self {
        let poll = keepalive.map(|k| match k.poll_ms() {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => SELECT_GRANULARITY,
        });

        Self {
            start: Instant::now(),
            max_wait,
            poll,
        }
    }

    /// The longest the next readiness wait may take. `None` means forever, which only happens
    /// when there's neither a max-wait nor a liveness callback.
    pub fn next_slice(&self) -> Option<Duration> {
        let remaining = self.max_wait.map(|max| max.saturating_sub(self.start.elapsed()));
        match (remaining, self.poll) {
            (Some(remaining), Some(poll)) => Some(remaining.min(poll)),
            (Some(remaining), None) => Some(remaining.min(SELECT_GRANULARITY)),
            (None, poll) => poll,
        }
    }

    pub fn expired(&self) -> bool {
        self.max_wait.is_some_and(|max| self.start.elapsed() >= max)
    }

    /// The configured budget in milliseconds, for error messages.
    pub fn millis(&self) -> u64 {
        self.max_wait.map(|max| max.as_millis() as u64).unwrap_or(0)
    }
}

/// Waits until `stream` is ready for any of the operations in `want`, or until `wait` elapses.
/// A `wait` of `None` waits forever. Returns which of the wanted operations are ready, which is
/// none on timeout.
///
/// Readiness may be spurious: the following `try_read`/`try_write` may still fail with
/// [`io::ErrorKind::WouldBlock`].
pub async fn select(stream: &TcpStream, want: Readiness, wait: Option<Duration>) -> io::Result<Readiness> {
    let interest = match (want.read, want.write) {
        (true, true) => Interest::READABLE.add(Interest::WRITABLE),
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => {
            if let Some(wait) = wait {
                tokio::time::sleep(wait).await;
            }
            return Ok(Readiness::default());
        }
    };

    let ready = match wait {
        Some(wait) => match tokio::time::timeout(wait, stream.ready(interest)).await {
            Ok(result) => result?,
            Err(_) => return Ok(Readiness::default()),
        },
        None => stream.ready(interest).await?,
    };

    Ok(Readiness {
        read: want.read && (ready.is_readable() || ready.is_read_closed()),
        write: want.write && (ready.is_writable() || ready.is_write_closed()),
    })
}

/// Peeks at incoming bytes without consuming them, waiting at most `wait`. Returns `None` if no
/// bytes arrived in time, or `Some(0)` if the peer closed the connection.
pub async fn peek(stream: &TcpStream, buf: &mut [u8], wait: Duration) -> io::Result<Option<usize>> {
    match tokio::time::timeout(wait, stream.peek(buf)).await {
        Ok(result) => result.map(Some),
        Err(_) => Ok(None),
    }
}

/// What the first bytes sent by a peer look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekResult {
    /// The peer started a TLS handshake.
    Tls,

    /// The peer sent something other than a TLS handshake.
    Cleartext,

    /// The peer sent nothing within [`PEEK_TIMEOUT`], or closed the connection.
    Timeout,
}

/// Classifies the first bytes of a TLS record or frame.
pub fn classify(bytes: &[u8]) -> PeekResult {
    match bytes {
        [] => PeekResult::Timeout,
        [TLS_HANDSHAKE_RECORD] => PeekResult::Tls,
        [TLS_HANDSHAKE_RECORD, TLS_MAJOR_VERSION, ..] => PeekResult::Tls,
        _ => PeekResult::Cleartext,
    }
}

/// Peeks at the first bytes sent by the peer to determine whether it's speaking TLS.
pub async fn check_for_handshake(stream: &TcpStream) -> io::Result<PeekResult> {
    let mut buf = [0u8; 3];
    match peek(stream, &mut buf, PEEK_TIMEOUT).await? {
        None | Some(0) => Ok(PeekResult::Timeout),
        Some(len) => Ok(classify(&buf[..len])),
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tokio::{
        io::AsyncWriteExt,
        net::{TcpListener, TcpStream},
    };

    use super::{check_for_handshake, classify, select, PeekResult, Readiness, WaitBudget, SELECT_GRANULARITY};
    use crate::net::SharedKeepAlive;

    #[test]
    fn test_wait_budget_slices() {
        assert_eq!(WaitBudget::new(None, None).next_slice(), None);

        let budget = WaitBudget::new(Some(Duration::from_millis(200)), None);
        assert!(budget.next_slice().unwrap() <= Duration::from_millis(200));
        assert!(!budget.expired());

        let budget = WaitBudget::new(Some(Duration::from_secs(60)), None);
        assert_eq!(budget.next_slice(), Some(SELECT_GRANULARITY));

        let keepalive: SharedKeepAlive = std::sync::Arc::new(|| true);
        assert_eq!(WaitBudget::new(None, Some(&keepalive)).next_slice(), Some(SELECT_GRANULARITY));

        let budget = WaitBudget::new(Some(Duration::ZERO), None);
        assert!(budget.expired());
        assert_eq!(budget.next_slice(), Some(Duration::ZERO));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&[0x16, 0x03, 0x01]), PeekResult::Tls);
        assert_eq!(classify(&[0x16]), PeekResult::Tls);
        assert_eq!(classify(&[0x16, 0x07]), PeekResult::Cleartext);
        assert_eq!(classify(b"GET"), PeekResult::Cleartext);
        assert_eq!(classify(&[]), PeekResult::Timeout);
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_select_times_out_without_data() {
        let (_client, server) = pair().await;

        let start = Instant::now();
        let ready = select(&server, Readiness::new(true, false), Some(Duration::from_millis(100))).await.unwrap();
        assert!(!ready.any());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_select_sees_writable_and_readable() {
        let (mut client, server) = pair().await;

        let ready = select(&server, Readiness::new(false, true), Some(Duration::from_secs(1))).await.unwrap();
        assert!(ready.write);

        client.write_all(b"hello").await.unwrap();
        let ready = select(&server, Readiness::new(true, false), Some(Duration::from_secs(1))).await.unwrap();
        assert!(ready.read);
    }

    #[tokio::test]
    async fn test_check_for_handshake() {
        let (mut client, server) = pair().await;
        assert_eq!(check_for_handshake(&server).await.unwrap(), PeekResult::Timeout);

        client.write_all(&[0x16, 0x03, 0x01, 0x00, 0x10]).await.unwrap();
        assert_eq!(check_for_handshake(&server).await.unwrap(), PeekResult::Tls);

        // Peeking doesn't consume, so the answer doesn't change.
        assert_eq!(check_for_handshake(&server).await.unwrap(), PeekResult::Tls);
    }
}
