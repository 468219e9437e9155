//! Per-connection performance counters.

use std::{fmt, time::Duration};

const MEGABYTE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcTrack {
    pub send_count: u64,
    pub send_bytes: u64,
    pub recv_count: u64,
    pub recv_bytes: u64,
    pub send_time: Duration,
    pub recv_time: Duration,

    /// The most forward-direction bytes that were ever outstanding at once.
    pub max_frecv: i64,
}

impl RpcTrack {
    pub const fn new() -> Self {
        Self {
            send_count: 0,
            send_bytes: 0,
            recv_count: 0,
            recv_bytes: 0,
            send_time: Duration::ZERO,
            recv_time: Duration::ZERO,
            max_frecv: 0,
        }
    }

    pub(crate) fn sent(&mut self, bytes: usize, elapsed: Duration) {
        self.send_count += 1;
        self.send_bytes += bytes as u64;
        self.send_time += elapsed;
    }

    pub(crate) fn received(&mut self, bytes: usize, elapsed: Duration) {
        self.recv_count += 1;
        self.recv_bytes += bytes as u64;
        self.recv_time += elapsed;
    }

    pub(crate) fn observe_frecv(&mut self, frecv: i64) {
        self.max_frecv = self.max_frecv.max(frecv);
    }
}

/// A summary of a connection's traffic, meant for logs.
#[derive(Debug, Clone)]
pub struct TrackReport {
    pub track: RpcTrack,
    pub hi_mark_fwd: usize,
    pub hi_mark_rev: usize,
    pub send_error: bool,
    pub recv_error: bool,
    pub frecv: i64,
    pub rrecv: i64,
}

impl fmt::Display for TrackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.track;
        write!(
            f,
            "rpc msgs/size in+out {}+{}/{}mb+{}mb himarks {}/{} snd/rcv {:.3}s/{:.3}s",
            t.recv_count,
            t.send_count,
            t.recv_bytes / MEGABYTE,
            t.send_bytes / MEGABYTE,
            self.hi_mark_fwd,
            self.hi_mark_rev,
            t.send_time.as_secs_f64(),
            t.recv_time.as_secs_f64(),
        )?;

        if self.send_error || self.recv_error {
            write!(f, ", rpc ")?;
            if self.send_error {
                write!(f, "send ")?;
            }
            if self.recv_error {
                write!(f, "receive ")?;
            }
            write!(f, "errors, duplexing F/R {}/{}", self.frecv, self.rrecv)?;
        }

        Ok(())
    }
}
