//! One connection's worth of RPC: invoking functions on the peer, and dispatching the functions
//! the peer invokes on us.
//!
//! # Duplex flow control
//! When both peers push large amounts of data at each other without reading, both socket send
//! buffers fill up and the connection deadlocks. To avoid this, the engine meters every message
//! that makes a loop (one whose handling produces data coming back) in four counters:
//!
//! | counter | meaning                                                           |
//! |---------|-------------------------------------------------------------------|
//! | `fsend` | forward bytes sent since the last flow marker                     |
//! | `frecv` | forward bytes whose acknowledgement hasn't come back yet          |
//! | `rsend` | reverse-clogging messages sent since the last flow marker         |
//! | `rrecv` | reverse-clogging messages whose acknowledgement hasn't come back  |
//!
//! Once `fsend` goes above the low-mark, a `flush1` marker carrying the counters is sent, which
//! the peer echoes back as `flush2` once it got that far. Once `frecv` goes above the high-mark,
//! the engine stops sending and dispatches incoming messages until enough acknowledgements came
//! back.
//!
//! # Dispatch modes
//! | mode       | low-mark | high-mark                  | dispatches while                       |
//! |------------|----------|----------------------------|----------------------------------------|
//! | `Complete` | 0        | n/a                        | until released                         |
//! | `Duplex`   | low      | reverse if `rrecv`, else forward | `frecv` above the high-mark      |
//! | `Flush`    | 0        | 0                          | any `frecv` is outstanding             |
//! | `Over`     | 0        | forward                    | `frecv` above the high-mark            |
//! | `Contain`  | 0        | n/a                        | the last handler raised no error       |
//!
//! Whatever the mode, the loop keeps receiving after a send error, as the peer may still be
//! sending the messages explaining it.

use std::{mem, sync::Arc, time::Duration, time::Instant};

use p4rpc_proto::{encode_message, tags, take_frame, MessageDict, SEND_OVERHEAD};
use tracing::{debug, error, trace, warn};

use super::{
    service::RpcService,
    track::{RpcTrack, TrackReport},
    transport::RpcTransport,
};
use crate::{
    config::HiMark,
    error::{DuplexError, Error, RpcError},
    net::{credentials::PeerCredentials, AddressForm, NetTransport, SharedKeepAlive, Transport},
    trust::{self, TrustStore, TrustSubject},
};

/// The size a flow marker is accounted as, rounded up from what it takes on the wire.
pub const FLUSH_MESSAGE_SIZE: i64 = 60;

/// The deepest [`Rpc::dispatch`] calls may nest.
pub const MAX_DISPATCH_DEPTH: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Dispatch until the peer releases us. Used at the top level.
    Complete,

    /// Dispatch just enough to bring outstanding data below the high-mark.
    Duplex,

    /// Dispatch until every outstanding byte was acknowledged.
    Flush,

    /// Like [`DispatchMode::Duplex`], but without keeping the low-mark, so outstanding data is
    /// left for an outer dispatch loop to handle.
    Over,

    /// Dispatch on behalf of a paused outer loop, without counting toward the nesting depth,
    /// until a handler raises an error. Errors aren't reported, they're left for the caller in
    /// [`Rpc::last_error`].
    Contain,
}

/// The duplex flow-control counters. See the [module docs](self).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowCounters {
    pub fsend: i64,
    pub frecv: i64,
    pub rsend: i64,
    pub rrecv: i64,
}

fn signed_mark(mark: usize) -> i64 {
    i64::try_from(mark).unwrap_or(i64::MAX)
}

pub struct Rpc {
    service: Arc<RpcService>,
    transport: Option<RpcTransport>,

    send: MessageDict,
    recv: MessageDict,
    proto_dynamic: MessageDict,
    peer_protocol: MessageDict,

    flow: FlowCounters,
    hi_mark_fwd: usize,
    hi_mark_rev: usize,
    lo_mark: usize,

    dispatch_depth: u32,
    end_dispatch: bool,
    protocol_sent: bool,
    priority_dispatch: bool,

    errors: DuplexError,
    last_error: RpcError,

    keepalive: Option<SharedKeepAlive>,
    track: RpcTrack,
}

impl Rpc {
    pub fn new(service: Arc<RpcService>) -> Self {
        let config = service.config();
        let hi_mark = config.hi_mark.initial();
        let lo_mark = config.lo_mark;

        Self {
            service,
            transport: None,
            send: MessageDict::new(),
            recv: MessageDict::new(),
            proto_dynamic: MessageDict::new(),
            peer_protocol: MessageDict::new(),
            flow: FlowCounters::default(),
            hi_mark_fwd: hi_mark,
            hi_mark_rev: hi_mark,
            lo_mark,
            dispatch_depth: 0,
            end_dispatch: false,
            protocol_sent: false,
            priority_dispatch: false,
            errors: DuplexError::new(),
            last_error: RpcError::new(),
            keepalive: None,
            track: RpcTrack::new(),
        }
    }

    pub fn service(&self) -> &Arc<RpcService> {
        &self.service
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Opens a connection through the service's endpoint, accepting or connecting depending on
    /// whether it listens. On failure the error is also kept as both the send and the receive
    /// error, so later invocations and dispatches do nothing.
    pub async fn connect(&mut self) -> Result<(), Error> {
        if self.transport.is_some() {
            return Err(Error::Reconnect);
        }

        self.send.clear();
        self.flow = FlowCounters::default();
        self.dispatch_depth = 0;
        self.end_dispatch = false;
        self.protocol_sent = false;
        self.errors.clear();

        let mut net = match self.service.open().await {
            Ok(net) => net,
            Err(error) => {
                debug!(%error, "Rpc connect failed");
                self.errors.set_both(error.clone());
                return Err(error);
            }
        };

        if let Some(keepalive) = &self.keepalive {
            net.set_break(Some(Arc::clone(keepalive)));
        }

        net.set_buffer_sizes(self.hi_mark_fwd, self.hi_mark_rev);
        debug!("Rpc connected to {}", net.peer_address(AddressForm::IpPort));

        self.transport = Some(RpcTransport::new(net, self.service.config().recv_buffering));
        Ok(())
    }

    /// Closes the connection. A later [`connect`](Self::connect) opens a new one.
    pub async fn disconnect(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };

        transport.close().await;
        debug!("{}", self.track_report());
    }

    // ---- Variables ----

    /// Adds a variable to the message being built.
    pub fn set_var(&mut self, name: impl Into<String>, value: impl AsRef<[u8]>) {
        self.send.set_var(name, value);
    }

    pub fn set_var_indexed(&mut self, name: &str, index: usize, value: impl AsRef<[u8]>) {
        self.send.set_var_indexed(name, index, value);
    }

    pub fn add_arg(&mut self, value: impl AsRef<[u8]>) {
        self.send.add_arg(value);
    }

    /// Discards the message being built.
    pub fn clear_vars(&mut self) {
        self.send.clear();
    }

    /// Stages every variable of the received message for sending, except its function name.
    pub fn copy_vars(&mut self) {
        for (name, value) in self.recv.iter().filter(|(name, _)| *name != tags::FUNC) {
            self.send.set_var(name, value);
        }
    }

    /// Gets a variable of the message being dispatched.
    pub fn get_var(&self, name: &str) -> Option<&[u8]> {
        self.recv.get_var(name)
    }

    pub fn get_var_str(&self, name: &str) -> Option<&str> {
        self.recv.get_var_str(name)
    }

    pub fn get_var_int(&self, name: &str) -> Option<i64> {
        self.recv.get_var_int(name)
    }

    pub fn get_var_indexed(&self, name: &str, index: usize) -> Option<&[u8]> {
        self.recv.get_var_indexed(name, index)
    }

    pub fn get_var_at(&self, index: usize) -> Option<(&str, &[u8])> {
        self.recv.get_var_at(index)
    }

    pub fn var_count(&self) -> usize {
        self.recv.len()
    }

    pub fn remove_var(&mut self, name: &str) -> bool {
        self.recv.remove_var(name)
    }

    pub fn arg_count(&self) -> usize {
        self.recv.arg_count()
    }

    pub fn get_arg(&self, index: usize) -> Option<&[u8]> {
        self.recv.get_arg(index)
    }

    pub fn send_vars(&self) -> &MessageDict {
        &self.send
    }

    pub fn recv_vars(&self) -> &MessageDict {
        &self.recv
    }

    /// Moves the message being built into the received message, as if it had gone to the peer
    /// and back.
    pub fn loopback(&mut self) -> Result<(), Error> {
        let mut frame = encode_message(&self.send).map_err(|e| Error::Malformed(e.to_string()))?;
        self.send.clear();

        match take_frame(&mut frame) {
            Ok(Some((dict, _))) => {
                self.recv = dict;
                Ok(())
            }
            Ok(None) => Err(Error::Malformed("truncated frame".into())),
            Err(error) => Err(Error::Malformed(error.to_string())),
        }
    }

    // ---- Protocol ----

    /// Sets a variable sent in this connection's protocol message, on top of the service's.
    pub fn set_protocol_dynamic(&mut self, name: &str, value: impl AsRef<[u8]>) {
        self.proto_dynamic.replace_var(name, value);
    }

    pub fn clear_protocol_dynamic(&mut self, name: &str) {
        self.proto_dynamic.remove_var(name);
    }

    /// The variables the peer sent in its protocol message.
    pub fn peer_protocol(&self) -> &MessageDict {
        &self.peer_protocol
    }

    pub(crate) fn got_protocol(&mut self) {
        self.peer_protocol = self.recv.iter().filter(|(name, _)| *name != tags::FUNC).collect();

        let sndbuf = self.recv.get_var_int(tags::SNDBUF);
        let rcvbuf = self.recv.get_var_int(tags::RCVBUF);
        if let (Some(sndbuf), Some(rcvbuf)) = (sndbuf, rcvbuf) {
            self.set_hi_mark(sndbuf.max(0) as usize, rcvbuf.max(0) as usize);
        }
    }

    /// Derives the high-marks from the peer's advertised socket buffer sizes. Data sent forward
    /// waits in our receive buffer on the way back, reverse data in the peer's. Both are kept
    /// a low-mark short of the buffer size, so that a message sent right below the high-mark
    /// still fits. Does nothing if the high-mark was pinned in the configuration.
    pub fn set_hi_mark(&mut self, sndbuf: usize, rcvbuf: usize) {
        let HiMark::Auto { floor } = self.service.config().hi_mark else {
            return;
        };

        let Some(transport) = &mut self.transport else {
            return;
        };

        let recv_buffering = transport.net().recv_buffering();
        self.hi_mark_fwd = recv_buffering.saturating_sub(self.lo_mark).max(floor);
        self.hi_mark_rev = rcvbuf.saturating_sub(self.lo_mark).max(floor);
        transport.net_mut().set_buffer_sizes(self.hi_mark_fwd, self.hi_mark_rev);

        debug!(
            "Rpc himark: snd+rcv local {}+{recv_buffering} peer {sndbuf}+{rcvbuf} = {}/{}",
            transport.net().send_buffering(),
            self.hi_mark_fwd,
            self.hi_mark_rev
        );
    }

    /// The forward and reverse high-marks.
    pub fn hi_marks(&self) -> (usize, usize) {
        (self.hi_mark_fwd, self.hi_mark_rev)
    }

    pub fn flow(&self) -> FlowCounters {
        self.flow
    }

    // ---- Invoking ----

    /// Sends the message built so far as a call to `name`, without any flow accounting.
    /// Returns how many bytes it took on the wire, or 0 if it wasn't sent.
    ///
    /// The first message of a connection is preceded by the protocol message. Nothing is sent
    /// once a send or receive error was recorded.
    pub async fn invoke_one(&mut self, name: &str) -> usize {
        if self.errors.test() {
            self.send.clear();
            return 0;
        }

        let Some(transport) = &mut self.transport else {
            self.send.clear();
            return 0;
        };

        let started = Instant::now();

        if !self.protocol_sent && name != tags::PROTOCOL {
            let mut protocol = self.service.protocol().clone();
            protocol.extend_from(&self.proto_dynamic);
            protocol.set_var(tags::SNDBUF, transport.net().send_buffering().to_string());
            protocol.set_var(tags::RCVBUF, transport.net().recv_buffering().to_string());
            protocol.set_var(tags::FUNC, tags::PROTOCOL);

            debug!("Rpc invoking {}", tags::PROTOCOL);
            transport.send(&protocol, &mut self.errors).await;
        }

        self.protocol_sent = true;
        self.send.set_var(tags::FUNC, name);

        debug!("Rpc invoking {name}");
        let mut size = transport.send(&self.send, &mut self.errors).await;

        if let Some(too_big @ Error::TooBig(_)) = &self.errors.send {
            let too_big = too_big.clone();
            error!(target: "p4rpc::fault", "{too_big}, {name} replaced by {}", tags::CLIENT_MESSAGE);

            self.errors.send = None;
            self.send.clear();
            self.send.set_var(tags::FMT0, too_big.to_string());
            self.send.set_var(tags::FUNC, tags::CLIENT_MESSAGE);
            size = transport.send(&self.send, &mut self.errors).await;
        }

        self.send.clear();

        if self.errors.send.is_some() {
            return 0;
        }

        let size = size + SEND_OVERHEAD;
        self.track.sent(size, started.elapsed());
        size
    }

    /// Sends a one-way call. While reverse-clogging calls are outstanding, the peer may be
    /// unable to read, so the call is metered like [`invoke_duplex`](Self::invoke_duplex).
    pub async fn invoke(&mut self, name: &str) {
        match self.flow.rrecv > 0 {
            true => self.invoke_duplex(name).await,
            false => {
                self.invoke_one(name).await;
            }
        }
    }

    fn meter(&mut self, size: i64) {
        self.flow.frecv += size;
        self.flow.fsend += size;
        self.track.observe_frecv(self.flow.frecv);
    }

    /// Sends a call whose handling sends data back, then dispatches until the data outstanding
    /// is below the high-mark.
    pub async fn invoke_duplex(&mut self, name: &str) {
        let size = self.invoke_one(name).await as i64;
        self.meter(size);
        self.dispatch(DispatchMode::Duplex).await;
    }

    /// Like [`invoke_duplex`](Self::invoke_duplex), for a call whose reply is expected to be
    /// `extra` bytes larger than the call itself.
    pub async fn invoke_duplex_plus(&mut self, name: &str, extra: usize) {
        let size = self.invoke_one(name).await.saturating_add(extra);
        self.meter(signed_mark(size));
        self.dispatch(DispatchMode::Duplex).await;
    }

    /// Like [`invoke_duplex`](Self::invoke_duplex), for a call that makes the peer send data
    /// toward us. Every following [`invoke`](Self::invoke) is metered until the call is
    /// acknowledged.
    pub async fn invoke_duplex_rev(&mut self, name: &str) {
        self.flow.rrecv += 1;
        self.flow.rsend += 1;
        self.invoke_duplex(name).await;
    }

    /// Like [`invoke_duplex`](Self::invoke_duplex), but leaves draining below the low-mark to
    /// the outer dispatch loop.
    pub async fn invoke_over(&mut self, name: &str) {
        let size = self.invoke_one(name).await as i64;
        self.meter(size);
        self.dispatch(DispatchMode::Over).await;
    }

    /// Waits until everything sent so far was acknowledged. Does nothing if nothing is
    /// outstanding.
    pub async fn flush_duplex(&mut self) {
        if self.flow.frecv > 0 {
            // Makes sure a marker goes out even if one was just sent.
            self.meter(1);
            self.dispatch(DispatchMode::Flush).await;
        }
    }

    /// Tells the peer no further requests will be sent.
    pub async fn release(&mut self) {
        self.invoke(tags::RELEASE).await;
    }

    pub async fn release_final(&mut self) {
        self.invoke(tags::RELEASE2).await;
    }

    /// Replies to the message being dispatched, by invoking the function it named in its
    /// `confirm` variable, or by releasing the peer if there's none.
    pub async fn confirm(&mut self) {
        match self.recv.get_var_str(tags::CONFIRM).map(String::from) {
            Some(function) => self.invoke(&function).await,
            None => self.release().await,
        }
    }

    /// Accounts the acknowledgement carried by a `flush2`.
    pub fn got_flushed(&mut self) {
        if let Some(fseq) = self.recv.get_var_int(tags::FSEQ) {
            self.flow.frecv -= fseq;
        }

        if let Some(rseq) = self.recv.get_var_int(tags::RSEQ) {
            self.flow.rrecv -= rseq;
        }
    }

    // ---- Dispatching ----

    /// Makes the current dispatch loop return once the running handler is done.
    pub fn end_dispatch(&mut self) {
        self.end_dispatch = true;
    }

    /// When set, [`DispatchMode::Duplex`] drains whether or not the transport reports the peer
    /// is ready. Returns the previous setting.
    pub fn set_priority_dispatch(&mut self, priority: bool) -> bool {
        mem::replace(&mut self.priority_dispatch, priority)
    }

    pub fn dispatch_ready(&self) -> bool {
        !self.end_dispatch && self.transport.as_ref().is_some_and(|t| t.net().duplex_ready())
    }

    /// Whether a dispatch loop would still have something to do.
    pub fn active(&self) -> bool {
        !self.end_dispatch && (self.errors.recv.is_none() || self.transport.as_ref().is_some_and(RpcTransport::recv_ready))
    }

    fn should_dispatch(&self, mode: DispatchMode, hi_mark: i64) -> bool {
        let wanted = match mode {
            DispatchMode::Complete => true,
            DispatchMode::Duplex => {
                self.flow.frecv > hi_mark && (self.priority_dispatch || self.transport.as_ref().is_some_and(|t| t.net().duplex_ready()))
            }
            DispatchMode::Flush => self.flow.frecv != 0,
            DispatchMode::Over => self.flow.frecv > hi_mark,
            DispatchMode::Contain => !self.last_error.test(),
        };

        wanted || self.errors.send.is_some()
    }

    async fn send_flow_marker(&mut self, mode: DispatchMode, lo_mark: i64, hi_mark: i64) {
        trace!("Rpc flush {} bytes", self.flow.fsend);

        let announced = match lo_mark {
            0 => 0,
            _ => hi_mark,
        };
        self.send.set_var(tags::HIMARK, announced.to_string());
        if mode == DispatchMode::Flush {
            self.send.set_var(tags::FLUSH_HARD, "");
        }

        self.meter(FLUSH_MESSAGE_SIZE);

        if self.flow.fsend != 0 {
            self.send.set_var(tags::FSEQ, self.flow.fsend.to_string());
        }
        if self.flow.rsend != 0 {
            self.send.set_var(tags::RSEQ, self.flow.rsend.to_string());
        }

        self.flow.fsend = 0;
        self.flow.rsend = 0;
        self.invoke_one(tags::FLUSH1).await;
    }

    /// Receives and dispatches messages until the mode's condition is met, the peer releases
    /// us or the connection fails.
    ///
    /// Calls nest at most [`MAX_DISPATCH_DEPTH`] deep, deeper calls return right away. A nested
    /// call leaves the message the outer handler is working on in place.
    pub async fn dispatch(&mut self, mode: DispatchMode) {
        if self.dispatch_depth >= MAX_DISPATCH_DEPTH {
            warn!("Dispatch({mode:?}) nested too deeply at depth {}, ignoring", self.dispatch_depth);
            return;
        }

        if mode != DispatchMode::Contain {
            self.dispatch_depth += 1;
        }

        let lo_mark = match mode {
            DispatchMode::Duplex => signed_mark(self.lo_mark),
            _ => 0,
        };

        let hi_mark = match mode {
            DispatchMode::Flush => 0,
            DispatchMode::Over => signed_mark(self.hi_mark_fwd),
            _ if self.flow.rrecv > 0 => signed_mark(self.hi_mark_rev),
            _ => signed_mark(self.hi_mark_fwd),
        };

        trace!(">>> Dispatch({mode:?}) depth {} {:?}", self.dispatch_depth, self.flow);

        let nested = mode == DispatchMode::Contain || self.dispatch_depth > 1;
        let saved = nested.then(|| mem::take(&mut self.recv));

        while !self.end_dispatch {
            if self.errors.recv.is_some() && !self.transport.as_ref().is_some_and(RpcTransport::recv_ready) {
                break;
            }

            if self.flow.fsend > lo_mark && self.errors.send.is_none() {
                self.send_flow_marker(mode, lo_mark, hi_mark).await;
            } else if self.should_dispatch(mode, hi_mark) {
                self.dispatch_one(mode == DispatchMode::Contain).await;
            } else {
                break;
            }
        }

        if let Some(saved) = saved {
            self.recv = saved;
        }

        trace!("<<< Dispatch({mode:?}) depth {} {:?}", self.dispatch_depth, self.flow);

        if mode != DispatchMode::Contain {
            self.dispatch_depth -= 1;
        }

        if mode == DispatchMode::Contain || self.dispatch_depth == 0 {
            self.end_dispatch = false;
        }
    }

    /// Receives one message and runs its handler.
    ///
    /// A name with no handler goes to the `funcHandler` handler if there's one. Errors the
    /// handler raises go to the `errorHandler` handler, or to the fault log if there's none,
    /// unless `pass_error` is set, in which case they're only kept in
    /// [`last_error`](Self::last_error). Errors that leave the connection unusable are also
    /// recorded as the connection's errors, ending every dispatch loop.
    pub async fn dispatch_one(&mut self, pass_error: bool) {
        let Some(transport) = &mut self.transport else {
            self.errors.set_recv(Error::NotConnected);
            return;
        };

        let started = Instant::now();
        let Some((message, size)) = transport.receive(&mut self.errors).await else {
            if self.errors.recv.is_none() {
                self.errors.set_recv(Error::Closed);
            }
            return;
        };

        self.track.received(size + SEND_OVERHEAD, started.elapsed());
        self.recv = message;

        let mut ue = RpcError::new();
        let function = self.recv.get_var_str(tags::FUNC).map(String::from);

        match &function {
            None => ue.set(Error::NoFunction),
            Some(function) => {
                debug!("Rpc dispatch {function}");

                let dispatcher = self.service.dispatcher();
                let handler = dispatcher.find(function).or_else(|| dispatcher.find(tags::FUNC_HANDLER)).cloned();

                match handler {
                    None => ue.set(Error::Unregistered(function.clone())),
                    Some(handler) => {
                        handler.call(self, &mut ue).await;
                        self.last_error = ue.clone();

                        if !ue.test() {
                            return;
                        }

                        if ue.is_fatal() {
                            ue.set(Error::Operation(function.clone()));
                        }

                        if let Some(fatal) = ue.connection_fatal() {
                            self.errors.set_both(fatal.clone());
                        }
                    }
                }
            }
        }

        if pass_error {
            return;
        }

        match self.service.dispatcher().find(tags::ERROR_HANDLER).cloned() {
            Some(handler) => handler.call(self, &mut ue).await,
            None => error!(target: "p4rpc::fault", function = function.as_deref().unwrap_or(""), "{ue}"),
        }
    }

    // ---- Errors ----

    /// The connection's send and receive errors.
    pub fn errors(&self) -> &DuplexError {
        &self.errors
    }

    pub fn send_error(&self) -> Option<&Error> {
        self.errors.send.as_ref()
    }

    pub fn recv_error(&self) -> Option<&Error> {
        self.errors.recv.as_ref()
    }

    /// The errors raised by the last handler that ran.
    pub fn last_error(&self) -> &RpcError {
        &self.last_error
    }

    // ---- Connection ----

    fn net(&self) -> Option<&NetTransport> {
        self.transport.as_ref().map(RpcTransport::net)
    }

    pub fn address(&self, form: AddressForm) -> Option<String> {
        self.net().map(|t| t.address(form))
    }

    pub fn peer_address(&self, form: AddressForm) -> Option<String> {
        self.net().map(|t| t.peer_address(form))
    }

    pub fn is_ssl(&self) -> bool {
        self.net().is_some_and(Transport::is_ssl)
    }

    pub fn encryption_type(&self) -> Option<String> {
        self.net().and_then(Transport::encryption_type)
    }

    pub fn peer_fingerprint(&self) -> Option<String> {
        self.net().and_then(|t| t.peer_fingerprint()).map(String::from)
    }

    pub fn peer_credentials(&self) -> Option<&dyn PeerCredentials> {
        self.net().and_then(|t| t.peer_credentials())
    }

    pub fn recv_buffering(&self) -> usize {
        self.net().map_or(0, Transport::recv_buffering)
    }

    pub fn set_max_wait(&mut self, max_wait: Option<Duration>) {
        if let Some(transport) = &mut self.transport {
            transport.net_mut().set_max_wait(max_wait);
        }
    }

    /// Sets the callback polled while waiting on the network. Kept across reconnects.
    pub fn set_break(&mut self, keepalive: Option<SharedKeepAlive>) {
        if let Some(transport) = &mut self.transport {
            transport.net_mut().set_break(keepalive.clone());
        }

        self.keepalive = keepalive;
    }

    /// Completes the TLS handshake. A failure also becomes the connection's error.
    pub async fn do_handshake(&mut self) -> Result<(), Error> {
        let Some(transport) = &mut self.transport else {
            return Err(Error::NotConnected);
        };

        let result = transport.net_mut().do_handshake().await;
        if let Err(error) = &result {
            self.errors.set_both(error.clone());
        }

        result
    }

    /// Checks that the peer speaks the same kind of transport as we do.
    pub async fn client_mismatch(&mut self) -> Result<(), Error> {
        let Some(transport) = &mut self.transport else {
            return Err(Error::NotConnected);
        };

        let result = transport.net_mut().client_mismatch().await;
        if let Err(error) = &result {
            self.errors.set_both(error.clone());
        }

        result
    }

    /// Decides whether to trust the peer, see [`trust::check_known_host`].
    pub fn check_known_host(&self, store: &mut dyn TrustStore, e: &mut RpcError) {
        let Some(net) = self.net() else {
            e.set(Error::NotConnected);
            return;
        };

        let subject = TrustSubject::of(net);
        trust::check_known_host(&subject, store, self.service.config().cert_validation, e);
    }

    /// Pins the peer's current fingerprint as trusted.
    pub fn establish_trust(&self, store: &mut dyn TrustStore) -> Result<(), Error> {
        let net = self.net().ok_or(Error::NotConnected)?;
        trust::establish_trust(&TrustSubject::of(net), store)
    }

    // ---- Tracking ----

    pub fn track(&self) -> &RpcTrack {
        &self.track
    }

    pub fn track_report(&self) -> TrackReport {
        TrackReport {
            track: self.track.clone(),
            hi_mark_fwd: self.hi_mark_fwd,
            hi_mark_rev: self.hi_mark_rev,
            send_error: self.errors.send.is_some(),
            recv_error: self.errors.recv.is_some(),
            frecv: self.flow.frecv,
            rrecv: self.flow.rrecv,
        }
    }
}
