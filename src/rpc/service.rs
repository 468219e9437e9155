//! What every connection of one kind shares: the endpoint, the handlers and the protocol
//! variables announced to peers.

use std::{net::SocketAddr, sync::Arc};

use p4rpc_proto::{tags, MessageDict};
use tracing::debug;

use super::{
    dispatch::{DispatchTable, Dispatcher, HandlerFuture},
    engine::Rpc,
};
use crate::{
    config::RpcConfig,
    error::{Error, RpcError},
    net::{endpoint::NetEndPoint, NetTransport},
};

/// Whether connections are made by connecting out or by accepting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Connect,
    Listen,
}

pub struct RpcService {
    config: Arc<RpcConfig>,
    endpoint: Option<NetEndPoint>,
    mode: OpenMode,
    dispatcher: Dispatcher,
    protocol: MessageDict,
}

impl RpcService {
    /// Creates a service with only the engine's own functions registered.
    pub fn new(config: impl Into<Arc<RpcConfig>>) -> Self {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(builtin_table());

        Self {
            config: config.into(),
            endpoint: None,
            mode: OpenMode::Connect,
            dispatcher,
            protocol: MessageDict::new(),
        }
    }

    pub fn config(&self) -> &Arc<RpcConfig> {
        &self.config
    }

    /// Adds a table of handlers, shadowing same-named handlers registered before.
    pub fn register(&mut self, table: impl Into<Arc<DispatchTable>>) {
        self.dispatcher.register(table);
    }

    /// Indexes the registered handlers for faster lookup.
    pub fn finalize(&mut self) {
        self.dispatcher.finalize();
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Sets a variable sent to every peer in the protocol message.
    pub fn set_protocol(&mut self, name: &str, value: impl AsRef<[u8]>) {
        self.protocol.replace_var(name, value);
    }

    /// Like [`set_protocol`](Self::set_protocol), from a `name=value` string. A missing `=`
    /// sets an empty value.
    pub fn set_protocol_v(&mut self, spec: &str) {
        match spec.split_once('=') {
            Some((name, value)) => self.set_protocol(name, value),
            None => self.set_protocol(spec, ""),
        }
    }

    pub fn protocol(&self) -> &MessageDict {
        &self.protocol
    }

    /// Sets the address to connect to or listen on.
    pub fn set_endpoint(&mut self, address: &str) -> Result<(), Error> {
        self.endpoint = Some(NetEndPoint::new(address, Arc::clone(&self.config))?);
        self.mode = OpenMode::Connect;
        Ok(())
    }

    pub fn endpoint(&self) -> Option<&NetEndPoint> {
        self.endpoint.as_ref()
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Starts listening on the endpoint. Connections are then made by accepting.
    pub async fn listen(&mut self) -> Result<(), Error> {
        let endpoint = self.endpoint.as_mut().ok_or(Error::NotConnected)?;
        endpoint.listen().await?;
        self.mode = OpenMode::Listen;
        Ok(())
    }

    pub fn unlisten(&mut self) {
        if let Some(endpoint) = &mut self.endpoint {
            endpoint.unlisten();
        }
    }

    pub fn listen_address(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().and_then(NetEndPoint::listen_address)
    }

    /// Opens a transport: accepts the next connection when listening, connects otherwise.
    pub(crate) async fn open(&self) -> Result<NetTransport, Error> {
        let endpoint = self.endpoint.as_ref().ok_or(Error::NotConnected)?;
        match self.mode {
            OpenMode::Listen => endpoint.accept().await,
            OpenMode::Connect => endpoint.connect().await,
        }
    }
}

fn builtin_table() -> DispatchTable {
    DispatchTable::new()
        .with(tags::PROTOCOL, protocol)
        .with(tags::FLUSH1, flush1)
        .with(tags::FLUSH2, flush2)
        .with(tags::RELEASE, release)
        .with(tags::RELEASE2, release)
}

fn protocol<'a>(rpc: &'a mut Rpc, _e: &'a mut RpcError) -> HandlerFuture<'a> {
    Box::pin(async move {
        rpc.got_protocol();
    })
}

/// Answers a flow marker, echoing its sequence counters back.
fn flush1<'a>(rpc: &'a mut Rpc, _e: &'a mut RpcError) -> HandlerFuture<'a> {
    Box::pin(async move {
        let fseq = rpc.get_var(tags::FSEQ).map(<[u8]>::to_vec);
        let rseq = rpc.get_var(tags::RSEQ).map(<[u8]>::to_vec);

        if let Some(fseq) = fseq {
            rpc.set_var(tags::FSEQ, fseq);
        }
        if let Some(rseq) = rseq {
            rpc.set_var(tags::RSEQ, rseq);
        }

        rpc.invoke_one(tags::FLUSH2).await;
    })
}

fn flush2<'a>(rpc: &'a mut Rpc, _e: &'a mut RpcError) -> HandlerFuture<'a> {
    Box::pin(async move {
        rpc.got_flushed();
    })
}

fn release<'a>(rpc: &'a mut Rpc, _e: &'a mut RpcError) -> HandlerFuture<'a> {
    Box::pin(async move {
        debug!("Peer released the connection");
        rpc.end_dispatch();
    })
}
