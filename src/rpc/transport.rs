//! Carries whole messages over a [`NetTransport`].
//!
//! Sending a message also reads whatever the peer has sent meanwhile, up to the configured
//! receive buffering, so that two peers writing large messages at each other can't both end up
//! blocked on full socket buffers. The bytes read that way are kept until the next receive.

use p4rpc_proto::{
    encode_message,
    frame::{bytes_needed, HEADER_SIZE},
    serialize::encoded_len,
    take_frame, MessageDict, MAX_MESSAGE_SIZE,
};
use tracing::trace;

use crate::{
    error::{DuplexError, Error},
    net::{NetIo, NetTransport, Transport, READ_CHUNK},
};

pub struct RpcTransport {
    net: NetTransport,
    recv_data: Vec<u8>,

    /// How many received bytes may be buffered while sending.
    recv_limit: usize,
    recv_eof: bool,
}

impl RpcTransport {
    pub fn new(net: NetTransport, recv_limit: usize) -> Self {
        Self {
            net,
            recv_data: Vec::new(),
            recv_limit,
            recv_eof: false,
        }
    }

    pub fn net(&self) -> &NetTransport {
        &self.net
    }

    pub fn net_mut(&mut self) -> &mut NetTransport {
        &mut self.net
    }

    /// Whether a complete message is already buffered, so receiving it won't touch the socket.
    pub fn recv_ready(&self) -> bool {
        matches!(bytes_needed(&self.recv_data), Ok(0))
    }

    /// Sends one message, returning the size of its payload. Errors are recorded in `errors`, a
    /// message above [`MAX_MESSAGE_SIZE`] fails with [`Error::TooBig`] without sending anything.
    pub async fn send(&mut self, dict: &MessageDict, errors: &mut DuplexError) -> usize {
        let size = encoded_len(dict);
        if size > MAX_MESSAGE_SIZE {
            errors.set_send(Error::TooBig(size));
            return size;
        }

        let frame = match encode_message(dict) {
            Ok(frame) => frame,
            Err(error) => {
                errors.set_send(Error::Malformed(error.to_string()));
                return size;
            }
        };

        let room = self.recv_limit.saturating_sub(self.recv_data.len());
        let mut io = NetIo::new(&frame, &mut self.recv_data, room);

        while !io.send.is_empty() && errors.send.is_none() {
            let moved = self.net.send_or_receive(&mut io, errors).await;
            if io.eof {
                self.recv_eof = true;
            }

            if !moved {
                errors.set_send(Error::Closed);
            }
        }

        trace!("Sent message of {size} bytes, {} bytes buffered", self.recv_data.len());
        size
    }

    /// Receives one message with its payload size. Returns `None` when the peer closed the
    /// connection or on failure, in which case the error is in `errors.recv`.
    pub async fn receive(&mut self, errors: &mut DuplexError) -> Option<(MessageDict, usize)> {
        loop {
            match take_frame(&mut self.recv_data) {
                Ok(Some(message)) => return Some(message),
                Ok(None) => {}
                Err(error) => {
                    errors.set_recv(Error::Malformed(error.to_string()));
                    return None;
                }
            }

            if self.recv_eof || errors.recv.is_some() {
                return None;
            }

            let want = bytes_needed(&self.recv_data).unwrap_or(HEADER_SIZE).max(READ_CHUNK);
            let mut io = NetIo::new(&[], &mut self.recv_data, want);
            let moved = self.net.send_or_receive(&mut io, errors).await;
            if io.eof {
                self.recv_eof = true;
            }

            if !moved {
                return None;
            }
        }
    }

    pub async fn close(&mut self) -> bool {
        self.net.close().await
    }
}

#[cfg(test)]
mod tests {
    use p4rpc_proto::{tags, MessageDict, SEND_OVERHEAD};

    use super::RpcTransport;
    use crate::{
        config::RpcConfig,
        error::{DuplexError, Error},
        net::{tcp::tests::transport_pair, NetTransport, Transport},
    };

    async fn pair(recv_limit: usize) -> (RpcTransport, RpcTransport) {
        let (client, server) = transport_pair(&RpcConfig::new()).await;
        (
            RpcTransport::new(NetTransport::Tcp(client), recv_limit),
            RpcTransport::new(NetTransport::Tcp(server), recv_limit),
        )
    }

    fn message(func: &str, payload: &[u8]) -> MessageDict {
        let mut dict = MessageDict::new();
        dict.set_var("data", payload);
        dict.set_var(tags::FUNC, func);
        dict
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (mut client, mut server) = pair(0x10000).await;
        let mut errors = DuplexError::new();

        let first = client.send(&message("one", b"1"), &mut errors).await;
        client.send(&message("two", &vec![7u8; 100_000]), &mut errors).await;
        assert!(first > 0);
        assert!(!errors.test());

        let mut server_errors = DuplexError::new();
        let (dict, size) = server.receive(&mut server_errors).await.unwrap();
        assert_eq!(dict.get_var_str(tags::FUNC), Some("one"));
        assert_eq!(size, first);

        let (dict, _) = server.receive(&mut server_errors).await.unwrap();
        assert_eq!(dict.get_var_str(tags::FUNC), Some("two"));
        assert_eq!(dict.get_var("data").map(<[u8]>::len), Some(100_000));
        assert!(!server.recv_ready());
    }

    #[tokio::test]
    async fn test_sending_buffers_what_the_peer_sent() {
        let (mut client, mut server) = pair(0x10000).await;
        let mut errors = DuplexError::new();

        server.send(&message("hello", b"x"), &mut errors).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Large enough to need several writes, giving the read side a chance to run.
        let big = message("big", &vec![1u8; 4 * 1024 * 1024]);
        let (sent, received) = tokio::join!(
            async {
                let mut e = DuplexError::new();
                let size = client.send(&big, &mut e).await;
                assert!(!e.test());
                (size, client)
            },
            async {
                let mut e = DuplexError::new();
                server.receive(&mut e).await.map(|(d, s)| (d.get_var_str(tags::FUNC).map(String::from), s))
            }
        );

        let (size, mut client) = sent;
        assert_eq!(received, Some((Some("big".into()), size)));

        let (dict, _) = client.receive(&mut errors).await.unwrap();
        assert_eq!(dict.get_var_str(tags::FUNC), Some("hello"));
        assert!(size + SEND_OVERHEAD > 4 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_eof_ends_receive() {
        let (mut client, mut server) = pair(0x10000).await;
        let mut errors = DuplexError::new();

        client.send(&message("last", b""), &mut errors).await;
        assert!(client.close().await);

        assert!(server.receive(&mut errors).await.is_some());
        assert!(server.receive(&mut errors).await.is_none());
        assert!(errors.recv.is_none());
    }

    #[tokio::test]
    async fn test_garbage_is_malformed() {
        let (mut client, mut server) = pair(0x10000).await;
        client.net_mut().send(b"\x16\x03\x01\x02\x00 not a frame").await.unwrap();

        let mut errors = DuplexError::new();
        assert!(server.receive(&mut errors).await.is_none());
        assert!(matches!(errors.recv, Some(Error::Malformed(_))));
        assert!(!server.recv_ready());
    }
}
