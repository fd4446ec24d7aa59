//! Plain UDP channel

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{Result, TransportError};
use crate::traits::{Channel, ChannelEvent, ChannelReceiver, Datagram, Session, SessionId};

/// UDP channel configuration
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// SO_RCVBUF hint
    pub receive_buffer_size: Option<usize>,
    /// SO_SNDBUF hint
    pub send_buffer_size: Option<usize>,
    /// Largest datagram accepted on receive
    pub receive_packet_size: usize,
    /// Depth of the event queue toward the endpoint
    pub event_queue_depth: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: None,
            send_buffer_size: None,
            receive_packet_size: 2048,
            event_queue_depth: 128,
        }
    }
}

/// Plain UDP channel. All peers share one unauthenticated session.
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    config: UdpConfig,
    session_id: SessionId,
    receiver_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpChannel {
    /// Bind to a local address
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with_config(addr, UdpConfig::default()).await
    }

    /// Bind with config
    pub async fn bind_with_config(addr: SocketAddr, config: UdpConfig) -> Result<Self> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        if let Some(size) = config.receive_buffer_size {
            socket
                .set_recv_buffer_size(size)
                .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        }
        if let Some(size) = config.send_buffer_size {
            socket
                .set_send_buffer_size(size)
                .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        }

        socket
            .bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        info!("udp channel bound to {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            config,
            session_id: SessionId::new(),
            receiver_task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Channel for UdpChannel {
    async fn start(&self) -> Result<ChannelReceiver> {
        if self.receiver_task.lock().is_some() {
            return Err(TransportError::Other("channel already started".to_string()));
        }

        let (tx, rx) = mpsc::channel(self.config.event_queue_depth);
        let socket = self.socket.clone();
        let session = Session::plain(self.session_id);
        let local = socket.local_addr().ok();
        let max_size = self.config.receive_packet_size;

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; max_size];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        debug!("udp received {} bytes from {}", len, from);
                        let datagram = Datagram {
                            data: Bytes::copy_from_slice(&buf[..len]),
                            source: from,
                            destination: local,
                            session: session.clone(),
                        };
                        if tx.send(ChannelEvent::Data(datagram)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("udp receive error: {}", e);
                        let _ = tx
                            .send(ChannelEvent::Stopped {
                                reason: Some(e.to_string()),
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        *self.receiver_task.lock() = Some(task);
        Ok(rx)
    }

    async fn stop(&self) {
        if let Some(task) = self.receiver_task.lock().take() {
            task.abort();
        }
    }

    async fn send(
        &self,
        data: Bytes,
        _session: Option<&Session>,
        remote: SocketAddr,
    ) -> Result<()> {
        self.socket
            .send_to(&data, remote)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    fn session(&self, _remote: SocketAddr) -> Session {
        Session::plain(self.session_id)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn add_multicast_group(&self, group: IpAddr) -> Result<()> {
        match group {
            IpAddr::V4(group) => self
                .socket
                .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
                .map_err(|e| TransportError::MulticastJoin(e.to_string())),
            IpAddr::V6(group) => self
                .socket
                .join_multicast_v6(&group, 0)
                .map_err(|e| TransportError::MulticastJoin(e.to_string())),
        }
    }
}

/// Convenience: a channel bound to an ephemeral local port
pub async fn ephemeral() -> Result<UdpChannel> {
    UdpChannel::bind("0.0.0.0:0".parse::<SocketAddr>().unwrap()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bind_and_local_addr() {
        let channel = ephemeral().await.unwrap();
        assert!(channel.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn test_send_recv() {
        let server = ephemeral().await.unwrap();
        let client = ephemeral().await.unwrap();
        let server_addr: SocketAddr =
            format!("127.0.0.1:{}", server.local_addr().unwrap().port())
                .parse()
                .unwrap();

        let mut events = server.start().await.unwrap();
        client
            .send(Bytes::from_static(b"hello"), None, server_addr)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ChannelEvent::Data(datagram) => {
                assert_eq!(datagram.data.as_ref(), b"hello");
                assert_eq!(
                    datagram.source.port(),
                    client.local_addr().unwrap().port()
                );
            }
            other => panic!("expected data event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let channel = ephemeral().await.unwrap();
        let _rx = channel.start().await.unwrap();
        assert!(channel.start().await.is_err());
    }

    #[tokio::test]
    async fn test_sessions_share_id() {
        let channel = ephemeral().await.unwrap();
        let a = channel.session("127.0.0.1:1111".parse().unwrap());
        let b = channel.session("127.0.0.1:2222".parse().unwrap());
        assert_eq!(a.id, b.id);
        assert!(!a.is_authenticated());
    }
}
