//! Client construction

use granule_engine::{Config, Endpoint};
use granule_transport::{UdpChannel, UdpConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::client::CoapClient;
use crate::error::Result;

/// Builder for [`CoapClient`]
pub struct CoapClientBuilder {
    bind: SocketAddr,
    config: Config,
    timeout: Duration,
}

impl CoapClientBuilder {
    pub fn new() -> Self {
        CoapClientBuilder {
            bind: "0.0.0.0:0".parse().unwrap(),
            config: Config::default(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Local bind address (default: ephemeral)
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind = addr;
        self
    }

    /// Engine configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Per-request response timeout (default 30s)
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bind the UDP channel and start the endpoint
    pub async fn build(self) -> Result<CoapClient> {
        let udp_config = UdpConfig {
            receive_buffer_size: self.config.channel_receive_buffer_size,
            send_buffer_size: self.config.channel_send_buffer_size,
            receive_packet_size: self.config.channel_receive_packet_size,
            ..UdpConfig::default()
        };
        let channel = Arc::new(UdpChannel::bind_with_config(self.bind, udp_config).await?);
        let endpoint = Endpoint::new(channel, self.config);
        endpoint.start().await.map_err(crate::error::ClientError::from)?;
        Ok(CoapClient::from_endpoint(endpoint, self.timeout))
    }
}

impl Default for CoapClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
