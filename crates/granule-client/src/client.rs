//! The CoAP client
//!
//! A thin façade over an engine endpoint: URI handling, request
//! construction, response waiting with timeout, observe streams, ping,
//! and discovery.

use bytes::Bytes;
use granule_core::option::observe;
use granule_core::{link_format, Code, CoapUri, Message, Token};
use granule_engine::{Endpoint, EngineError, RequestHandle};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{ClientError, Result};

/// A CoAP client over one local endpoint
pub struct CoapClient {
    endpoint: Endpoint,
    timeout: Duration,
}

impl CoapClient {
    /// Start building a client
    pub fn builder() -> crate::builder::CoapClientBuilder {
        crate::builder::CoapClientBuilder::new()
    }

    /// Wrap an already-started endpoint
    pub fn from_endpoint(endpoint: Endpoint, timeout: Duration) -> Self {
        CoapClient { endpoint, timeout }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// GET a resource
    pub async fn get(&self, uri: &str) -> Result<Message> {
        self.request(Code::GET, uri, None).await
    }

    /// POST a payload
    pub async fn post(&self, uri: &str, payload: impl Into<Bytes>) -> Result<Message> {
        self.request(Code::POST, uri, Some(payload.into())).await
    }

    /// PUT a payload
    pub async fn put(&self, uri: &str, payload: impl Into<Bytes>) -> Result<Message> {
        self.request(Code::PUT, uri, Some(payload.into())).await
    }

    /// DELETE a resource
    pub async fn delete(&self, uri: &str) -> Result<Message> {
        self.request(Code::DELETE, uri, None).await
    }

    /// Send a confirmable request and wait for its response
    pub async fn request(
        &self,
        method: Code,
        uri: &str,
        payload: Option<Bytes>,
    ) -> Result<Message> {
        let request = self.build_request(method, uri, payload, true).await?;
        let rx = self.endpoint.send_request(request)?;
        let response = tokio::time::timeout(self.timeout, rx)
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::Closed)??;
        Ok(response)
    }

    /// Register an observation: GET with Observe=0. Notifications arrive
    /// on the returned stream until it is deregistered or dropped.
    pub async fn observe(&self, uri: &str) -> Result<ObserveStream> {
        let mut request = self.build_request(Code::GET, uri, None, true).await?;
        request.options.set_observe(observe::REGISTER);
        let (rx, handle) = self.endpoint.send_request_streaming(request, 16)?;
        info!("observing {}", uri);
        Ok(ObserveStream {
            client_endpoint: self.endpoint.clone(),
            uri: uri.to_string(),
            timeout: self.timeout,
            rx,
            handle,
        })
    }

    /// CoAP ping: returns the round-trip time
    pub async fn ping(&self, authority: &str) -> Result<Duration> {
        let remote = resolve(authority).await?;
        let started = Instant::now();
        let rx = self.endpoint.ping(remote)?;
        let outcome = tokio::time::timeout(self.timeout, rx)
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::Closed)?;
        match outcome {
            // the pong is an RST
            Err(EngineError::Rejected) => Ok(started.elapsed()),
            Err(other) => Err(other.into()),
            Ok(_) => Ok(started.elapsed()),
        }
    }

    /// Fetch and parse `/.well-known/core`
    pub async fn discover(&self, authority: &str) -> Result<Vec<link_format::WebLink>> {
        let uri = format!("coap://{}/.well-known/core", authority);
        let response = self.get(&uri).await?;
        let body = String::from_utf8_lossy(&response.payload);
        link_format::parse(&body, link_format::ParseMode::Lenient)
            .map_err(ClientError::LinkFormat)
    }

    /// Send a non-confirmable request to a multicast group and collect
    /// replies for `window`
    pub async fn multicast(
        &self,
        method: Code,
        uri: &str,
        window: Duration,
    ) -> Result<Vec<Message>> {
        let request = self.build_request(method, uri, None, false).await?;
        let (mut rx, handle) = self.endpoint.send_request_streaming(request, 64)?;

        let mut replies = Vec::new();
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                reply = rx.recv() => match reply {
                    Some(message) => replies.push(message),
                    None => break,
                },
                _ = &mut deadline => break,
            }
        }
        handle.cancel();
        debug!("multicast {} gathered {} replies", uri, replies.len());
        Ok(replies)
    }

    async fn build_request(
        &self,
        method: Code,
        uri: &str,
        payload: Option<Bytes>,
        confirmable: bool,
    ) -> Result<Message> {
        let uri = CoapUri::parse(uri)?;
        if !self.endpoint.serves_scheme(uri.scheme) {
            return Err(ClientError::SchemeNotServed(uri.scheme));
        }
        let remote = resolve(&uri.authority()).await?;

        let mut request = Message::request(method, confirmable);
        uri.apply_to(&mut request.options);
        request.destination = Some(remote);
        if let Some(payload) = payload {
            request.payload = payload;
        }
        Ok(request)
    }
}

/// Live observation of one resource
pub struct ObserveStream {
    client_endpoint: Endpoint,
    uri: String,
    timeout: Duration,
    rx: mpsc::Receiver<Message>,
    handle: RequestHandle,
}

impl ObserveStream {
    /// Next notification (the first message is the initial response)
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Token identifying this relation on the wire
    pub fn token(&self) -> Option<Token> {
        self.handle.token()
    }

    /// Cancel the relation: GET with Observe=1 bearing the same token.
    /// Consumes the stream; no further notifications arrive.
    pub async fn deregister(mut self) -> Result<()> {
        let token = match self.handle.token() {
            Some(token) => token,
            None => {
                self.handle.cancel();
                return Ok(());
            }
        };

        let uri = CoapUri::parse(&self.uri)?;
        let remote = resolve(&uri.authority()).await?;
        let mut request = Message::request(Code::GET, true).with_token(token);
        uri.apply_to(&mut request.options);
        request.options.set_observe(observe::DEREGISTER);
        request.destination = Some(remote);

        let rx = self.client_endpoint.send_request(request)?;
        let _ = tokio::time::timeout(self.timeout, rx)
            .await
            .map_err(|_| ClientError::Timeout)?;
        self.rx.close();
        info!("deregistered observation of {}", self.uri);
        Ok(())
    }
}

async fn resolve(authority: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(authority)
        .await
        .map_err(|_| ClientError::Resolve(authority.to_string()))?
        .next()
        .ok_or_else(|| ClientError::Resolve(authority.to_string()))
}
