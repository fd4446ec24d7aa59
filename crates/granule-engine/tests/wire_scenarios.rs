//! Wire-level scenarios against a live UDP endpoint
//!
//! A raw UDP socket plays the peer and asserts on exact datagram bytes.

use granule_core::{Code, Message};
use granule_engine::{Config, Endpoint, EngineError, Exchange, MessageDeliverer};
use granule_transport::UdpChannel;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Serves "hello" at /test and counts invocations
struct HelloDeliverer {
    invocations: AtomicUsize,
}

impl HelloDeliverer {
    fn new() -> Arc<Self> {
        Arc::new(HelloDeliverer {
            invocations: AtomicUsize::new(0),
        })
    }
}

impl MessageDeliverer for HelloDeliverer {
    fn deliver_request(&self, exchange: Arc<Exchange>, request: Message, endpoint: Endpoint) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let response = if request.options.uri_path_string() == "test" {
            Message::respond_to(&request, Code::CONTENT).with_payload(&b"hello"[..])
        } else {
            Message::respond_to(&request, Code::NOT_FOUND)
        };
        endpoint.respond(&exchange, response);
    }
}

async fn engine_endpoint(config: Config) -> (Endpoint, SocketAddr, Arc<HelloDeliverer>) {
    let channel = Arc::new(
        UdpChannel::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    );
    let endpoint = Endpoint::new(channel, config);
    let deliverer = HelloDeliverer::new();
    endpoint.set_deliverer(deliverer.clone());
    endpoint.start().await.unwrap();
    let addr = format!("127.0.0.1:{}", endpoint.local_addr().unwrap().port())
        .parse()
        .unwrap();
    (endpoint, addr, deliverer)
}

async fn recv_datagram(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .unwrap();
    buf[..len].to_vec()
}

#[tokio::test]
async fn scenario_a_ping_pong() {
    let (endpoint, addr, _) = engine_endpoint(Config::default()).await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // CON, code 0.00, MID 0x1234
    peer.send_to(&[0x40, 0x00, 0x12, 0x34], addr).await.unwrap();
    let reply = recv_datagram(&peer).await;
    assert_eq!(reply, vec![0x70, 0x00, 0x12, 0x34]);

    endpoint.stop().await;
}

#[tokio::test]
async fn scenario_b_simple_get() {
    let (endpoint, addr, deliverer) = engine_endpoint(Config::default()).await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // CON GET /test, MID 0x0001, token 0xff
    let request = [0x41, 0x01, 0x00, 0x01, 0xff, 0xb4, b't', b'e', b's', b't'];
    peer.send_to(&request, addr).await.unwrap();

    let reply = recv_datagram(&peer).await;
    // ACK 2.05 piggyback with payload "hello"
    assert_eq!(
        reply,
        vec![0x61, 0x45, 0x00, 0x01, 0xff, 0xff, b'h', b'e', b'l', b'l', b'o']
    );
    assert_eq!(deliverer.invocations.load(Ordering::SeqCst), 1);

    endpoint.stop().await;
}

#[tokio::test]
async fn scenario_c_unmatchable_response_rejected() {
    let (endpoint, addr, _) = engine_endpoint(Config::default()).await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // NON 2.05, MID 0xabcd, token 0x07: nothing here owns that token
    peer.send_to(&[0x51, 0x45, 0xab, 0xcd, 0x07], addr)
        .await
        .unwrap();
    let reply = recv_datagram(&peer).await;
    assert_eq!(reply, vec![0x70, 0x00, 0xab, 0xcd]);

    endpoint.stop().await;
}

#[tokio::test]
async fn scenario_d_duplicate_request_replays_cached_response() {
    let (endpoint, addr, deliverer) = engine_endpoint(Config::default()).await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let request = [0x41, 0x01, 0x00, 0x01, 0xff, 0xb4, b't', b'e', b's', b't'];
    peer.send_to(&request, addr).await.unwrap();
    let first = recv_datagram(&peer).await;

    // the retransmitted confirmable must not reach the handler again
    peer.send_to(&request, addr).await.unwrap();
    let second = recv_datagram(&peer).await;

    assert_eq!(first, second);
    assert_eq!(deliverer.invocations.load(Ordering::SeqCst), 1);

    endpoint.stop().await;
}

#[tokio::test]
async fn scenario_e_retransmit_then_give_up() {
    // scaled-down RFC timings keep the test fast: 5 transmissions
    // (initial + 4 retransmits), then TransmissionTimeout
    let config = Config::default()
        .with_ack_timeout(Duration::from_millis(50))
        .with_max_retransmit(4);
    let (endpoint, _, _) = engine_endpoint(config).await;

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr: SocketAddr = format!("127.0.0.1:{}", peer.local_addr().unwrap().port())
        .parse()
        .unwrap();

    let mut request = Message::request(Code::GET, true);
    request.options.set_uri_path("gone");
    request.destination = Some(peer_addr);
    let rx = endpoint.send_request(request).unwrap();

    // count every copy the silent peer receives
    let mut transmissions = 0;
    let mut buf = [0u8; 512];
    let counting = async {
        loop {
            if peer.recv_from(&mut buf).await.is_ok() {
                transmissions += 1;
            }
        }
    };
    let outcome = tokio::select! {
        outcome = rx => outcome,
        _ = counting => unreachable!(),
    };

    assert!(matches!(
        outcome.unwrap(),
        Err(EngineError::TransmissionTimeout { attempts: 4 })
    ));
    assert_eq!(transmissions, 5);

    endpoint.stop().await;
}

#[tokio::test]
async fn rst_stops_retransmission() {
    let config = Config::default()
        .with_ack_timeout(Duration::from_millis(50))
        .with_max_retransmit(4);
    let (endpoint, _, _) = engine_endpoint(config).await;

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr: SocketAddr = format!("127.0.0.1:{}", peer.local_addr().unwrap().port())
        .parse()
        .unwrap();

    let mut request = Message::request(Code::GET, true);
    request.options.set_uri_path("x");
    request.destination = Some(peer_addr);
    let rx = endpoint.send_request(request).unwrap();

    // first copy arrives; answer with RST
    let mut buf = [0u8; 512];
    let (len, from) = peer.recv_from(&mut buf).await.unwrap();
    assert!(len >= 4);
    let rst = [0x70, 0x00, buf[2], buf[3]];
    peer.send_to(&rst, from).await.unwrap();

    let outcome = timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(EngineError::Rejected)));

    // no retransmit may fire after the reset
    let extra = timeout(Duration::from_millis(400), peer.recv_from(&mut buf)).await;
    assert!(extra.is_err(), "received a retransmit after RST");

    endpoint.stop().await;
}
