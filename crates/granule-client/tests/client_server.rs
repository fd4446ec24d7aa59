//! End-to-end tests: a real client against a real server over loopback

use granule_client::CoapClient;
use granule_core::{Code, Message};
use granule_engine::{Config, Endpoint};
use granule_server::{CoapServer, Resource};
use granule_transport::UdpChannel;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn server() -> (CoapServer, String) {
    let channel = Arc::new(
        UdpChannel::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    );
    let endpoint = Endpoint::new(channel, Config::default());
    let server = CoapServer::new(endpoint);

    server.add(
        "hello",
        Resource::new("hello")
            .resource_type("core.hello")
            .on_get(|req| async move {
                Message::respond_to(&req, Code::CONTENT).with_payload(&b"hello, world"[..])
            }),
    );

    server.start().await.unwrap();
    let authority = format!(
        "127.0.0.1:{}",
        server.endpoint().local_addr().unwrap().port()
    );
    (server, authority)
}

async fn client() -> CoapClient {
    CoapClient::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn get_round_trip() {
    let (server, authority) = server().await;
    let client = client().await;

    let response = client
        .get(&format!("coap://{}/hello", authority))
        .await
        .unwrap();
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.payload.as_ref(), b"hello, world");

    let missing = client
        .get(&format!("coap://{}/nope", authority))
        .await
        .unwrap();
    assert_eq!(missing.code, Code::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn coaps_scheme_is_refused_on_plain_udp() {
    let (server, authority) = server().await;
    let client = client().await;

    let err = client
        .get(&format!("coaps://{}/hello", authority))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        granule_client::ClientError::SchemeNotServed(_)
    ));

    server.stop().await;
}

#[tokio::test]
async fn ping_round_trip() {
    let (server, authority) = server().await;
    let client = client().await;

    let rtt = client.ping(&authority).await.unwrap();
    assert!(rtt < Duration::from_secs(2));

    server.stop().await;
}

#[tokio::test]
async fn discover_lists_resources() {
    let (server, authority) = server().await;
    let client = client().await;

    let links = client.discover(&authority).await.unwrap();
    assert!(links.iter().any(|l| l.uri == "/hello"));

    server.stop().await;
}

#[tokio::test]
async fn blockwise_put_and_get_round_trip() {
    let (server, authority) = server().await;
    let client = client().await;

    // storage resource holding arbitrary bytes
    let stored = Arc::new(RwLock::new(Vec::<u8>::new()));
    let stored_get = stored.clone();
    let stored_put = stored.clone();
    server.add(
        "storage",
        Resource::new("storage")
            .on_get(move |req| {
                let body = stored_get.read().clone();
                async move { Message::respond_to(&req, Code::CONTENT).with_payload(body) }
            })
            .on_put(move |req| {
                *stored_put.write() = req.payload.to_vec();
                async move { Message::respond_to(&req, Code::CHANGED) }
            }),
    );

    // a body needing ceil(3000 / 1024) = 3 blocks each way
    let body: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let uri = format!("coap://{}/storage", authority);

    let put = client.put(&uri, body.clone()).await.unwrap();
    assert_eq!(put.code, Code::CHANGED);
    assert_eq!(*stored.read(), body);

    let get = client.get(&uri).await.unwrap();
    assert_eq!(get.code, Code::CONTENT);
    assert_eq!(get.payload.as_ref(), &body[..]);

    server.stop().await;
}

#[tokio::test]
async fn observe_register_notify_and_deregister() {
    let (server, authority) = server().await;
    let client = client().await;

    let value = Arc::new(RwLock::new(0u32));
    let value_read = value.clone();
    let resource = server.add(
        "counter",
        Resource::new("counter").observable().on_get(move |req| {
            let current = *value_read.read();
            async move {
                Message::respond_to(&req, Code::CONTENT)
                    .with_payload(current.to_string().into_bytes())
            }
        }),
    );

    let uri = format!("coap://{}/counter", authority);
    let mut stream = client.observe(&uri).await.unwrap();

    // initial response
    let first = timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.payload.as_ref(), b"0");
    assert!(first.options.observe().is_some());

    // one notification per change
    *value.write() = 1;
    resource.changed();
    let second = timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.payload.as_ref(), b"1");
    // sequence numbers increase
    assert!(second.options.observe().unwrap() > first.options.observe().unwrap());

    assert_eq!(resource.observer_count(), 1);

    // deregistration cancels the relation server-side
    stream.deregister().await.unwrap();
    assert_eq!(resource.observer_count(), 0);

    // further changes produce nothing for the old observer
    *value.write() = 2;
    resource.changed();
    tokio::time::sleep(Duration::from_millis(200)).await;

    server.stop().await;
}

#[tokio::test]
async fn separate_response_resource() {
    let (server, authority) = server().await;
    let client = client().await;

    server.add(
        "slow",
        Resource::new("slow").separate().on_get(|req| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Message::respond_to(&req, Code::CONTENT).with_payload(&b"eventually"[..])
        }),
    );

    let response = client
        .get(&format!("coap://{}/slow", authority))
        .await
        .unwrap();
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.payload.as_ref(), b"eventually");

    server.stop().await;
}
