//! granule - command-line CoAP client and demo server

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use granule_client::CoapClient;
use granule_core::{Code, Message};
use granule_engine::{Config, DeduplicatorMode, Endpoint};
use granule_server::{CoapServer, Resource};
use granule_transport::{UdpChannel, UdpConfig};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Granule - CoAP over UDP
#[derive(Parser)]
#[command(name = "granule")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a demo server
    Serve {
        /// Bind address
        #[arg(short, long, default_value = "0.0.0.0:5683")]
        bind: SocketAddr,

        /// Deduplicator strategy (MarkAndSweep, CropRotation, Noop)
        #[arg(short, long, default_value = "MarkAndSweep")]
        deduplicator: String,
    },

    /// GET a resource
    Get {
        /// Target, e.g. coap://127.0.0.1:5683/hello
        uri: String,

        /// Response timeout in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },

    /// PUT a payload to a resource
    Put {
        uri: String,
        payload: String,

        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },

    /// Observe a resource and print notifications
    Observe {
        uri: String,

        /// Stop after this many notifications (0 = forever)
        #[arg(short, long, default_value = "0")]
        count: u32,
    },

    /// CoAP ping
    Ping {
        /// host:port
        authority: String,
    },

    /// List a server's resources from /.well-known/core
    Discover {
        /// host:port
        authority: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }

    match cli.command {
        Commands::Serve { bind, deduplicator } => serve(bind, &deduplicator).await,
        Commands::Get { uri, timeout } => {
            let client = client(timeout).await?;
            let response = client.get(&uri).await.context("get failed")?;
            print_response(&response);
            Ok(())
        }
        Commands::Put {
            uri,
            payload,
            timeout,
        } => {
            let client = client(timeout).await?;
            let response = client
                .put(&uri, payload.into_bytes())
                .await
                .context("put failed")?;
            print_response(&response);
            Ok(())
        }
        Commands::Observe { uri, count } => {
            let client = client(30).await?;
            let mut stream = client.observe(&uri).await.context("observe failed")?;
            let mut seen = 0u32;
            while let Some(notification) = stream.next().await {
                print_response(&notification);
                seen += 1;
                if count > 0 && seen >= count {
                    break;
                }
            }
            stream.deregister().await.context("deregister failed")?;
            Ok(())
        }
        Commands::Ping { authority } => {
            let client = client(10).await?;
            let rtt = client.ping(&authority).await.context("ping failed")?;
            println!("pong from {} in {:?}", authority, rtt);
            Ok(())
        }
        Commands::Discover { authority } => {
            let client = client(10).await?;
            let links = client
                .discover(&authority)
                .await
                .context("discover failed")?;
            for link in links {
                let attrs: Vec<String> = link
                    .attributes
                    .iter()
                    .map(|a| match &a.value {
                        Some(v) => format!("{}={}", a.name, v),
                        None => a.name.clone(),
                    })
                    .collect();
                println!("{} [{}]", link.uri, attrs.join(", "));
            }
            Ok(())
        }
    }
}

async fn client(timeout_secs: u64) -> Result<CoapClient> {
    CoapClient::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .await
        .context("could not start client endpoint")
}

fn print_response(response: &Message) {
    println!(
        "{} {} {}",
        response.message_type,
        response.code,
        String::from_utf8_lossy(&response.payload)
    );
}

/// Demo server: a hello resource, an observable counter, and storage
async fn serve(bind: SocketAddr, deduplicator: &str) -> Result<()> {
    let mut config = Config::default();
    if let Some(mode) = DeduplicatorMode::from_name(deduplicator) {
        config = config.with_deduplicator(mode);
    }
    let udp_config = UdpConfig {
        receive_packet_size: config.channel_receive_packet_size,
        ..UdpConfig::default()
    };
    let channel = Arc::new(UdpChannel::bind_with_config(bind, udp_config).await?);
    let endpoint = Endpoint::new(channel, config);
    let server = CoapServer::new(endpoint);

    server.add(
        "hello",
        Resource::new("hello")
            .title("greeting")
            .resource_type("core.hello")
            .on_get(|req| async move {
                Message::respond_to(&req, Code::CONTENT).with_payload(&b"hello, world"[..])
            }),
    );

    // observable counter, ticking once a second
    let counter = Arc::new(RwLock::new(0u64));
    let counter_read = counter.clone();
    let counter_resource = server.add(
        "counter",
        Resource::new("counter")
            .observable()
            .resource_type("core.counter")
            .on_get(move |req| {
                let value = *counter_read.read();
                async move {
                    Message::respond_to(&req, Code::CONTENT)
                        .with_payload(value.to_string().into_bytes())
                }
            }),
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            *counter.write() += 1;
            counter_resource.changed();
        }
    });

    // simple read/write storage
    let stored = Arc::new(RwLock::new(Vec::<u8>::new()));
    let stored_read = stored.clone();
    server.add(
        "storage",
        Resource::new("storage")
            .title("scratch storage")
            .on_get(move |req| {
                let body = stored_read.read().clone();
                async move { Message::respond_to(&req, Code::CONTENT).with_payload(body) }
            })
            .on_put(move |req| {
                *stored.write() = req.payload.to_vec();
                async move { Message::respond_to(&req, Code::CHANGED) }
            }),
    );

    server.start().await?;
    info!("serving coap on {}", bind);
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop().await;
    Ok(())
}
