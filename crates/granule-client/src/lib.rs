//! Granule Client
//!
//! Client façade for the Granule CoAP stack: request/response with
//! timeouts, observe streams, ping, discovery, and multicast.
//!
//! # Example
//!
//! ```no_run
//! use granule_client::CoapClient;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = CoapClient::builder().build().await?;
//!     let response = client.get("coap://127.0.0.1/hello").await?;
//!     println!("{}", String::from_utf8_lossy(&response.payload));
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod client;
pub mod error;

pub use builder::CoapClientBuilder;
pub use client::{CoapClient, ObserveStream};
pub use error::{ClientError, Result};
