//! Granule Server
//!
//! The server side of the Granule CoAP stack: a URI-path tree of
//! resources with per-method async handlers, observe relations, and the
//! deliverer that routes inbound requests from the engine into the tree.
//!
//! # Example
//!
//! ```no_run
//! use granule_core::{Code, Message};
//! use granule_engine::{Config, Endpoint};
//! use granule_server::{CoapServer, Resource};
//! use granule_transport::UdpChannel;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let channel = Arc::new(UdpChannel::bind("0.0.0.0:5683".parse()?).await?);
//!     let endpoint = Endpoint::new(channel, Config::default());
//!     let server = CoapServer::new(endpoint);
//!
//!     server.add(
//!         "hello",
//!         Resource::new("hello").on_get(|req| async move {
//!             Message::respond_to(&req, Code::CONTENT).with_payload(&b"hello, world"[..])
//!         }),
//!     );
//!
//!     server.start().await?;
//!     std::future::pending::<()>().await;
//!     Ok(())
//! }
//! ```

pub mod deliverer;
pub mod observe;
pub mod resource;
pub mod well_known;

pub use deliverer::ServerMessageDeliverer;
pub use observe::{ObserveManager, ObserveRelation, ObservingEndpoint};
pub use resource::{Resource, ResourceAttributes, ResourceTree};

use granule_engine::Endpoint;
use std::sync::Arc;

/// Server façade: an endpoint, a resource tree, and observe bookkeeping
pub struct CoapServer {
    endpoint: Endpoint,
    tree: Arc<ResourceTree>,
    observe: Arc<ObserveManager>,
}

impl CoapServer {
    /// Wire a deliverer over a fresh tree into the endpoint. The
    /// discovery resource is mounted automatically.
    pub fn new(endpoint: Endpoint) -> Self {
        let tree = Arc::new(ResourceTree::new());
        let observe = Arc::new(ObserveManager::new());
        endpoint.set_deliverer(Arc::new(ServerMessageDeliverer::new(
            tree.clone(),
            observe.clone(),
        )));

        let well_known = tree.add(
            ".well-known",
            Resource::new(".well-known").hidden(),
        );
        well_known.add_child(well_known::core_resource(tree.clone()));

        CoapServer {
            endpoint,
            tree,
            observe,
        }
    }

    /// Mount a resource; returns the shared node for later
    /// `changed()` notifications
    pub fn add(&self, path: &str, resource: Resource) -> Arc<Resource> {
        self.tree.add(path, resource)
    }

    pub fn tree(&self) -> &Arc<ResourceTree> {
        &self.tree
    }

    pub fn observe(&self) -> &Arc<ObserveManager> {
        &self.observe
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn start(&self) -> granule_engine::Result<()> {
        self.endpoint.start().await
    }

    pub async fn stop(&self) {
        self.endpoint.stop().await;
    }
}
