//! Request delivery
//!
//! `ServerMessageDeliverer` implements the engine's deliverer seam over
//! the resource tree: walk the request's path segments, handle observe
//! registration/deregistration, then invoke the method handler. Handlers
//! run as spawned tasks so the executor worker is never blocked.

use granule_core::{Code, Message};
use granule_engine::{Endpoint, Exchange, MessageDeliverer};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::observe::ObserveManager;
use crate::resource::{Resource, ResourceTree};

pub struct ServerMessageDeliverer {
    tree: Arc<ResourceTree>,
    observe: Arc<ObserveManager>,
}

impl ServerMessageDeliverer {
    pub fn new(tree: Arc<ResourceTree>, observe: Arc<ObserveManager>) -> Self {
        ServerMessageDeliverer { tree, observe }
    }

    /// Observe register/deregister is attempted before the handler runs
    fn handle_observe(
        &self,
        resource: &Arc<Resource>,
        exchange: &Arc<Exchange>,
        endpoint: &Endpoint,
        request: &Message,
    ) {
        if !matches!(request.code, Code::GET | Code::FETCH) {
            return;
        }
        if request.is_observe_register() {
            if resource.is_observable() {
                self.observe.register(resource, exchange, endpoint, request);
            } else {
                trace!("observe register against non-observable {}", resource.name());
            }
        } else if request.is_observe_deregister() {
            if let (Some(source), Some(token)) = (request.source, request.token) {
                self.observe.deregister(source, token);
            }
        }
    }
}

impl MessageDeliverer for ServerMessageDeliverer {
    fn deliver_request(&self, exchange: Arc<Exchange>, request: Message, endpoint: Endpoint) {
        let segments = request.options.uri_path();
        let resource = match self.tree.find(&segments) {
            Some(resource) => resource,
            None => {
                debug!("no resource at /{}", segments.join("/"));
                endpoint.respond(&exchange, Message::respond_to(&request, Code::NOT_FOUND));
                return;
            }
        };

        self.handle_observe(&resource, &exchange, &endpoint, &request);

        let handler = match resource.method_handler(request.code) {
            Some(handler) => handler,
            None => {
                endpoint.respond(
                    &exchange,
                    Message::respond_to(&request, Code::METHOD_NOT_ALLOWED),
                );
                return;
            }
        };

        // a slow resource acknowledges first and responds separately
        let separate = resource.wants_separate_response() && request.is_confirmable();
        if separate {
            endpoint.acknowledge(&exchange);
        }

        let future = handler(request.clone());
        tokio::spawn(async move {
            let mut response = future.await;
            if separate && response.message_type == granule_core::MessageType::Ack {
                // the ACK already went out; promote to a separate CON
                response.message_type = granule_core::MessageType::Con;
                response.mid = None;
            }
            endpoint.respond(&exchange, response);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granule_core::MessageType;

    #[test]
    fn test_not_found_shape() {
        let mut request = Message::request(Code::GET, true).with_mid(7);
        request.source = Some("127.0.0.1:4444".parse().unwrap());
        request.options.set_uri_path("missing");
        let response = Message::respond_to(&request, Code::NOT_FOUND);
        assert_eq!(response.message_type, MessageType::Ack);
        assert_eq!(response.code, Code::NOT_FOUND);
        assert_eq!(response.mid, Some(7));
    }
}
