//! The `/.well-known/core` discovery resource (RFC 6690)

use granule_core::option::content_format;
use granule_core::{link_format, Code, Message};
use std::sync::Arc;

use crate::resource::{Resource, ResourceTree};

/// Build the discovery resource over a tree. Mounted by the server at
/// `.well-known/core`.
pub fn core_resource(tree: Arc<ResourceTree>) -> Resource {
    Resource::new("core")
        .content_format(content_format::LINK_FORMAT)
        .on_get(move |request| {
            let tree = tree.clone();
            async move {
                let body = link_format::serialize(&tree.links());
                let mut response = Message::respond_to(&request, Code::CONTENT)
                    .with_payload(body.into_bytes());
                response.options.set_content_format(content_format::LINK_FORMAT);
                response
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use granule_core::MessageType;

    #[tokio::test]
    async fn test_core_lists_resources() {
        let tree = Arc::new(ResourceTree::new());
        tree.add(
            "sensors/temp",
            Resource::new("temp").resource_type("temperature").observable(),
        );
        let core = core_resource(tree.clone());
        let handler = core.method_handler(Code::GET).unwrap();

        let mut request = Message::request(Code::GET, true).with_mid(1);
        request.source = Some("127.0.0.1:1234".parse().unwrap());
        request.options.set_uri_path(".well-known/core");

        let response = handler(request).await;
        assert_eq!(response.message_type, MessageType::Ack);
        assert_eq!(response.options.content_format(), Some(40));
        let body = String::from_utf8(response.payload.to_vec()).unwrap();
        assert!(body.contains("</sensors/temp>"));
        assert!(body.contains("obs"));
    }
}
