//! The resource tree
//!
//! A rooted tree of resources addressable by path segment. Each node
//! carries visibility, an observable flag, link-format attributes, and
//! async handler callbacks per method. The tree is shared between the
//! deliverer (lookups) and application code (notifications), so nodes
//! live behind `Arc` and their mutable parts behind locks.

use granule_core::link_format::WebLink;
use granule_core::{Code, Message};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

use crate::observe::ObserveRelation;

/// Boxed async handler: assembled request in, response out
pub type Handler =
    Arc<dyn Fn(Message) -> Pin<Box<dyn Future<Output = Message> + Send>> + Send + Sync>;

/// Link-format attributes of a resource
#[derive(Debug, Clone, Default)]
pub struct ResourceAttributes {
    pub title: Option<String>,
    pub resource_types: Vec<String>,
    pub interfaces: Vec<String>,
    pub content_format: Option<u16>,
    pub max_size: Option<usize>,
}

/// One node in the resource tree
pub struct Resource {
    name: String,
    visible: bool,
    observable: bool,
    /// When set, CON requests get an immediate empty ACK and the real
    /// response goes out separately
    separate_response: bool,
    attributes: RwLock<ResourceAttributes>,
    handlers: RwLock<HashMap<u8, Handler>>,
    children: RwLock<HashMap<String, Arc<Resource>>>,
    relations: Mutex<Vec<Arc<ObserveRelation>>>,
}

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Resource {
            name: name.into(),
            visible: true,
            observable: false,
            separate_response: false,
            attributes: RwLock::new(ResourceAttributes::default()),
            handlers: RwLock::new(HashMap::new()),
            children: RwLock::new(HashMap::new()),
            relations: Mutex::new(Vec::new()),
        }
    }

    // --- builder surface ---

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn observable(mut self) -> Self {
        self.observable = true;
        self
    }

    pub fn separate(mut self) -> Self {
        self.separate_response = true;
        self
    }

    pub fn title(self, title: impl Into<String>) -> Self {
        self.attributes.write().title = Some(title.into());
        self
    }

    pub fn resource_type(self, rt: impl Into<String>) -> Self {
        self.attributes.write().resource_types.push(rt.into());
        self
    }

    pub fn interface(self, interface: impl Into<String>) -> Self {
        self.attributes.write().interfaces.push(interface.into());
        self
    }

    pub fn content_format(self, format: u16) -> Self {
        self.attributes.write().content_format = Some(format);
        self
    }

    pub fn max_size(self, size: usize) -> Self {
        self.attributes.write().max_size = Some(size);
        self
    }

    pub fn handler<F, Fut>(self, method: Code, f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Message> + Send + 'static,
    {
        self.handlers
            .write()
            .insert(method.0, Arc::new(move |request| Box::pin(f(request))));
        self
    }

    pub fn on_get<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Message> + Send + 'static,
    {
        self.handler(Code::GET, f)
    }

    pub fn on_post<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Message> + Send + 'static,
    {
        self.handler(Code::POST, f)
    }

    pub fn on_put<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Message> + Send + 'static,
    {
        self.handler(Code::PUT, f)
    }

    pub fn on_delete<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Message> + Send + 'static,
    {
        self.handler(Code::DELETE, f)
    }

    pub fn on_fetch<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Message> + Send + 'static,
    {
        self.handler(Code::FETCH, f)
    }

    // --- runtime surface ---

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_observable(&self) -> bool {
        self.observable
    }

    pub fn wants_separate_response(&self) -> bool {
        self.separate_response
    }

    pub fn attributes(&self) -> ResourceAttributes {
        self.attributes.read().clone()
    }

    pub fn method_handler(&self, method: Code) -> Option<Handler> {
        self.handlers.read().get(&method.0).cloned()
    }

    pub fn add_child(&self, child: Resource) -> Arc<Resource> {
        let child = Arc::new(child);
        self.children
            .write()
            .insert(child.name.clone(), child.clone());
        child
    }

    pub fn child(&self, name: &str) -> Option<Arc<Resource>> {
        self.children.read().get(name).cloned()
    }

    pub fn children(&self) -> Vec<Arc<Resource>> {
        self.children.read().values().cloned().collect()
    }

    // --- observe relations ---

    pub(crate) fn add_relation(&self, relation: Arc<ObserveRelation>) {
        self.relations.lock().push(relation);
    }

    pub(crate) fn remove_relation(&self, relation: &Arc<ObserveRelation>) {
        self.relations
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, relation));
    }

    pub(crate) fn relations(&self) -> Vec<Arc<ObserveRelation>> {
        self.relations.lock().clone()
    }

    pub fn observer_count(&self) -> usize {
        self.relations.lock().len()
    }

    /// The resource's state changed: push a notification to every
    /// observer
    pub fn changed(&self) {
        let relations = self.relations();
        if relations.is_empty() {
            return;
        }
        debug!(
            "resource {} changed, notifying {} observers",
            self.name,
            relations.len()
        );
        for relation in relations {
            relation.notify();
        }
    }
}

/// The tree root plus path walking
pub struct ResourceTree {
    root: Arc<Resource>,
}

impl ResourceTree {
    pub fn new() -> Self {
        ResourceTree {
            root: Arc::new(Resource::new("")),
        }
    }

    pub fn root(&self) -> &Arc<Resource> {
        &self.root
    }

    /// Mount a resource at a path, creating invisible intermediate
    /// nodes. The resource takes the final segment as its name.
    pub fn add(&self, path: &str, mut resource: Resource) -> Arc<Resource> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut node = self.root.clone();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            node = match node.child(segment) {
                Some(child) => child,
                None => node.add_child(Resource::new(*segment).hidden()),
            };
        }
        if let Some(last) = segments.last() {
            resource.name = (*last).to_string();
        }
        node.add_child(resource)
    }

    /// Walk children by ordered path segments
    pub fn find(&self, segments: &[String]) -> Option<Arc<Resource>> {
        let mut node = self.root.clone();
        for segment in segments {
            node = node.child(segment)?;
        }
        Some(node)
    }

    /// Visible resources as link-format entries
    pub fn links(&self) -> Vec<WebLink> {
        let mut links = Vec::new();
        collect_links(&self.root, String::new(), &mut links);
        links
    }
}

impl Default for ResourceTree {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_links(resource: &Arc<Resource>, prefix: String, links: &mut Vec<WebLink>) {
    for child in resource.children() {
        let uri = format!("{}/{}", prefix, child.name());
        if child.is_visible() {
            let attrs = child.attributes();
            let mut link = WebLink::new(uri.clone());
            for rt in &attrs.resource_types {
                link = link.with_attribute("rt", Some(rt));
            }
            for interface in &attrs.interfaces {
                link = link.with_attribute("if", Some(interface));
            }
            if let Some(title) = &attrs.title {
                link = link.with_attribute("title", Some(title));
            }
            if let Some(ct) = attrs.content_format {
                link = link.with_attribute("ct", Some(&ct.to_string()));
            }
            if let Some(sz) = attrs.max_size {
                link = link.with_attribute("sz", Some(&sz.to_string()));
            }
            if child.is_observable() {
                link = link.with_attribute("obs", None);
            }
            links.push(link);
        }
        collect_links(&child, uri, links);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granule_core::link_format;

    #[test]
    fn test_add_and_find() {
        let tree = ResourceTree::new();
        tree.add("sensors/temp", Resource::new("temp"));
        let found = tree
            .find(&["sensors".to_string(), "temp".to_string()])
            .unwrap();
        assert_eq!(found.name(), "temp");
        assert!(tree.find(&["sensors".to_string(), "hum".to_string()]).is_none());
    }

    #[test]
    fn test_intermediate_nodes_are_hidden() {
        let tree = ResourceTree::new();
        tree.add(
            "sensors/temp",
            Resource::new("temp").resource_type("temperature").observable(),
        );
        let links = tree.links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].uri, "/sensors/temp");
        assert!(links[0].has_flag("obs"));
    }

    #[test]
    fn test_links_serialize() {
        let tree = ResourceTree::new();
        tree.add(
            "sensors/temp",
            Resource::new("temp")
                .resource_type("temperature")
                .interface("sensor")
                .observable(),
        );
        tree.add("sensors/hum", Resource::new("hum").resource_type("humidity"));

        let wire = link_format::serialize(&tree.links());
        assert!(wire.contains("</sensors/temp>"));
        assert!(wire.contains("rt=\"temperature\""));
        assert!(wire.contains(";obs"));
        assert!(wire.contains("</sensors/hum>"));
    }

    #[tokio::test]
    async fn test_handler_dispatch() {
        let resource = Resource::new("echo").on_get(|request| async move {
            Message::respond_to(&request, Code::CONTENT).with_payload(&b"hi"[..])
        });
        let handler = resource.method_handler(Code::GET).unwrap();
        let mut request = Message::request(Code::GET, true).with_mid(1);
        request.source = Some("127.0.0.1:1111".parse().unwrap());
        let response = handler(request).await;
        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.payload.as_ref(), b"hi");
        assert!(resource.method_handler(Code::POST).is_none());
    }
}
