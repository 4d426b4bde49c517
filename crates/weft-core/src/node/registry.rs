//! Node-type registry.
//!
//! Maps type identifiers to boxed handlers, grouped into named packs. Flows
//! declare the packs they need in `flow.nodePacks`.

use std::collections::{BTreeSet, HashMap};

use super::handler::{BoxNodeHandler, NodeHandler};

/// Pack used by [`NodeRegistry::register`].
pub const DEFAULT_PACK: &str = "default";

/// Registry of available node types, indexed by type id.
pub struct NodeRegistry {
    handlers: HashMap<String, BoxNodeHandler>,
    type_pack: HashMap<String, String>,
    packs: HashMap<String, BTreeSet<String>>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            type_pack: HashMap::new(),
            packs: HashMap::new(),
        }
    }

    /// Register a handler in the default pack.
    pub fn register<T: NodeHandler>(&mut self, handler: T) -> &mut Self {
        self.register_boxed(DEFAULT_PACK, BoxNodeHandler::new(handler))
    }

    /// Register a pack of handlers under `name`. An empty pack still counts
    /// as registered.
    pub fn register_pack(
        &mut self,
        name: impl Into<String>,
        handlers: impl IntoIterator<Item = BoxNodeHandler>,
    ) -> &mut Self {
        let name = name.into();
        self.packs.entry(name.clone()).or_default();
        for handler in handlers {
            self.register_boxed(&name, handler);
        }
        self
    }

    /// Register one boxed handler in `pack`.
    ///
    /// If the type id is already registered, the old handler is replaced.
    pub fn register_boxed(&mut self, pack: &str, handler: BoxNodeHandler) -> &mut Self {
        let node_type = handler.node_type().to_string();
        if let Some(previous_pack) = self.type_pack.get(&node_type) {
            tracing::warn!(
                node_type = node_type.as_str(),
                previous_pack = previous_pack.as_str(),
                pack,
                "replacing registered node type"
            );
            if let Some(members) = self.packs.get_mut(previous_pack) {
                members.remove(&node_type);
            }
        }
        self.packs
            .entry(pack.to_string())
            .or_default()
            .insert(node_type.clone());
        self.type_pack.insert(node_type.clone(), pack.to_string());
        self.handlers.insert(node_type, handler);
        self
    }

    /// Look up a handler by type id.
    pub fn get(&self, node_type: &str) -> Option<&BoxNodeHandler> {
        self.handlers.get(node_type)
    }

    pub fn has_pack(&self, pack: &str) -> bool {
        self.packs.contains_key(pack)
    }

    /// The pack a type id was registered in.
    pub fn pack_of(&self, node_type: &str) -> Option<&str> {
        self.type_pack.get(node_type).map(String::as_str)
    }

    /// All registered type ids, sorted.
    pub fn type_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("types", &self.type_ids())
            .field("packs", &self.packs.keys().collect::<BTreeSet<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::handler::FnNode;
    use serde_json::{json, Value};

    fn node(node_type: &str, tag: &'static str) -> FnNode {
        FnNode::new(node_type, move |_ctx, _input: Value| async move { Ok(json!(tag)) })
    }

    #[test]
    fn test_register_default_pack() {
        let mut registry = NodeRegistry::new();
        registry.register(node("echo", "v1"));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert!(registry.has_pack(DEFAULT_PACK));
        assert_eq!(registry.pack_of("echo"), Some(DEFAULT_PACK));
    }

    #[test]
    fn test_register_pack_groups_types() {
        let mut registry = NodeRegistry::new();
        registry
            .register_pack(
                "core",
                [
                    BoxNodeHandler::new(node("list", "l")),
                    BoxNodeHandler::new(node("echo", "e")),
                ],
            )
            .register_pack("empty", []);
        assert_eq!(registry.type_ids(), vec!["echo", "list"]);
        assert_eq!(registry.pack_of("list"), Some("core"));
        assert!(registry.has_pack("empty"));
        assert!(!registry.has_pack("agents"));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_type_replaces_handler() {
        let mut registry = NodeRegistry::new();
        registry.register(node("echo", "v1"));
        registry.register_pack("core", [BoxNodeHandler::new(node("echo", "v2"))]);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.pack_of("echo"), Some("core"));

        let ctx = crate::node::context::NodeContext::new(
            uuid::Uuid::nil(),
            "n",
            crate::hub::Hub::new(),
        );
        let out = registry.get("echo").unwrap().run(ctx, json!({})).await.unwrap();
        assert_eq!(out, json!("v2"));
    }
}
