pub mod context;
pub mod handler;
pub mod registry;
pub mod schema;

pub use context::NodeContext;
pub use handler::{BoxNodeHandler, FnNode, NodeCapabilities, NodeHandler, Typed, TypedNode};
pub use registry::NodeRegistry;
