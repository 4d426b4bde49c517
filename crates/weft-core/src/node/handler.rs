//! The node contract.
//!
//! `NodeHandler` is the native async trait (RPITIT). Flows look node types up
//! by string id at run time, so the registry stores them type-erased:
//! 1. `NodeHandlerDyn` is the object-safe form with boxed `'static` futures
//! 2. a blanket impl covers every `T: NodeHandler`
//! 3. `BoxNodeHandler` wraps `Arc<dyn NodeHandlerDyn>` and delegates
//!
//! `TypedNode` is for statically known node types: serde input/output types
//! whose schemas are derived with `schemars`. `FnNode` backs a node with a
//! closure and explicit schemas.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context as _;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::NodeContext;
use super::schema::{Schema, SchemaError};

/// A boxed, sendable node run future.
pub type NodeFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + 'static>>;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Optional behaviour flags a node type advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCapabilities {
    #[serde(default)]
    pub is_container: bool,
    #[serde(default)]
    pub creates_session: bool,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub supports_inbox: bool,
}

impl NodeCapabilities {
    pub fn container() -> Self {
        Self {
            is_container: true,
            ..Default::default()
        }
    }

    pub fn with_inbox(mut self) -> Self {
        self.supports_inbox = true;
        self
    }

    pub fn with_session(mut self) -> Self {
        self.creates_session = true;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.is_streaming = true;
        self
    }

    /// Whether iterations of this node get `session:start`/`session:end`.
    pub fn opens_sessions(&self) -> bool {
        self.is_container || self.creates_session
    }
}

// ---------------------------------------------------------------------------
// NodeHandler
// ---------------------------------------------------------------------------

/// A pluggable node type.
///
/// `run` may be invoked more than once for the same node when a retry policy
/// applies; implementations must be safe to retry or say otherwise.
pub trait NodeHandler: Send + Sync + 'static {
    /// Registered type identifier, e.g. `"echo"`.
    fn node_type(&self) -> &str;

    fn input_schema(&self) -> &Schema;

    fn output_schema(&self) -> &Schema;

    fn capabilities(&self) -> NodeCapabilities {
        NodeCapabilities::default()
    }

    fn run(
        &self,
        ctx: NodeContext,
        input: Value,
    ) -> impl Future<Output = anyhow::Result<Value>> + Send;
}

/// Object-safe version of [`NodeHandler`] with boxed futures.
pub trait NodeHandlerDyn: Send + Sync {
    fn node_type(&self) -> &str;

    fn input_schema(&self) -> &Schema;

    fn output_schema(&self) -> &Schema;

    fn capabilities(&self) -> NodeCapabilities;

    fn run_boxed(self: Arc<Self>, ctx: NodeContext, input: Value) -> NodeFuture;
}

impl<T: NodeHandler> NodeHandlerDyn for T {
    fn node_type(&self) -> &str {
        NodeHandler::node_type(self)
    }

    fn input_schema(&self) -> &Schema {
        NodeHandler::input_schema(self)
    }

    fn output_schema(&self) -> &Schema {
        NodeHandler::output_schema(self)
    }

    fn capabilities(&self) -> NodeCapabilities {
        NodeHandler::capabilities(self)
    }

    fn run_boxed(self: Arc<Self>, ctx: NodeContext, input: Value) -> NodeFuture {
        Box::pin(async move { self.run(ctx, input).await })
    }
}

/// Type-erased node handler, cheap to clone.
#[derive(Clone)]
pub struct BoxNodeHandler {
    inner: Arc<dyn NodeHandlerDyn>,
}

impl BoxNodeHandler {
    pub fn new<T: NodeHandler>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub fn from_arc(inner: Arc<dyn NodeHandlerDyn>) -> Self {
        Self { inner }
    }

    pub fn node_type(&self) -> &str {
        self.inner.node_type()
    }

    pub fn input_schema(&self) -> &Schema {
        self.inner.input_schema()
    }

    pub fn output_schema(&self) -> &Schema {
        self.inner.output_schema()
    }

    pub fn capabilities(&self) -> NodeCapabilities {
        self.inner.capabilities()
    }

    /// Start one invocation. The returned future owns everything it needs.
    pub fn run(&self, ctx: NodeContext, input: Value) -> NodeFuture {
        Arc::clone(&self.inner).run_boxed(ctx, input)
    }
}

impl std::fmt::Debug for BoxNodeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxNodeHandler")
            .field("node_type", &self.node_type())
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TypedNode
// ---------------------------------------------------------------------------

/// A node type with statically known input and output types.
pub trait TypedNode: Send + Sync + 'static {
    type Input: DeserializeOwned + JsonSchema + Send;
    type Output: Serialize + JsonSchema;

    fn node_type(&self) -> &str;

    fn capabilities(&self) -> NodeCapabilities {
        NodeCapabilities::default()
    }

    fn run(
        &self,
        ctx: NodeContext,
        input: Self::Input,
    ) -> impl Future<Output = anyhow::Result<Self::Output>> + Send;
}

/// Adapter exposing a [`TypedNode`] as a [`NodeHandler`].
///
/// Both schemas are generated and compiled once, in [`Typed::new`].
pub struct Typed<T: TypedNode> {
    node: T,
    input_schema: Schema,
    output_schema: Schema,
}

impl<T: TypedNode> Typed<T> {
    pub fn new(node: T) -> Result<Self, SchemaError> {
        Ok(Self {
            input_schema: derived_schema::<T::Input>()?,
            output_schema: derived_schema::<T::Output>()?,
            node,
        })
    }
}

fn derived_schema<S: JsonSchema>() -> Result<Schema, SchemaError> {
    let document = schemars::SchemaGenerator::default().into_root_schema_for::<S>();
    Schema::compile(document.as_value())
}

impl<T: TypedNode> NodeHandler for Typed<T> {
    fn node_type(&self) -> &str {
        self.node.node_type()
    }

    fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    fn capabilities(&self) -> NodeCapabilities {
        self.node.capabilities()
    }

    async fn run(&self, ctx: NodeContext, input: Value) -> anyhow::Result<Value> {
        let input: T::Input =
            serde_json::from_value(input).context("input does not match node input type")?;
        let output = self.node.run(ctx, input).await?;
        Ok(serde_json::to_value(output)?)
    }
}

// ---------------------------------------------------------------------------
// FnNode
// ---------------------------------------------------------------------------

type NodeFn = dyn Fn(NodeContext, Value) -> NodeFuture + Send + Sync;

/// A closure-backed node type with explicit schemas (default: accept any).
pub struct FnNode {
    node_type: String,
    input_schema: Schema,
    output_schema: Schema,
    capabilities: NodeCapabilities,
    func: Arc<NodeFn>,
}

impl FnNode {
    pub fn new<F, Fut>(node_type: impl Into<String>, func: F) -> Self
    where
        F: Fn(NodeContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            node_type: node_type.into(),
            input_schema: Schema::any(),
            output_schema: Schema::any(),
            capabilities: NodeCapabilities::default(),
            func: Arc::new(move |ctx, input| Box::pin(func(ctx, input))),
        }
    }

    pub fn with_input_schema(mut self, document: &Value) -> Result<Self, SchemaError> {
        self.input_schema = Schema::compile(document)?;
        Ok(self)
    }

    pub fn with_output_schema(mut self, document: &Value) -> Result<Self, SchemaError> {
        self.output_schema = Schema::compile(document)?;
        Ok(self)
    }

    pub fn with_capabilities(mut self, capabilities: NodeCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl NodeHandler for FnNode {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    fn capabilities(&self) -> NodeCapabilities {
        self.capabilities
    }

    fn run(
        &self,
        ctx: NodeContext,
        input: Value,
    ) -> impl Future<Output = anyhow::Result<Value>> + Send {
        (self.func)(ctx, input)
    }
}

/// A [`TypedNode`] backed by a closure over concrete input/output types.
pub struct TypedFn<I, O, F> {
    node_type: String,
    func: F,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O, F, Fut> TypedFn<I, O, F>
where
    I: DeserializeOwned + JsonSchema + Send + 'static,
    O: Serialize + JsonSchema + 'static,
    F: Fn(NodeContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send,
{
    pub fn new(node_type: impl Into<String>, func: F) -> Self {
        Self {
            node_type: node_type.into(),
            func,
            _types: PhantomData,
        }
    }
}

impl<I, O, F, Fut> TypedNode for TypedFn<I, O, F>
where
    I: DeserializeOwned + JsonSchema + Send + 'static,
    O: Serialize + JsonSchema + 'static,
    F: Fn(NodeContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send,
{
    type Input = I;
    type Output = O;

    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn run(&self, ctx: NodeContext, input: I) -> impl Future<Output = anyhow::Result<O>> + Send {
        (self.func)(ctx, input)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
