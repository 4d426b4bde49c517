//! Flow compiler: structural checks and execution order.
//!
//! Uses `petgraph` to model node dependencies as a directed graph. Compilation
//! rejects duplicate ids, dangling edges, cycles and (with a registry)
//! unknown node types or packs, before any node executes.
//!
//! Ordering is deterministic: Kahn's algorithm seeded in node declaration
//! order. A `forEach` edge whose target can already reach its source is a
//! *loop edge*; it is excluded from ordering and gating and handled by the
//! scheduler as a re-run of the target.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use weft_types::error::{ErrorCode, NodeError};
use weft_types::flow::{EdgeDefinition, FlowDefinition, NodeDefinition};

use super::definition::{validate_definition, DefinitionError};
use crate::node::NodeRegistry;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Compile-time errors. All are fatal and reported before execution.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("edge '{edge}' references unknown node '{node}'")]
    UnknownNode { edge: String, node: String },

    #[error("cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("node '{node}' has unregistered type '{node_type}'")]
    UnknownType { node: String, node_type: String },

    #[error("node pack '{0}' is not registered")]
    UnregisteredPack(String),

    #[error("node '{0}' has more than one incoming forEach edge")]
    MultipleForEach(String),
}

impl CompileError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CompileError::Definition(e) => e.code(),
            CompileError::DuplicateNode(_)
            | CompileError::UnknownNode { .. }
            | CompileError::UnknownType { .. } => ErrorCode::NodeNotFound,
            CompileError::Cycle { .. }
            | CompileError::UnregisteredPack(_)
            | CompileError::MultipleForEach(_) => ErrorCode::SchemaValidationError,
        }
    }

    pub fn to_node_error(&self) -> NodeError {
        let error = NodeError::new(self.code(), self.to_string());
        match self {
            CompileError::UnknownType { node, .. } | CompileError::MultipleForEach(node) => {
                error.with_node(node.clone())
            }
            _ => error,
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled plan
// ---------------------------------------------------------------------------

/// A validated flow plus its execution order and edge indexes.
///
/// Edges are addressed by their index in `definition.edges`.
#[derive(Debug, Clone)]
pub struct CompiledFlow {
    definition: FlowDefinition,
    order: Vec<String>,
    edge_ids: Vec<String>,
    incoming: HashMap<String, Vec<usize>>,
    outgoing: HashMap<String, Vec<usize>>,
    loop_edges: BTreeSet<usize>,
}

impl CompiledFlow {
    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    /// Node ids in execution order: every non-loop edge `a → b` has `a`
    /// before `b`.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.definition.node(id)
    }

    pub fn edge(&self, index: usize) -> &EdgeDefinition {
        &self.definition.edges[index]
    }

    /// Unique id of the edge at `index`.
    pub fn edge_id(&self, index: usize) -> &str {
        &self.edge_ids[index]
    }

    pub fn edge_ids(&self) -> &[String] {
        &self.edge_ids
    }

    /// Gating edges into `node` (loop edges excluded), in declaration order.
    pub fn incoming(&self, node: &str) -> &[usize] {
        self.incoming.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every edge leaving `node`, loop edges included, in declaration order.
    pub fn outgoing(&self, node: &str) -> &[usize] {
        self.outgoing.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_loop_edge(&self, index: usize) -> bool {
        self.loop_edges.contains(&index)
    }

    pub fn loop_edges(&self) -> impl Iterator<Item = usize> + '_ {
        self.loop_edges.iter().copied()
    }

    /// The non-loop `forEach` edge entering `node`, if any.
    pub fn for_each_edge(&self, node: &str) -> Option<usize> {
        self.incoming(node)
            .iter()
            .copied()
            .find(|&i| self.definition.edges[i].for_each.is_some())
    }

    /// Direct predecessors of `node` over gating edges.
    pub fn predecessors(&self, node: &str) -> Vec<&str> {
        self.incoming(node)
            .iter()
            .map(|&i| self.definition.edges[i].from.as_str())
            .collect()
    }

    /// Direct successors of `node`, loop edges included.
    pub fn successors(&self, node: &str) -> Vec<&str> {
        self.outgoing(node)
            .iter()
            .map(|&i| self.definition.edges[i].to.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Compile against a registry: graph checks plus pack and type resolution.
pub fn compile(flow: &FlowDefinition, registry: &NodeRegistry) -> Result<CompiledFlow, CompileError> {
    let compiled = compile_graph(flow)?;

    for pack in &flow.flow.node_packs {
        if !registry.has_pack(pack) {
            return Err(CompileError::UnregisteredPack(pack.clone()));
        }
    }
    for node in &flow.nodes {
        if registry.get(&node.node_type).is_none() {
            return Err(CompileError::UnknownType {
                node: node.id.clone(),
                node_type: node.node_type.clone(),
            });
        }
    }

    tracing::debug!(
        flow = flow.name(),
        nodes = flow.nodes.len(),
        edges = flow.edges.len(),
        "flow compiled"
    );
    Ok(compiled)
}

/// Compile the graph alone, without resolving node types.
pub fn compile_graph(flow: &FlowDefinition) -> Result<CompiledFlow, CompileError> {
    validate_definition(flow)?;

    let mut index_of: HashMap<&str, usize> = HashMap::new();
    for (i, node) in flow.nodes.iter().enumerate() {
        if index_of.insert(node.id.as_str(), i).is_some() {
            return Err(CompileError::DuplicateNode(node.id.clone()));
        }
    }

    let edge_ids = assign_edge_ids(&flow.edges);

    let mut endpoints = Vec::with_capacity(flow.edges.len());
    for (i, edge) in flow.edges.iter().enumerate() {
        let resolve = |node: &str| {
            index_of
                .get(node)
                .copied()
                .ok_or_else(|| CompileError::UnknownNode {
                    edge: edge_ids[i].clone(),
                    node: node.to_string(),
                })
        };
        endpoints.push((resolve(&edge.from)?, resolve(&edge.to)?));
    }

    let mut for_each_targets = HashSet::new();
    for edge in flow.edges.iter().filter(|e| e.for_each.is_some()) {
        if !for_each_targets.insert(edge.to.as_str()) {
            return Err(CompileError::MultipleForEach(edge.to.clone()));
        }
    }

    // Plain edges first: any cycle among them is an error.
    let mut graph = DiGraph::<usize, usize>::new();
    let indices: Vec<NodeIndex> = (0..flow.nodes.len()).map(|i| graph.add_node(i)).collect();
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); flow.nodes.len()];
    let mut gating = vec![false; flow.edges.len()];

    for (i, edge) in flow.edges.iter().enumerate() {
        if edge.for_each.is_none() {
            let (from, to) = endpoints[i];
            graph.add_edge(indices[from], indices[to], i);
            adjacency[from].push(to);
            gating[i] = true;
        }
    }
    if let Some(cycle) = find_cycle(&adjacency) {
        return Err(cycle_error(&cycle, |i| flow.nodes[i].id.as_str()));
    }

    // forEach edges that would close a cycle become loop edges.
    let mut loop_edges = BTreeSet::new();
    for (i, edge) in flow.edges.iter().enumerate() {
        if edge.for_each.is_none() {
            continue;
        }
        let (from, to) = endpoints[i];
        if has_path_connecting(&graph, indices[to], indices[from], None) {
            tracing::debug!(edge = edge_ids[i].as_str(), "forEach edge closes a loop");
            loop_edges.insert(i);
        } else {
            graph.add_edge(indices[from], indices[to], i);
            adjacency[from].push(to);
            gating[i] = true;
        }
    }

    let order = topological_order(&adjacency)
        .map_err(|remaining| {
            let cycle = find_cycle(&adjacency).unwrap_or(remaining);
            cycle_error(&cycle, |i| flow.nodes[i].id.as_str())
        })?
        .into_iter()
        .map(|i| flow.nodes[i].id.clone())
        .collect();

    let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
    let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, edge) in flow.edges.iter().enumerate() {
        outgoing.entry(edge.from.clone()).or_default().push(i);
        if gating[i] {
            incoming.entry(edge.to.clone()).or_default().push(i);
        }
    }

    Ok(CompiledFlow {
        definition: flow.clone(),
        order,
        edge_ids,
        incoming,
        outgoing,
        loop_edges,
    })
}

/// Default edge ids are `from->to`; repeated defaults get a `#n` suffix.
fn assign_edge_ids(edges: &[EdgeDefinition]) -> Vec<String> {
    let explicit: HashSet<&str> = edges.iter().filter_map(|e| e.id.as_deref()).collect();
    let mut seen: HashSet<String> = HashSet::new();
    edges
        .iter()
        .map(|edge| {
            if let Some(id) = &edge.id {
                return id.clone();
            }
            let base = edge.edge_id();
            let mut id = base.clone();
            let mut n = 2;
            while explicit.contains(id.as_str()) || seen.contains(&id) {
                id = format!("{base}#{n}");
                n += 1;
            }
            seen.insert(id.clone());
            id
        })
        .collect()
}

fn cycle_error<'a>(cycle: &[usize], name: impl Fn(usize) -> &'a str) -> CompileError {
    CompileError::Cycle {
        path: cycle.iter().map(|&i| name(i).to_string()).collect(),
    }
}

// ---------------------------------------------------------------------------
// Graph algorithms (shared with the dependency resolver)
// ---------------------------------------------------------------------------

/// Find one cycle with a three-colour DFS. The returned path starts and ends
/// on the same node, e.g. `[a, b, a]`.
pub(crate) fn find_cycle(adjacency: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Colour {
        White,
        Grey,
        Black,
    }

    let n = adjacency.len();
    let mut colour = vec![Colour::White; n];
    let mut stack: Vec<usize> = Vec::new();

    for root in 0..n {
        if colour[root] != Colour::White {
            continue;
        }
        // Iterative DFS: (node, next neighbour position).
        let mut frames: Vec<(usize, usize)> = vec![(root, 0)];
        colour[root] = Colour::Grey;
        stack.push(root);

        while let Some(frame) = frames.last_mut() {
            let (node, pos) = *frame;
            if let Some(&next) = adjacency[node].get(pos) {
                frame.1 += 1;
                match colour[next] {
                    Colour::White => {
                        colour[next] = Colour::Grey;
                        stack.push(next);
                        frames.push((next, 0));
                    }
                    Colour::Grey => {
                        let start = stack.iter().position(|&s| s == next).unwrap_or(0);
                        let mut path = stack[start..].to_vec();
                        path.push(next);
                        return Some(path);
                    }
                    Colour::Black => {}
                }
            } else {
                colour[node] = Colour::Black;
                stack.pop();
                frames.pop();
            }
        }
    }
    None
}

/// Kahn's algorithm, seeded in index order. On a cycle returns the indexes
/// that could not be ordered.
pub(crate) fn topological_order(adjacency: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = adjacency.len();
    let mut in_degree = vec![0usize; n];
    for targets in adjacency {
        for &t in targets {
            in_degree[t] += 1;
        }
    }

    let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(node) = ready.pop_front() {
        order.push(node);
        for &t in &adjacency[node] {
            in_degree[t] -= 1;
            if in_degree[t] == 0 {
                ready.push_back(t);
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        let placed: HashSet<usize> = order.iter().copied().collect();
        Err((0..n).filter(|i| !placed.contains(i)).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
