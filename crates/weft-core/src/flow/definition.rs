//! Flow document parsing and document-level validation.
//!
//! Converts YAML/JSON documents into the canonical `FlowDefinition` and checks
//! the constraints that do not need the graph (names, policies, loop bindings).
//! Graph-level checks live in the compiler.

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;
use weft_types::error::ErrorCode;
use weft_types::flow::FlowDefinition;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while reading or validating a flow document.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Document-level validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DefinitionError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::SchemaValidationError
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML document into a validated `FlowDefinition`.
pub fn parse_flow_yaml(yaml: &str) -> Result<FlowDefinition, DefinitionError> {
    let def: FlowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON document into a validated `FlowDefinition`.
pub fn parse_flow_json(json: &str) -> Result<FlowDefinition, DefinitionError> {
    let def: FlowDefinition =
        serde_json::from_str(json).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `FlowDefinition` to YAML.
pub fn serialize_flow_yaml(def: &FlowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::ParseError(e.to_string()))
}

/// Load a flow document from disk; `.json` files are parsed as JSON,
/// everything else as YAML.
pub async fn load_flow_file(path: &Path) -> Result<FlowDefinition, DefinitionError> {
    let content = tokio::fs::read_to_string(path).await?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_flow_json(&content),
        _ => parse_flow_yaml(&content),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate document-level constraints.
///
/// Checks:
/// - Flow name is non-empty
/// - Every node has a non-empty id and type
/// - Retry policies allow at least one attempt
/// - `forEach.as` is an identifier and `maxIterations >= 1`
/// - Explicit edge ids are unique
///
/// Duplicate node ids, dangling edges and cycles are reported by the compiler.
pub fn validate_definition(def: &FlowDefinition) -> Result<(), DefinitionError> {
    if def.flow.name.trim().is_empty() {
        return Err(DefinitionError::ValidationError(
            "flow name must not be empty".to_string(),
        ));
    }

    for node in &def.nodes {
        if node.id.trim().is_empty() {
            return Err(DefinitionError::ValidationError(
                "node id must not be empty".to_string(),
            ));
        }
        if node.node_type.trim().is_empty() {
            return Err(DefinitionError::ValidationError(format!(
                "node '{}' has an empty type",
                node.id
            )));
        }
        if let Some(retry) = node.policy.as_ref().and_then(|p| p.retry.as_ref()) {
            if retry.max_attempts < 1 {
                return Err(DefinitionError::ValidationError(format!(
                    "node '{}' retry.maxAttempts must be >= 1",
                    node.id
                )));
            }
        }
    }

    let mut edge_ids = HashSet::new();
    for edge in &def.edges {
        if let Some(id) = &edge.id {
            if !edge_ids.insert(id.as_str()) {
                return Err(DefinitionError::ValidationError(format!(
                    "duplicate edge id: '{id}'"
                )));
            }
        }
        if let Some(for_each) = &edge.for_each {
            if !is_identifier(&for_each.binding) {
                return Err(DefinitionError::ValidationError(format!(
                    "edge '{}' forEach.as '{}' is not a valid identifier",
                    edge.edge_id(),
                    for_each.binding
                )));
            }
            if for_each.items.trim().is_empty() {
                return Err(DefinitionError::ValidationError(format!(
                    "edge '{}' forEach.in must not be empty",
                    edge.edge_id()
                )));
            }
        }
        if edge.max_iterations == Some(0) {
            return Err(DefinitionError::ValidationError(format!(
                "edge '{}' maxIterations must be >= 1",
                edge.edge_id()
            )));
        }
    }

    Ok(())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
