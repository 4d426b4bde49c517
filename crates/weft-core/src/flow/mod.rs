//! Flow engine: definition parsing, compilation and execution.
//!
//! - `definition` -- YAML/JSON parsing and document-level validation
//! - `compiler` -- graph checks, cycle detection, execution order
//! - `binding` -- `{{ path }}` template resolution against run context
//! - `condition` -- JEXL and structured `when` evaluation
//! - `executor` -- single-node execution with retries and timeouts
//! - `state` -- mutable run state and edge gating
//! - `scheduler` -- the run loop that drives nodes to completion
//! - `runtime` -- `FlowRuntime`, the public entry point
//! - `dependency` -- standalone task dependency ordering

pub mod binding;
pub mod compiler;
pub mod condition;
pub mod definition;
pub mod dependency;
pub mod executor;
pub mod runtime;
mod scheduler;
pub mod state;

pub use binding::BindingContext;
pub use compiler::{compile, CompileError, CompiledFlow};
pub use definition::{load_flow_file, parse_flow_json, parse_flow_yaml, DefinitionError};
pub use dependency::{resolve_dependencies, DependencyResolution, TaskSpec};
pub use executor::run_node;
pub use runtime::{FlowExecutor, FlowRuntime, FlowRuntimeBuilder, RuntimeError};
