//! Task dependency resolution.
//!
//! Orders a flat list of tasks by their declared dependencies with the same
//! algorithms the flow compiler uses. Failures are reported in the result
//! rather than as an error so callers can show every problem at once.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::compiler::{find_cycle, topological_order};

/// A task and the ids it depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub deps: Vec<String>,
}

impl TaskSpec {
    pub fn new<I, S>(id: impl Into<String>, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            deps: deps.into_iter().map(Into::into).collect(),
        }
    }
}

/// Outcome of [`resolve_dependencies`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyResolution {
    pub success: bool,
    /// Task ids, dependencies first. Empty unless `success`.
    pub order: Vec<String>,
    /// One dependency cycle, first id repeated at the end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<Vec<String>>,
    /// `(task, dep)` pairs whose dep is not a known task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<(String, String)>,
}

/// Topologically sort `tasks`; ties keep declaration order.
pub fn resolve_dependencies(tasks: &[TaskSpec]) -> DependencyResolution {
    let index_of: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    let mut missing = Vec::new();
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    for (i, task) in tasks.iter().enumerate() {
        for dep in &task.deps {
            match index_of.get(dep.as_str()) {
                Some(&d) => adjacency[d].push(i),
                None => missing.push((task.id.clone(), dep.clone())),
            }
        }
    }

    let name = |i: usize| tasks[i].id.clone();
    if let Some(cycle) = find_cycle(&adjacency) {
        return DependencyResolution {
            success: false,
            order: Vec::new(),
            cycle: Some(cycle.into_iter().map(name).collect()),
            missing,
        };
    }

    match topological_order(&adjacency) {
        Ok(order) if missing.is_empty() => DependencyResolution {
            success: true,
            order: order.into_iter().map(name).collect(),
            cycle: None,
            missing,
        },
        Ok(_) => DependencyResolution {
            success: false,
            missing,
            ..Default::default()
        },
        Err(remaining) => DependencyResolution {
            success: false,
            order: Vec::new(),
            cycle: Some(remaining.into_iter().map(name).collect()),
            missing,
        },
    }
}
