//! Advisory structural validation for nodes, edges and whole graphs.
//!
//! Validators never mutate; callers decide whether errors block a write and
//! whether warnings are surfaced.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::consistency::would_create_cycle;
use crate::error::ValidationError;
use crate::model::{Edge, Node, NodeMap, NodeStatus};

/// Default upper bound on a node's outgoing edges before a warning.
pub const DEFAULT_MAX_OUT_DEGREE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationConfig {
    pub max_out_degree: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_out_degree: DEFAULT_MAX_OUT_DEGREE,
        }
    }
}

/// What a validation issue is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    EmptyPrompt,
    SelfParent,
    MissingParent,
    DuplicateParent,
    MissingNode,
    DanglingEdge,
    SelfLoop,
    DuplicateEdge,
    WouldCreateCycle,
    OutDegreeExceeded,
    IsolatedNode,
    StatusMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
}

impl ValidationIssue {
    fn node(kind: IssueKind, node_id: &str, message: String) -> Self {
        Self {
            kind,
            message,
            node_id: Some(node_id.to_string()),
            edge_id: None,
        }
    }

    fn edge(kind: IssueKind, edge: &Edge, message: String) -> Self {
        Self {
            kind,
            message,
            node_id: None,
            edge_id: Some(edge.id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    fn error(&mut self, issue: ValidationIssue) {
        self.errors.push(issue);
        self.valid = false;
    }

    fn warn(&mut self, issue: ValidationIssue) {
        self.warnings.push(issue);
    }

    fn merge(&mut self, other: ValidationReport) {
        self.valid &= other.valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn has_error(&self, kind: IssueKind) -> bool {
        self.errors.iter().any(|i| i.kind == kind)
    }

    pub fn has_warning(&self, kind: IssueKind) -> bool {
        self.warnings.iter().any(|i| i.kind == kind)
    }

    /// One-line description of the errors (or "ok").
    pub fn summary(&self) -> String {
        if self.errors.is_empty() {
            return "ok".to_string();
        }
        self.errors
            .iter()
            .map(|i| i.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// `Err` when the report carries any error.
    pub fn into_result(self) -> Result<ValidationReport, ValidationError> {
        if self.valid {
            Ok(self)
        } else {
            Err(ValidationError { report: self })
        }
    }
}

/// Checks that only need the node itself.
pub fn validate_node(node: &Node) -> ValidationReport {
    let mut report = ValidationReport::new();

    if node.prompt.trim().is_empty() {
        report.error(ValidationIssue::node(
            IssueKind::EmptyPrompt,
            &node.id,
            format!("node {} has an empty prompt", node.id),
        ));
    }

    let mut seen = HashSet::new();
    for parent in &node.parent_ids {
        if parent == &node.id {
            report.error(ValidationIssue::node(
                IssueKind::SelfParent,
                &node.id,
                format!("node {} lists itself as a parent", node.id),
            ));
        } else if !seen.insert(parent.as_str()) {
            report.warn(ValidationIssue::node(
                IssueKind::DuplicateParent,
                &node.id,
                format!("node {} lists parent {parent} more than once", node.id),
            ));
        }
    }

    match node.status {
        NodeStatus::Loading if node.has_response() => {
            report.warn(ValidationIssue::node(
                IssueKind::StatusMismatch,
                &node.id,
                format!("node {} is loading but already has a response", node.id),
            ));
        }
        NodeStatus::Error if node.has_response() => {
            report.warn(ValidationIssue::node(
                IssueKind::StatusMismatch,
                &node.id,
                format!("node {} is in error but carries a response", node.id),
            ));
        }
        _ => {}
    }

    report
}

/// Whole-graph structural checks.
pub fn validate_graph(nodes: &NodeMap, edges: &[Edge], config: &ValidationConfig) -> ValidationReport {
    let mut report = ValidationReport::new();

    for node in nodes.values() {
        report.merge(validate_node(node));
        for parent in &node.parent_ids {
            if parent != &node.id && !nodes.contains_key(parent) {
                report.error(ValidationIssue::node(
                    IssueKind::MissingParent,
                    &node.id,
                    format!("node {} references missing parent {parent}", node.id),
                ));
            }
        }
    }

    let mut seen_pairs: HashSet<(&str, &str)> = HashSet::new();
    let mut out_degree: HashMap<&str, usize> = HashMap::new();
    let mut touched: HashSet<&str> = HashSet::new();

    for edge in edges {
        for (end, id) in [("source", &edge.source), ("target", &edge.target)] {
            if !nodes.contains_key(id) {
                report.error(ValidationIssue::edge(
                    IssueKind::DanglingEdge,
                    edge,
                    format!("edge {} has unknown {end} {id}", edge.id),
                ));
            }
        }
        if edge.is_self_loop() {
            report.warn(ValidationIssue::edge(
                IssueKind::SelfLoop,
                edge,
                format!("edge {} loops on {}", edge.id, edge.source),
            ));
        }
        if !seen_pairs.insert((edge.source.as_str(), edge.target.as_str())) {
            report.warn(ValidationIssue::edge(
                IssueKind::DuplicateEdge,
                edge,
                format!("edge {} duplicates {} -> {}", edge.id, edge.source, edge.target),
            ));
        }
        *out_degree.entry(edge.source.as_str()).or_default() += 1;
        touched.insert(edge.source.as_str());
        touched.insert(edge.target.as_str());
    }

    for (id, degree) in &out_degree {
        if *degree > config.max_out_degree && nodes.contains_key(*id) {
            report.warn(ValidationIssue::node(
                IssueKind::OutDegreeExceeded,
                id,
                format!(
                    "node {id} has {degree} outgoing edges (max {})",
                    config.max_out_degree
                ),
            ));
        }
    }

    if nodes.len() > 1 {
        for node in nodes.values() {
            let linked = touched.contains(node.id.as_str())
                || !node.parent_ids.is_empty()
                || !node.children_ids.is_empty();
            if !linked {
                report.warn(ValidationIssue::node(
                    IssueKind::IsolatedNode,
                    &node.id,
                    format!("node {} has no connections", node.id),
                ));
            }
        }
    }

    report
}

/// Checks for a proposed `source → target` edge before it is written.
pub fn validate_node_connection(
    source: &str,
    target: &str,
    nodes: &NodeMap,
    edges: &[Edge],
    config: &ValidationConfig,
) -> ValidationReport {
    let mut report = ValidationReport::new();

    for id in [source, target] {
        if !nodes.contains_key(id) {
            report.error(ValidationIssue::node(
                IssueKind::MissingNode,
                id,
                format!("node {id} does not exist"),
            ));
        }
    }

    if source == target {
        report.error(ValidationIssue::node(
            IssueKind::SelfLoop,
            source,
            format!("node {source} cannot depend on itself"),
        ));
        return report;
    }

    if edges.iter().any(|e| e.connects(source, target)) {
        report.error(ValidationIssue::node(
            IssueKind::DuplicateEdge,
            source,
            format!("edge {source} -> {target} already exists"),
        ));
    } else if would_create_cycle(source, target, edges) {
        report.error(ValidationIssue::node(
            IssueKind::WouldCreateCycle,
            source,
            format!("edge {source} -> {target} would create a cycle"),
        ));
    }

    let degree = edges.iter().filter(|e| e.source == source).count() + 1;
    if degree > config.max_out_degree {
        report.warn(ValidationIssue::node(
            IssueKind::OutDegreeExceeded,
            source,
            format!(
                "node {source} would have {degree} outgoing edges (max {})",
                config.max_out_degree
            ),
        ));
    }

    report
}
