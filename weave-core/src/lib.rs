//! # weave-core: Graph model and consistency engine for Weave
//!
//! Pure, synchronous algorithms over snapshots of a prompt/response graph.
//! Nothing in this crate performs I/O; callers load a snapshot, ask a
//! question, and commit the answer themselves.
//!
//! ## Modules
//!
//! - [`model`]: `Node`, `Edge`, `GraphSnapshot` and the derived child links
//! - [`consistency`]: cycle detection, topological order, staleness cascade
//! - [`validation`]: advisory structural checks with errors and warnings
//! - [`scope`]: bounded ancestor/descendant traversal, scoring, context selection
//! - [`error`]: typed errors returned by the engines

pub mod consistency;
pub mod error;
pub mod model;
pub mod scope;
pub mod validation;

pub use consistency::{
    cascade_update, cycle_with_edge, detect_cycle, stale_dependents, topological_sort,
    would_create_cycle, CycleReport,
};
pub use error::{CycleError, ValidationError};
pub use model::{
    node_map, now_millis, rebuild_children, Edge, GraphSnapshot, Node, NodeId, NodeMap,
    NodeStatus, Position, META_PINNED, META_ROLE, META_SCORE_EXPLANATION, META_TIER,
};
pub use scope::{
    branch_members, compute_heuristic_score, compute_scope, select_context, ContextCandidate,
    ContextOptions, HeuristicScore, Scope, ScopeDirection, ScopeEntry, ScopeOptions,
};
pub use validation::{
    validate_graph, validate_node, validate_node_connection, IssueKind, ValidationConfig,
    ValidationIssue, ValidationReport, DEFAULT_MAX_OUT_DEGREE,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_pipeline() {
        let snapshot = GraphSnapshot::new(
            vec![
                Node::new("a", "root question"),
                Node::new("b", "follow up").with_parents(["a"]),
                Node::new("c", "deeper").with_parents(["b"]),
            ],
            Vec::new(),
        );
        let edges = snapshot.dependency_edges();

        assert!(!detect_cycle(&snapshot.nodes, &edges).has_cycle);
        assert_eq!(
            topological_sort(&snapshot.nodes, &edges).unwrap(),
            vec!["a", "b", "c"]
        );
        assert!(validate_graph(&snapshot.nodes, &edges, &ValidationConfig::default()).valid);

        let stale = stale_dependents("a", &snapshot.nodes, &edges, 7);
        assert_eq!(stale.len(), 2);
        assert!(stale.iter().all(|n| n.status == NodeStatus::Stale));
    }
}
