use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::NodeId;
use crate::validation::ValidationReport;

/// A mutation or ordering request hit a dependency cycle.
///
/// `cycle` is closed: its first and last entries are the same node.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("cycle detected: {}", .cycle.join(" -> "))]
pub struct CycleError {
    pub cycle: Vec<NodeId>,
}

impl CycleError {
    pub fn new(cycle: Vec<NodeId>) -> Self {
        Self { cycle }
    }
}

/// Structural problems found by one of the validators.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("validation failed: {}", .report.summary())]
pub struct ValidationError {
    pub report: ValidationReport,
}
