//! Placement of a single new node on an already laid out canvas.

use weave_core::Position;

use crate::spatial::{Aabb, SpatialHash};

pub const NODE_WIDTH: f64 = 280.0;
pub const NODE_HEIGHT: f64 = 160.0;
pub const NODE_SPACING_X: f64 = 320.0;
pub const NODE_SPACING_Y: f64 = 220.0;

/// Spiral steps tried before falling back to the right of everything.
pub const MAX_PLACEMENT_ATTEMPTS: usize = 64;

/// Bounding box of a node whose top-left corner sits at `position`.
pub fn node_box(position: Position) -> Aabb {
    Aabb::from_rect(position.x, position.y, NODE_WIDTH, NODE_HEIGHT)
}

/// Preferred cell for a new node.
///
/// One row below the mean of its parents and right of the rightmost sibling.
/// Without parents the node starts at the origin row.
pub fn calculate_node_position(parents: &[Position], siblings: &[Position]) -> Position {
    let (mut x, y) = if parents.is_empty() {
        (0.0, 0.0)
    } else {
        let n = parents.len() as f64;
        let mean_x = parents.iter().map(|p| p.x).sum::<f64>() / n;
        let mean_y = parents.iter().map(|p| p.y).sum::<f64>() / n;
        (mean_x, mean_y + NODE_SPACING_Y)
    };

    if let Some(rightmost) = siblings.iter().map(|p| p.x).reduce(f64::max) {
        x = x.max(rightmost + NODE_SPACING_X);
    }
    Position::new(x, y)
}

/// Nudge `target` until its box clears every occupied box.
///
/// Walks an outward spiral (right, down, left, up with legs growing every
/// second turn) in grid steps. After [`MAX_PLACEMENT_ATTEMPTS`] steps the
/// node is put one column right of all occupied boxes on the target row.
pub fn find_non_colliding_position(target: Position, occupied: &[Position]) -> Position {
    let mut grid = SpatialHash::new(NODE_SPACING_X);
    for (i, position) in occupied.iter().enumerate() {
        grid.insert(i.to_string(), node_box(*position));
    }

    if !grid.collides(&node_box(target)) {
        return target;
    }

    const DIRECTIONS: [(f64, f64); 4] = [(1.0, 0.0), (0.0, 1.0), (-1.0, 0.0), (0.0, -1.0)];
    let mut candidate = target;
    let mut leg = 1;
    let mut attempts = 0;

    'spiral: for turn in 0.. {
        let (dx, dy) = DIRECTIONS[turn % 4];
        for _ in 0..leg {
            if attempts == MAX_PLACEMENT_ATTEMPTS {
                break 'spiral;
            }
            attempts += 1;
            candidate.x += dx * NODE_SPACING_X;
            candidate.y += dy * NODE_SPACING_Y;
            if !grid.collides(&node_box(candidate)) {
                log::trace!("placement found free cell after {attempts} step(s)");
                return candidate;
            }
        }
        if turn % 2 == 1 {
            leg += 1;
        }
    }

    let right_edge = grid.max_x().unwrap_or(target.x);
    log::debug!("placement spiral exhausted; placing right of x={right_edge}");
    Position::new(right_edge + (NODE_SPACING_X - NODE_WIDTH), target.y)
}
