//! # weave-layout: Canvas placement for Weave graphs
//!
//! - [`auto`]: whole-graph layout by depth rows and branch columns
//! - [`placement`]: position for one new node, nudged clear of collisions
//! - [`spatial`]: spatial hash grid backing the collision tests

pub mod auto;
pub mod placement;
pub mod spatial;

pub use auto::{apply_layout, auto_layout, LayoutPosition};
pub use placement::{
    calculate_node_position, find_non_colliding_position, node_box, MAX_PLACEMENT_ATTEMPTS,
    NODE_HEIGHT, NODE_SPACING_X, NODE_SPACING_Y, NODE_WIDTH,
};
pub use spatial::{Aabb, SpatialHash};
