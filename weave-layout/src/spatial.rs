//! Spatial hash grid for node collision tests.
//!
//! Divides the canvas into uniform cells. Each node box occupies every cell
//! its bounding box touches, so an overlap query only inspects the cells the
//! query box covers.

use rustc_hash::FxHashMap;

/// Axis-aligned bounding box stored as min/max corners.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Aabb {
    /// Create from top-left origin and size.
    #[inline]
    pub fn from_rect(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x + width,
            max_y: y + height,
        }
    }

    /// Strict overlap: boxes that only share an edge do not overlap.
    #[inline]
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min_x < other.max_x
            && self.max_x > other.min_x
            && self.min_y < other.max_y
            && self.max_y > other.min_y
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct CellKey(i64, i64);

/// Grid-based spatial hash keyed by node ID.
#[derive(Clone, Debug)]
pub struct SpatialHash {
    inv_cell_size: f64,
    grid: FxHashMap<CellKey, Vec<String>>,
    bounds: FxHashMap<String, Aabb>,
}

impl SpatialHash {
    /// Non-positive or non-finite sizes fall back to the column spacing.
    pub fn new(cell_size: f64) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            crate::placement::NODE_SPACING_X
        };
        Self {
            inv_cell_size: 1.0 / cell_size,
            grid: FxHashMap::default(),
            bounds: FxHashMap::default(),
        }
    }

    #[inline]
    fn to_cell(&self, x: f64, y: f64) -> CellKey {
        CellKey(
            (x * self.inv_cell_size).floor() as i64,
            (y * self.inv_cell_size).floor() as i64,
        )
    }

    #[inline]
    fn cell_range(&self, aabb: &Aabb) -> (CellKey, CellKey) {
        (
            self.to_cell(aabb.min_x, aabb.min_y),
            self.to_cell(aabb.max_x, aabb.max_y),
        )
    }

    /// Insert or move a box.
    pub fn insert(&mut self, id: impl Into<String>, aabb: Aabb) {
        let id = id.into();
        if self.bounds.contains_key(&id) {
            self.remove(&id);
        }

        let (min, max) = self.cell_range(&aabb);
        for cx in min.0..=max.0 {
            for cy in min.1..=max.1 {
                self.grid.entry(CellKey(cx, cy)).or_default().push(id.clone());
            }
        }
        self.bounds.insert(id, aabb);
    }

    /// No-op if the id is unknown.
    fn remove(&mut self, id: &str) {
        let Some(aabb) = self.bounds.remove(id) else {
            return;
        };
        let (min, max) = self.cell_range(&aabb);
        for cx in min.0..=max.0 {
            for cy in min.1..=max.1 {
                let key = CellKey(cx, cy);
                if let Some(ids) = self.grid.get_mut(&key) {
                    if let Some(pos) = ids.iter().position(|x| x == id) {
                        ids.swap_remove(pos);
                    }
                    if ids.is_empty() {
                        self.grid.remove(&key);
                    }
                }
            }
        }
    }

    /// Whether any stored box overlaps `region`.
    pub fn collides(&self, region: &Aabb) -> bool {
        let (min, max) = self.cell_range(region);
        for cx in min.0..=max.0 {
            for cy in min.1..=max.1 {
                let Some(ids) = self.grid.get(&CellKey(cx, cy)) else {
                    continue;
                };
                if ids
                    .iter()
                    .filter_map(|id| self.bounds.get(id))
                    .any(|b| b.overlaps(region))
                {
                    return true;
                }
            }
        }
        false
    }

    /// Right edge of the right-most stored box.
    pub fn max_x(&self) -> Option<f64> {
        self.bounds.values().map(|b| b.max_x).reduce(f64::max)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }
}
