//! Spatial indexing abstractions for agent neighborhood queries.
//!
//! The simulation discards and rebuilds its index every step (every agent
//! moves every step, so incremental maintenance buys nothing), then queries
//! it heavily until the next rebuild. [`Quadtree`] is shaped around that
//! cycle: nodes live in an arena `Vec` addressed by index and leaf buffers
//! are recycled between rebuilds, so a steady-state rebuild allocates
//! nothing.

use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., zero node capacity).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Axis-aligned rectangle described by its top-left corner and extent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Rect {
    #[must_use]
    pub const fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Containment check, closed on all four edges.
    #[must_use]
    pub fn contains(&self, px: f32, py: f32) -> bool {
        px >= self.x && px <= self.x + self.w && py >= self.y && py <= self.y + self.h
    }

    /// Squared distance from `(px, py)` to the nearest point of the rectangle.
    /// Zero for points inside it.
    #[must_use]
    pub fn distance_sq(&self, px: f32, py: f32) -> f32 {
        let nx = px.clamp(self.x, self.x + self.w);
        let ny = py.clamp(self.y, self.y + self.h);
        let dx = px - nx;
        let dy = py - ny;
        dx * dx + dy * dy
    }
}

/// Common behaviour exposed by rebuildable spatial indices.
pub trait SpatialIndex {
    /// Rebuild internal structures from agent positions, rooted at `bounds`.
    ///
    /// The previous tree is cleared first, so a failed rebuild leaves an
    /// empty index whose queries return nothing.
    fn rebuild(&mut self, bounds: Rect, positions: &[(f32, f32)]) -> Result<(), IndexError>;

    /// Append to `out` the index of every agent whose containing leaf
    /// intersects the circle of `radius` around `(cx, cy)`.
    ///
    /// This is a coarse filter, not an exact-radius oracle: callers must
    /// re-check exact distances against the candidates.
    fn candidates_within(&self, cx: f32, cy: f32, radius: f32, out: &mut Vec<u32>);
}

const ROOT: u32 = 0;

/// Subdivision stops at this depth; a terminal leaf grows past its capacity
/// instead, which keeps clusters of coincident points from recursing
/// without bound.
const MAX_DEPTH: u8 = 16;

const DEFAULT_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy)]
struct LeafPoint {
    index: u32,
    x: f32,
    y: f32,
}

#[derive(Debug)]
struct Node {
    rect: Rect,
    /// Arena index of the NW child; the four children are contiguous in
    /// NW, NE, SW, SE order. `None` while the node is an undivided leaf.
    first_child: Option<NonZeroU32>,
    /// Leaf storage; always empty once the node has subdivided.
    points: Vec<LeafPoint>,
}

/// Region quadtree over agent positions, rebuilt from scratch every step.
///
/// Subdivision splits a full leaf into four equal quadrants and
/// redistributes its cached points; the tie-break compares against the node
/// center, with coordinates below it going to the low child and coordinates
/// at or above it to the high child.
#[derive(Debug)]
pub struct Quadtree {
    capacity: usize,
    nodes: Vec<Node>,
    spare: Vec<Vec<LeafPoint>>,
}

impl Quadtree {
    /// Create a tree whose leaves hold up to `capacity` points before
    /// subdividing.
    pub fn new(capacity: usize) -> Result<Self, IndexError> {
        if capacity == 0 {
            return Err(IndexError::InvalidConfig("node capacity must be positive"));
        }
        Ok(Self {
            capacity,
            nodes: Vec::new(),
            spare: Vec::new(),
        })
    }

    /// Number of nodes in the current tree; zero before the first rebuild.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Rectangles of every live node, for diagnostic overlays.
    pub fn node_rects(&self) -> impl Iterator<Item = Rect> + '_ {
        self.nodes.iter().map(|node| node.rect)
    }

    /// Tear down the current tree, parking every leaf buffer for reuse.
    fn reset(&mut self) {
        for node in self.nodes.drain(..) {
            let mut points = node.points;
            points.clear();
            self.spare.push(points);
        }
    }

    fn take_buffer(&mut self) -> Vec<LeafPoint> {
        self.spare.pop().unwrap_or_default()
    }

    fn insert(&mut self, node_idx: u32, index: u32, x: f32, y: f32, depth: u8) -> bool {
        {
            let node = &self.nodes[node_idx as usize];
            if !node.rect.contains(x, y) {
                return false;
            }
            if node.first_child.is_none()
                && (node.points.len() < self.capacity || depth >= MAX_DEPTH)
            {
                self.nodes[node_idx as usize]
                    .points
                    .push(LeafPoint { index, x, y });
                return true;
            }
        }
        let first = match self.nodes[node_idx as usize].first_child {
            Some(first) => first.get(),
            None => self.subdivide(node_idx, depth),
        };
        let rect = self.nodes[node_idx as usize].rect;
        let quadrant = u32::from(y >= rect.y + rect.h * 0.5) * 2
            + u32::from(x >= rect.x + rect.w * 0.5);
        self.insert(first + quadrant, index, x, y, depth + 1)
    }

    /// Split `node_idx` into four children and redistribute its points into
    /// them. Returns the arena index of the first child.
    fn subdivide(&mut self, node_idx: u32, depth: u8) -> u32 {
        let rect = self.nodes[node_idx as usize].rect;
        let hw = rect.w * 0.5;
        let hh = rect.h * 0.5;
        let first = self.nodes.len() as u32;
        for (col, row) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)] {
            let points = self.take_buffer();
            self.nodes.push(Node {
                rect: Rect::new(rect.x + col * hw, rect.y + row * hh, hw, hh),
                first_child: None,
                points,
            });
        }
        let mut parked = std::mem::take(&mut self.nodes[node_idx as usize].points);
        self.nodes[node_idx as usize].first_child = NonZeroU32::new(first);
        for point in &parked {
            let quadrant =
                u32::from(point.y >= rect.y + hh) * 2 + u32::from(point.x >= rect.x + hw);
            self.insert(first + quadrant, point.index, point.x, point.y, depth + 1);
        }
        parked.clear();
        self.spare.push(parked);
        first
    }

    fn collect(&self, node_idx: u32, cx: f32, cy: f32, radius: f32, out: &mut Vec<u32>) {
        let node = &self.nodes[node_idx as usize];
        if node.rect.distance_sq(cx, cy) > radius * radius {
            return;
        }
        match node.first_child {
            None => out.extend(node.points.iter().map(|point| point.index)),
            Some(first) => {
                let first = first.get();
                for quadrant in 0..4 {
                    self.collect(first + quadrant, cx, cy, radius, out);
                }
            }
        }
    }
}

impl Default for Quadtree {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            nodes: Vec::new(),
            spare: Vec::new(),
        }
    }
}

impl SpatialIndex for Quadtree {
    fn rebuild(&mut self, bounds: Rect, positions: &[(f32, f32)]) -> Result<(), IndexError> {
        self.reset();
        let finite = bounds.x.is_finite() && bounds.y.is_finite();
        if !finite || !(bounds.w > 0.0) || !(bounds.h > 0.0) {
            return Err(IndexError::InvalidConfig(
                "root bounds must be finite with positive extent",
            ));
        }
        let points = self.take_buffer();
        self.nodes.push(Node {
            rect: bounds,
            first_child: None,
            points,
        });
        for (index, &(x, y)) in positions.iter().enumerate() {
            let inserted = self.insert(ROOT, index as u32, x, y, 0);
            debug_assert!(inserted, "position ({x}, {y}) escaped the index bounds");
        }
        Ok(())
    }

    fn candidates_within(&self, cx: f32, cy: f32, radius: f32, out: &mut Vec<u32>) {
        if self.nodes.is_empty() {
            return;
        }
        self.collect(ROOT, cx, cy, radius.max(0.0), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::SmallRng};

    fn scattered(seed: u64, count: usize, extent: f32) -> Vec<(f32, f32)> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                (
                    rng.random_range(0.0..extent),
                    rng.random_range(0.0..extent),
                )
            })
            .collect()
    }

    fn built(positions: &[(f32, f32)], capacity: usize, extent: f32) -> Quadtree {
        let mut tree = Quadtree::new(capacity).unwrap();
        tree.rebuild(Rect::new(0.0, 0.0, extent, extent), positions)
            .unwrap();
        tree
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            Quadtree::new(0),
            Err(IndexError::InvalidConfig(_))
        ));
    }

    #[test]
    fn degenerate_bounds_are_rejected() {
        let mut tree = Quadtree::new(4).unwrap();
        let result = tree.rebuild(Rect::new(0.0, 0.0, 0.0, 100.0), &[]);
        assert!(matches!(result, Err(IndexError::InvalidConfig(_))));
        let mut out = Vec::new();
        tree.candidates_within(10.0, 10.0, 50.0, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn zero_radius_query_round_trips_every_point() {
        let positions = scattered(7, 300, 512.0);
        let tree = built(&positions, 8, 512.0);
        let mut out = Vec::new();
        for (index, &(x, y)) in positions.iter().enumerate() {
            out.clear();
            tree.candidates_within(x, y, 0.0, &mut out);
            assert!(
                out.contains(&(index as u32)),
                "point {index} missing from its own leaf"
            );
        }
    }

    #[test]
    fn candidates_are_a_superset_of_exact_neighbors() {
        let positions = scattered(21, 250, 400.0);
        let tree = built(&positions, 6, 400.0);
        let (cx, cy, radius) = (200.0, 200.0, 60.0);
        let mut out = Vec::new();
        tree.candidates_within(cx, cy, radius, &mut out);
        for (index, &(x, y)) in positions.iter().enumerate() {
            let d2 = (x - cx) * (x - cx) + (y - cy) * (y - cy);
            if d2 <= radius * radius {
                assert!(out.contains(&(index as u32)));
            }
        }
    }

    #[test]
    fn far_queries_are_pruned_to_nothing() {
        let positions: Vec<(f32, f32)> = scattered(3, 64, 100.0);
        let mut tree = Quadtree::new(4).unwrap();
        tree.rebuild(Rect::new(0.0, 0.0, 1000.0, 1000.0), &positions)
            .unwrap();
        let mut out = Vec::new();
        tree.candidates_within(950.0, 950.0, 25.0, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn leaves_respect_capacity_and_divided_nodes_hold_nothing() {
        let positions = scattered(11, 500, 256.0);
        let tree = built(&positions, 5, 256.0);
        for node in &tree.nodes {
            if node.first_child.is_some() {
                assert!(node.points.is_empty());
            } else {
                assert!(node.points.len() <= 5);
            }
        }
    }

    #[test]
    fn coincident_points_stop_subdividing_at_the_depth_bound() {
        let positions: Vec<(f32, f32)> = (0..40).map(|_| (33.3, 77.7)).collect();
        let tree = built(&positions, 4, 128.0);
        let mut out = Vec::new();
        tree.candidates_within(33.3, 77.7, 0.0, &mut out);
        assert_eq!(out.len(), 40);
    }

    #[test]
    fn boundary_points_insert_on_every_edge() {
        let extent = 200.0;
        let positions = [
            (0.0, 0.0),
            (extent, 0.0),
            (0.0, extent),
            (extent, extent),
            (extent * 0.5, extent),
        ];
        let tree = built(&positions, 2, extent);
        let mut out = Vec::new();
        for (index, &(x, y)) in positions.iter().enumerate() {
            out.clear();
            tree.candidates_within(x, y, 0.0, &mut out);
            assert!(out.contains(&(index as u32)));
        }
    }

    #[test]
    fn rebuild_reuses_node_arena_without_stale_points() {
        let first = scattered(5, 200, 300.0);
        let mut tree = Quadtree::new(8).unwrap();
        tree.rebuild(Rect::new(0.0, 0.0, 300.0, 300.0), &first)
            .unwrap();
        let populated_nodes = tree.node_count();
        assert!(populated_nodes > 1);

        tree.rebuild(Rect::new(0.0, 0.0, 300.0, 300.0), &[(150.0, 150.0)])
            .unwrap();
        assert_eq!(tree.node_count(), 1);
        let mut out = Vec::new();
        tree.candidates_within(150.0, 150.0, 300.0, &mut out);
        assert_eq!(out, vec![0]);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "escaped the index bounds")]
    fn out_of_bounds_insert_is_fatal_in_debug() {
        let mut tree = Quadtree::new(4).unwrap();
        tree.rebuild(Rect::new(0.0, 0.0, 100.0, 100.0), &[(250.0, 50.0)])
            .unwrap();
    }
}
