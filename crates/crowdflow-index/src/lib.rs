//! Spatial indexing abstractions for agent neighborhood queries.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Common behaviour exposed by neighborhood indices.
///
/// Implementations answer "which agents are near agent `i`?" without the
/// caller iterating the full roster, so the force law stays decoupled from
/// the lookup strategy.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from agent positions.
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError>;

    /// Visit neighbors of `agent_idx` within the provided squared radius.
    ///
    /// The visitor receives the neighbor's index and the squared distance to
    /// it. The querying agent itself is never visited.
    fn neighbors_within(
        &self,
        agent_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Uniform grid index bucketing agents by position.
///
/// Queries scan only the buckets overlapping the search radius, then filter
/// by exact squared distance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Edge length of each grid cell used for bucketing agents.
    pub cell_size: f32,
    width: f32,
    height: f32,
    cols: usize,
    rows: usize,
    #[serde(skip)]
    buckets: Vec<Vec<usize>>,
    #[serde(skip)]
    positions: Vec<(f32, f32)>,
}

impl UniformGridIndex {
    /// Create a new uniform grid covering `width` x `height` world units.
    #[must_use]
    pub fn new(cell_size: f32, width: f32, height: f32) -> Self {
        let (cols, rows) = Self::bucket_dims(cell_size, width, height);
        Self {
            cell_size,
            width,
            height,
            cols,
            rows,
            buckets: vec![Vec::new(); cols * rows],
            positions: Vec::new(),
        }
    }

    fn bucket_dims(cell_size: f32, width: f32, height: f32) -> (usize, usize) {
        if cell_size <= 0.0 || width <= 0.0 || height <= 0.0 {
            return (1, 1);
        }
        let cols = (width / cell_size).ceil().max(1.0) as usize;
        let rows = (height / cell_size).ceil().max(1.0) as usize;
        (cols, rows)
    }

    /// Bucket coordinates for a position, clamped into range.
    fn bucket_of(&self, x: f32, y: f32) -> (usize, usize) {
        let col = ((x / self.cell_size).floor().max(0.0) as usize).min(self.cols - 1);
        let row = ((y / self.cell_size).floor().max(0.0) as usize).min(self.rows - 1);
        (col, row)
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(50.0, 500.0, 400.0)
    }
}

impl NeighborhoodIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError> {
        if self.cell_size <= 0.0 {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(IndexError::InvalidConfig("extent must be positive"));
        }
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        if self.buckets.len() != self.cols * self.rows {
            self.buckets = vec![Vec::new(); self.cols * self.rows];
        }
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        for (idx, &(x, y)) in positions.iter().enumerate() {
            let (col, row) = self.bucket_of(x, y);
            self.buckets[row * self.cols + col].push(idx);
        }
        Ok(())
    }

    fn neighbors_within(
        &self,
        agent_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        let Some(&(x, y)) = self.positions.get(agent_idx) else {
            return;
        };
        if radius_sq <= 0.0 {
            return;
        }
        let radius = radius_sq.sqrt();
        let (min_col, min_row) = self.bucket_of(x - radius, y - radius);
        let (max_col, max_row) = self.bucket_of(x + radius, y + radius);

        for row in min_row..=max_row {
            for col in min_col..=max_col {
                for &other in &self.buckets[row * self.cols + col] {
                    if other == agent_idx {
                        continue;
                    }
                    let (ox, oy) = self.positions[other];
                    let dx = x - ox;
                    let dy = y - oy;
                    let dist_sq = dx * dx + dy * dy;
                    if dist_sq <= radius_sq {
                        visitor(other, OrderedFloat(dist_sq));
                    }
                }
            }
        }
    }
}
