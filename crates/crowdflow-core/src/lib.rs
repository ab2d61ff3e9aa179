//! Core types for the CrowdFlow evacuation simulation: occupancy grid,
//! navigation field, static proximity fields, and the social-force
//! stepping engine.

use crowdflow_index::{NeighborhoodIndex, UniformGridIndex};
use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

new_key_type! {
    /// Stable handle for agents backed by a generational slot map.
    pub struct AgentId;
}

/// 8-connected neighbor offsets `(dr, dc)` in the fixed enumeration order
/// used by the navigation-field search. FIFO discovery over this order is
/// the tie-break between equal-length paths.
const NEIGHBOR_OFFSETS: [(i8, i8); 8] = [
    (0, 1),
    (0, -1),
    (1, 0),
    (-1, 0),
    (1, 1),
    (1, -1),
    (-1, 1),
    (-1, -1),
];

/// Unit directions pointing away from the left, top, right, and bottom
/// walls, matching the order of [`ProximityField::wall_distances`].
const WALL_DIRECTIONS: [[f32; 2]; 4] = [[1.0, 0.0], [0.0, 1.0], [-1.0, 0.0], [0.0, -1.0]];

/// High level simulation clock (ticks processed since initialization).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Continuous 2D world position; `x` grows with columns, `y` with rows.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// World-space velocity vector.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    pub vx: f32,
    pub vy: f32,
}

impl Velocity {
    /// Construct a new velocity vector.
    #[must_use]
    pub const fn new(vx: f32, vy: f32) -> Self {
        Self { vx, vy }
    }
}

/// Discrete grid coordinate (row-major).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GridCell {
    pub row: usize,
    pub col: usize,
}

impl GridCell {
    #[must_use]
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

/// Classification of one occupancy-grid cell.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum CellKind {
    #[default]
    Empty,
    Obstacle,
    Exit,
}

/// Axis-aligned rectangular obstacle in world units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Obstacle {
    pub origin: Position,
    pub width: f32,
    pub height: f32,
}

impl Obstacle {
    /// Construct an obstacle from its top-left corner and extent.
    #[must_use]
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            origin: Position::new(x, y),
            width,
            height,
        }
    }

    /// The four corner points, clockwise from the origin.
    #[must_use]
    pub fn corners(&self) -> [Position; 4] {
        let Position { x, y } = self.origin;
        [
            Position::new(x, y),
            Position::new(x + self.width, y),
            Position::new(x + self.width, y + self.height),
            Position::new(x, y + self.height),
        ]
    }

    /// Geometric center of the rectangle.
    #[must_use]
    pub fn centroid(&self) -> Position {
        Position::new(
            self.origin.x + self.width * 0.5,
            self.origin.y + self.height * 0.5,
        )
    }

    /// Closest point on the rectangle to `point` (axis-wise clamp).
    #[must_use]
    pub fn nearest_point(&self, point: Position) -> Position {
        Position::new(
            point.x.clamp(self.origin.x, self.origin.x + self.width),
            point.y.clamp(self.origin.y, self.origin.y + self.height),
        )
    }
}

/// Errors raised during simulation initialization.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimulationError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Free-cell sampling exhausted its attempt budget before every agent
    /// was placed.
    #[error("placed {placed} of {requested} agents before exhausting {attempts} attempts")]
    AgentPlacement {
        requested: usize,
        placed: usize,
        attempts: u32,
    },
    /// The navigation field could not connect every walkable cell to the
    /// exit segment.
    #[error("exit unreachable from {unreached} walkable cells")]
    UnreachableExit { unreached: usize },
}

/// Static configuration for a CrowdFlow simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrowdConfig {
    /// Width of the world in world units.
    pub world_width: u32,
    /// Height of the world in world units.
    pub world_height: u32,
    /// Edge length of one grid cell in world units (must evenly divide
    /// width/height).
    pub cell_size: u32,
    /// First grid row (inclusive) of the exit segment on the rightmost
    /// column.
    pub exit_row_start: usize,
    /// One past the last grid row of the exit segment.
    pub exit_row_end: usize,
    /// Number of agents placed at initialization.
    pub agent_count: usize,
    /// Body radius of each agent in world units.
    pub agent_radius: f32,
    /// Mass of each agent.
    pub agent_mass: f32,
    /// Preferred walking speed driving each agent toward the exit.
    pub desired_speed: f32,
    /// Fixed integration time step.
    pub dt: f32,
    /// Repulsion strength `A` shared by agent, wall, and obstacle forces.
    pub repulsion_strength: f32,
    /// Repulsion decay `B`; must be negative, smaller magnitude means
    /// steeper falloff.
    pub repulsion_decay: f32,
    /// Cutoff radius for agent-agent interactions.
    pub interaction_radius: f32,
    /// Minimum distance substituted into the force law to bound magnitudes.
    pub distance_floor: f32,
    /// Total free-cell sampling attempts allowed during agent placement.
    pub placement_max_attempts: u32,
    /// Optional RNG seed for reproducible placements.
    pub rng_seed: Option<u64>,
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self {
            world_width: 500,
            world_height: 400,
            cell_size: 10,
            exit_row_start: 14,
            exit_row_end: 25,
            agent_count: 40,
            agent_radius: 5.0,
            agent_mass: 1.0,
            desired_speed: 40.0,
            dt: 0.05,
            repulsion_strength: 60.0,
            repulsion_decay: -3.0,
            interaction_radius: 30.0,
            distance_floor: 0.1,
            placement_max_attempts: 10_000,
            rng_seed: None,
        }
    }
}

impl CrowdConfig {
    /// Validates the configuration, returning derived grid dimensions
    /// `(rows, cols)`.
    fn grid_dimensions(&self) -> Result<(usize, usize), SimulationError> {
        if self.world_width == 0 || self.world_height == 0 {
            return Err(SimulationError::InvalidConfig(
                "world dimensions must be non-zero",
            ));
        }
        if self.cell_size == 0 {
            return Err(SimulationError::InvalidConfig("cell_size must be non-zero"));
        }
        if !self.world_width.is_multiple_of(self.cell_size)
            || !self.world_height.is_multiple_of(self.cell_size)
        {
            return Err(SimulationError::InvalidConfig(
                "world dimensions must be divisible by cell_size",
            ));
        }
        let rows = (self.world_height / self.cell_size) as usize;
        let cols = (self.world_width / self.cell_size) as usize;
        if self.exit_row_start >= self.exit_row_end {
            return Err(SimulationError::InvalidConfig(
                "exit row span must be non-empty",
            ));
        }
        if self.exit_row_end > rows {
            return Err(SimulationError::InvalidConfig(
                "exit row span exceeds grid rows",
            ));
        }
        if self.agent_count == 0 {
            return Err(SimulationError::InvalidConfig(
                "agent_count must be non-zero",
            ));
        }
        if self.agent_radius <= 0.0
            || self.agent_mass <= 0.0
            || self.desired_speed <= 0.0
            || self.dt <= 0.0
        {
            return Err(SimulationError::InvalidConfig(
                "agent radius, mass, desired speed, and dt must be positive",
            ));
        }
        if self.repulsion_strength <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "repulsion_strength must be positive",
            ));
        }
        if self.repulsion_decay >= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "repulsion_decay must be negative",
            ));
        }
        if self.interaction_radius <= 0.0 || self.distance_floor <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "interaction_radius and distance_floor must be positive",
            ));
        }
        if self.placement_max_attempts == 0 {
            return Err(SimulationError::InvalidConfig(
                "placement_max_attempts must be non-zero",
            ));
        }
        Ok((rows, cols))
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Discretized world map classifying each cell as empty, obstacle, or exit.
///
/// Built once at initialization and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupancyGrid {
    rows: usize,
    cols: usize,
    cell_size: f32,
    cells: Vec<CellKind>,
}

impl OccupancyGrid {
    /// Rasterize the obstacle list and mark the exit segment.
    pub fn build(config: &CrowdConfig, obstacles: &[Obstacle]) -> Result<Self, SimulationError> {
        let (rows, cols) = config.grid_dimensions()?;
        let cell_size = config.cell_size as f32;
        let mut cells = vec![CellKind::Empty; rows * cols];

        for row in config.exit_row_start..config.exit_row_end {
            cells[row * cols + (cols - 1)] = CellKind::Exit;
        }

        let world_w = config.world_width as f32;
        let world_h = config.world_height as f32;
        for obstacle in obstacles {
            if obstacle.width <= 0.0 || obstacle.height <= 0.0 {
                return Err(SimulationError::InvalidConfig(
                    "obstacle extent must be positive",
                ));
            }
            if obstacle.origin.x < 0.0
                || obstacle.origin.y < 0.0
                || obstacle.origin.x + obstacle.width > world_w
                || obstacle.origin.y + obstacle.height > world_h
            {
                return Err(SimulationError::InvalidConfig(
                    "obstacle extends outside the world",
                ));
            }
            let col_start = (obstacle.origin.x / cell_size).floor() as usize;
            let col_end = (((obstacle.origin.x + obstacle.width) / cell_size).ceil() as usize)
                .min(cols);
            let row_start = (obstacle.origin.y / cell_size).floor() as usize;
            let row_end = (((obstacle.origin.y + obstacle.height) / cell_size).ceil() as usize)
                .min(rows);
            for row in row_start..row_end {
                for col in col_start..col_end {
                    let idx = row * cols + col;
                    if cells[idx] == CellKind::Exit {
                        return Err(SimulationError::InvalidConfig(
                            "obstacle overlaps the exit segment",
                        ));
                    }
                    cells[idx] = CellKind::Obstacle;
                }
            }
        }

        Ok(Self {
            rows,
            cols,
            cell_size,
            cells,
        })
    }

    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub const fn cols(&self) -> usize {
        self.cols
    }

    #[must_use]
    pub const fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Raw row-major cell classifications.
    #[must_use]
    pub fn cells(&self) -> &[CellKind] {
        &self.cells
    }

    /// Returns the flat index for a cell without bounds checks.
    #[inline]
    #[must_use]
    pub const fn cell_index(&self, cell: GridCell) -> usize {
        cell.row * self.cols + cell.col
    }

    /// Classification of a specific cell, `None` when out of range.
    #[must_use]
    pub fn kind_at(&self, cell: GridCell) -> Option<CellKind> {
        if cell.row < self.rows && cell.col < self.cols {
            Some(self.cells[self.cell_index(cell)])
        } else {
            None
        }
    }

    /// Whether agents may occupy the cell (in range and not an obstacle).
    #[must_use]
    pub fn is_walkable(&self, cell: GridCell) -> bool {
        matches!(self.kind_at(cell), Some(CellKind::Empty | CellKind::Exit))
    }

    /// World-space center of a cell.
    #[must_use]
    pub fn cell_center(&self, cell: GridCell) -> Position {
        Position::new(
            (cell.col as f32 + 0.5) * self.cell_size,
            (cell.row as f32 + 0.5) * self.cell_size,
        )
    }

    /// Grid cell containing a world position, clamped into range.
    #[must_use]
    pub fn cell_at(&self, position: Position) -> GridCell {
        self.clamped_cell_of(position.x, position.y).0
    }

    /// Cell for raw world coordinates plus whether clamping was required.
    #[must_use]
    pub fn clamped_cell_of(&self, x: f32, y: f32) -> (GridCell, bool) {
        let raw_col = (x / self.cell_size).floor() as isize;
        let raw_row = (y / self.cell_size).floor() as isize;
        let col = raw_col.clamp(0, self.cols as isize - 1);
        let row = raw_row.clamp(0, self.rows as isize - 1);
        (
            GridCell::new(row as usize, col as usize),
            col != raw_col || row != raw_row,
        )
    }

    /// Number of non-obstacle cells.
    #[must_use]
    pub fn walkable_count(&self) -> usize {
        self.cells
            .iter()
            .filter(|kind| **kind != CellKind::Obstacle)
            .count()
    }
}

/// Integer unit step toward the next cell on a shortest path to the exit.
///
/// The zero vector marks exit cells themselves (and obstacle cells, where
/// the field is meaningless).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepVector {
    pub dr: i8,
    pub dc: i8,
}

impl StepVector {
    pub const ZERO: Self = Self { dr: 0, dc: 0 };

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.dr == 0 && self.dc == 0
    }
}

/// Per-cell unit step vectors toward the exit along shortest 8-connected
/// grid paths. Built once per session, read-only during stepping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationField {
    rows: usize,
    cols: usize,
    steps: Vec<StepVector>,
}

impl NavigationField {
    /// Reverse multi-source BFS seeded from every exit cell at once.
    ///
    /// A single wavefront expands over the whole grid; each newly visited
    /// cell stores the unit step back toward the cell that discovered it.
    /// Fails when any walkable cell is left unreached.
    pub fn build(grid: &OccupancyGrid) -> Result<Self, SimulationError> {
        let rows = grid.rows();
        let cols = grid.cols();
        let mut steps = vec![StepVector::ZERO; rows * cols];
        let mut visited = vec![false; rows * cols];
        let mut queue = VecDeque::new();

        for (idx, kind) in grid.cells().iter().enumerate() {
            if *kind == CellKind::Exit {
                visited[idx] = true;
                queue.push_back(idx);
            }
        }

        while let Some(idx) = queue.pop_front() {
            let row = (idx / cols) as isize;
            let col = (idx % cols) as isize;
            for (dr, dc) in NEIGHBOR_OFFSETS {
                let nr = row + dr as isize;
                let nc = col + dc as isize;
                if nr < 0 || nc < 0 || nr >= rows as isize || nc >= cols as isize {
                    continue;
                }
                let nidx = nr as usize * cols + nc as usize;
                if visited[nidx] || grid.cells()[nidx] == CellKind::Obstacle {
                    continue;
                }
                visited[nidx] = true;
                steps[nidx] = StepVector { dr: -dr, dc: -dc };
                queue.push_back(nidx);
            }
        }

        let unreached = grid
            .cells()
            .iter()
            .zip(&visited)
            .filter(|(kind, seen)| **kind != CellKind::Obstacle && !**seen)
            .count();
        if unreached > 0 {
            return Err(SimulationError::UnreachableExit { unreached });
        }

        Ok(Self { rows, cols, steps })
    }

    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// Raw row-major step vectors, for external visualization.
    #[must_use]
    pub fn steps(&self) -> &[StepVector] {
        &self.steps
    }

    /// Step vector at a cell, `None` when out of range.
    #[must_use]
    pub fn step_at(&self, cell: GridCell) -> Option<StepVector> {
        if cell.row < self.rows && cell.col < self.cols {
            Some(self.steps[cell.row * self.cols + cell.col])
        } else {
            None
        }
    }

    /// Normalized world-space direction `[x, y]` of the step at a cell.
    ///
    /// Diagonal steps are scaled by 1/sqrt(2) so the drive magnitude stays
    /// constant; zero steps (exit cells, out of range) yield `[0, 0]`.
    #[must_use]
    pub fn direction_at(&self, cell: GridCell) -> [f32; 2] {
        let Some(step) = self.step_at(cell) else {
            return [0.0, 0.0];
        };
        if step.is_zero() {
            return [0.0, 0.0];
        }
        let dx = step.dc as f32;
        let dy = step.dr as f32;
        let inv_norm = 1.0 / (dx * dx + dy * dy).sqrt();
        [dx * inv_norm, dy * inv_norm]
    }
}

/// Distance and unit direction from one obstacle to one cell center.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ObstacleProximity {
    pub distance: f32,
    pub direction: [f32; 2],
}

/// Precomputed per-cell distances and directions to the four walls and to
/// each obstacle. Built once per session, read-only during stepping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProximityField {
    obstacle_count: usize,
    wall_distances: Vec<[f32; 4]>,
    obstacle_terms: Vec<ObstacleProximity>,
}

impl ProximityField {
    /// Compute wall distances analytically and obstacle distances via the
    /// clamped point-to-rectangle projection, flooring every distance at
    /// `distance_floor`.
    #[must_use]
    pub fn build(grid: &OccupancyGrid, obstacles: &[Obstacle], distance_floor: f32) -> Self {
        let rows = grid.rows();
        let cols = grid.cols();
        let world_w = cols as f32 * grid.cell_size();
        let world_h = rows as f32 * grid.cell_size();

        let mut wall_distances = Vec::with_capacity(rows * cols);
        let mut obstacle_terms = Vec::with_capacity(rows * cols * obstacles.len());

        for row in 0..rows {
            for col in 0..cols {
                let center = grid.cell_center(GridCell::new(row, col));
                wall_distances.push([
                    center.x.max(distance_floor),
                    center.y.max(distance_floor),
                    (world_w - center.x).max(distance_floor),
                    (world_h - center.y).max(distance_floor),
                ]);
                for obstacle in obstacles {
                    obstacle_terms.push(Self::obstacle_term(obstacle, center, distance_floor));
                }
            }
        }

        Self {
            obstacle_count: obstacles.len(),
            wall_distances,
            obstacle_terms,
        }
    }

    fn obstacle_term(
        obstacle: &Obstacle,
        center: Position,
        distance_floor: f32,
    ) -> ObstacleProximity {
        let nearest = obstacle.nearest_point(center);
        let dx = center.x - nearest.x;
        let dy = center.y - nearest.y;
        let raw = (dx * dx + dy * dy).sqrt();
        let direction = if raw > 0.0 {
            [dx / raw, dy / raw]
        } else {
            // Cell center inside the rectangle; push outward from the centroid.
            let centroid = obstacle.centroid();
            let cx = center.x - centroid.x;
            let cy = center.y - centroid.y;
            let norm = (cx * cx + cy * cy).sqrt();
            if norm > 0.0 {
                [cx / norm, cy / norm]
            } else {
                [0.0, 0.0]
            }
        };
        ObstacleProximity {
            distance: raw.max(distance_floor),
            direction,
        }
    }

    /// Distances to the left, top, right, and bottom walls for a flat cell
    /// index, in the order of [`WALL_DIRECTIONS`].
    #[must_use]
    pub fn wall_distances(&self, cell_index: usize) -> &[f32; 4] {
        &self.wall_distances[cell_index]
    }

    /// Per-obstacle proximity terms for a flat cell index.
    #[must_use]
    pub fn obstacle_terms(&self, cell_index: usize) -> &[ObstacleProximity] {
        let start = cell_index * self.obstacle_count;
        &self.obstacle_terms[start..start + self.obstacle_count]
    }
}

/// Mutable per-agent state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentData {
    pub position: Position,
    pub velocity: Velocity,
    pub cell: GridCell,
    pub radius: f32,
    pub mass: f32,
    pub desired_speed: f32,
    pub exited: bool,
}

/// Per-agent entry of a [`StepReport`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentSummary {
    pub id: AgentId,
    pub position: Position,
    pub exited: bool,
}

/// State reported to the session layer after each tick (and by
/// [`Simulation::snapshot`] without advancing time).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepReport {
    pub tick: Tick,
    pub running: bool,
    pub agents: Vec<AgentSummary>,
}

/// New state computed for one agent during the snapshot phase of a tick.
#[derive(Debug, Clone, Copy)]
struct AgentUpdate {
    position: Position,
    velocity: Velocity,
    cell: GridCell,
    exited: bool,
}

/// Exponential short-range repulsion magnitude shared by the agent, wall,
/// and obstacle force terms: `strength * exp((distance - separation) / decay)`
/// with `strength > 0` and `decay < 0`.
fn repulsion(strength: f32, decay: f32, distance: f32, separation: f32) -> f32 {
    strength * ((distance - separation) / decay).exp()
}

fn place_agents(
    config: &CrowdConfig,
    grid: &OccupancyGrid,
    rng: &mut SmallRng,
) -> Result<SlotMap<AgentId, AgentData>, SimulationError> {
    let mut roster = SlotMap::with_key();
    let mut occupied = vec![false; grid.rows() * grid.cols()];
    let mut attempts: u32 = 0;

    for placed in 0..config.agent_count {
        loop {
            if attempts >= config.placement_max_attempts {
                return Err(SimulationError::AgentPlacement {
                    requested: config.agent_count,
                    placed,
                    attempts,
                });
            }
            attempts += 1;
            let cell = GridCell::new(
                rng.random_range(0..grid.rows()),
                rng.random_range(0..grid.cols()),
            );
            let idx = grid.cell_index(cell);
            if occupied[idx] || grid.kind_at(cell) != Some(CellKind::Empty) {
                continue;
            }
            occupied[idx] = true;
            roster.insert(AgentData {
                position: grid.cell_center(cell),
                velocity: Velocity::default(),
                cell,
                radius: config.agent_radius,
                mass: config.agent_mass,
                desired_speed: config.desired_speed,
                exited: false,
            });
            break;
        }
    }

    Ok(roster)
}

/// A single evacuation session: owns the grid, fields, obstacle list, and
/// agent roster, and advances them tick by tick.
///
/// Each session is an independent single-owner object; callers serialize
/// their own `step` invocations.
pub struct Simulation {
    config: CrowdConfig,
    tick: Tick,
    running: bool,
    rng: SmallRng,
    grid: OccupancyGrid,
    obstacles: Vec<Obstacle>,
    nav: NavigationField,
    proximity: ProximityField,
    agents: SlotMap<AgentId, AgentData>,
    index: UniformGridIndex,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("tick", &self.tick)
            .field("running", &self.running)
            .field("agent_count", &self.agents.len())
            .field("obstacle_count", &self.obstacles.len())
            .finish()
    }
}

impl Simulation {
    /// Build all static fields and place agents, consuming the obstacle
    /// list for the session lifetime.
    pub fn new(config: CrowdConfig, obstacles: Vec<Obstacle>) -> Result<Self, SimulationError> {
        let grid = OccupancyGrid::build(&config, &obstacles)?;
        let nav = NavigationField::build(&grid)?;
        let proximity = ProximityField::build(&grid, &obstacles, config.distance_floor);
        debug!(
            rows = grid.rows(),
            cols = grid.cols(),
            obstacle_count = obstacles.len(),
            "navigation and proximity fields built"
        );

        let mut rng = config.seeded_rng();
        let agents = place_agents(&config, &grid, &mut rng)?;
        debug!(agent_count = agents.len(), "agents placed");

        let index = UniformGridIndex::new(
            config.interaction_radius,
            config.world_width as f32,
            config.world_height as f32,
        );

        Ok(Self {
            config,
            tick: Tick::zero(),
            running: true,
            rng,
            grid,
            obstacles,
            nav,
            proximity,
            agents,
            index,
        })
    }

    /// Advance every active agent by one tick and report the new state.
    ///
    /// Forces for tick `t` read a consistent snapshot of tick `t-1`:
    /// phase one computes every agent's update from immutable snapshot
    /// vectors, phase two commits them to the roster at once. Calling
    /// `step` on a completed simulation is a no-op returning the terminal
    /// report.
    pub fn step(&mut self) -> StepReport {
        if !self.running {
            return self.report();
        }

        let handles: Vec<AgentId> = self.agents.keys().collect();
        let views: Vec<AgentData> = self.agents.values().copied().collect();
        let positions: Vec<(f32, f32)> = views
            .iter()
            .map(|agent| (agent.position.x, agent.position.y))
            .collect();
        let _ = self.index.rebuild(&positions);

        let config = &self.config;
        let grid = &self.grid;
        let nav = &self.nav;
        let proximity = &self.proximity;
        let index = &self.index;
        let cutoff_sq = config.interaction_radius * config.interaction_radius;
        let dt = config.dt;

        let updates: Vec<Option<AgentUpdate>> = (0..views.len())
            .into_par_iter()
            .map(|idx| {
                let agent = views[idx];
                if agent.exited {
                    return None;
                }

                let mut fx = 0.0_f32;
                let mut fy = 0.0_f32;

                let [dir_x, dir_y] = nav.direction_at(agent.cell);
                fx += agent.desired_speed * dir_x;
                fy += agent.desired_speed * dir_y;

                index.neighbors_within(
                    idx,
                    cutoff_sq,
                    &mut |other_idx: usize, dist_sq: OrderedFloat<f32>| {
                        let other = views[other_idx];
                        if other.exited {
                            return;
                        }
                        let raw = dist_sq.into_inner().sqrt();
                        if raw <= 0.0 {
                            // Coincident centers carry no direction.
                            return;
                        }
                        let distance = raw.max(config.distance_floor);
                        let magnitude = repulsion(
                            config.repulsion_strength,
                            config.repulsion_decay,
                            distance,
                            agent.radius + other.radius,
                        );
                        fx += (agent.position.x - other.position.x) / raw * magnitude;
                        fy += (agent.position.y - other.position.y) / raw * magnitude;
                    },
                );

                let cell_index = grid.cell_index(agent.cell);
                let walls = proximity.wall_distances(cell_index);
                for (wall, distance) in walls.iter().enumerate() {
                    let magnitude = repulsion(
                        config.repulsion_strength,
                        config.repulsion_decay,
                        *distance,
                        agent.radius,
                    );
                    fx += WALL_DIRECTIONS[wall][0] * magnitude;
                    fy += WALL_DIRECTIONS[wall][1] * magnitude;
                }
                for term in proximity.obstacle_terms(cell_index) {
                    let magnitude = repulsion(
                        config.repulsion_strength,
                        config.repulsion_decay,
                        term.distance,
                        agent.radius,
                    );
                    fx += term.direction[0] * magnitude;
                    fy += term.direction[1] * magnitude;
                }

                let vx = agent.velocity.vx + fx / agent.mass * dt;
                let vy = agent.velocity.vy + fy / agent.mass * dt;
                let x = agent.position.x + vx * dt;
                let y = agent.position.y + vy * dt;

                let (cell, clamped) = grid.clamped_cell_of(x, y);
                let position = if clamped {
                    grid.cell_center(cell)
                } else {
                    Position::new(x, y)
                };
                let exited = grid.kind_at(cell) == Some(CellKind::Exit);

                Some(AgentUpdate {
                    position,
                    velocity: Velocity::new(vx, vy),
                    cell,
                    exited,
                })
            })
            .collect();

        for (handle, update) in handles.iter().zip(&updates) {
            if let (Some(agent), Some(update)) = (self.agents.get_mut(*handle), update) {
                agent.position = update.position;
                agent.velocity = update.velocity;
                agent.cell = update.cell;
                agent.exited = update.exited;
            }
        }

        self.tick = self.tick.next();
        if self.agents.values().all(|agent| agent.exited) {
            self.running = false;
            info!(tick = self.tick.0, "all agents exited, simulation completed");
        }

        self.report()
    }

    /// Current state in the same shape as [`Simulation::step`], without
    /// advancing time.
    #[must_use]
    pub fn snapshot(&self) -> StepReport {
        self.report()
    }

    fn report(&self) -> StepReport {
        StepReport {
            tick: self.tick,
            running: self.running,
            agents: self
                .agents
                .iter()
                .map(|(id, agent)| AgentSummary {
                    id,
                    position: agent.position,
                    exited: agent.exited,
                })
                .collect(),
        }
    }

    /// Read-only navigation field, for external visualization.
    #[must_use]
    pub fn navigation_field(&self) -> &NavigationField {
        &self.nav
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &CrowdConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Whether any agent has yet to reach the exit.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// The occupancy grid backing the session.
    #[must_use]
    pub fn grid(&self) -> &OccupancyGrid {
        &self.grid
    }

    /// Obstacles owned by the session.
    #[must_use]
    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    /// Number of agents in the roster (exited agents included).
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Read-only access to the agent roster.
    #[must_use]
    pub fn agents(&self) -> &SlotMap<AgentId, AgentData> {
        &self.agents
    }

    /// Mutable access to the agent roster, for tooling and tests.
    ///
    /// Callers repositioning an agent must keep `cell` consistent with
    /// `position` (see [`OccupancyGrid::cell_at`]).
    #[must_use]
    pub fn agents_mut(&mut self) -> &mut SlotMap<AgentId, AgentData> {
        &mut self.agents
    }

    /// Borrow the session RNG mutably for deterministic external sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }
}
