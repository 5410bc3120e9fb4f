//! Core simulation state and step pipeline for the starling workspace.

use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use starling_index::{IndexError, Quadtree, SpatialIndex};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

pub use starling_index::Rect;

/// Distance past the world edge an agent may drift before wrap teleports it
/// to the opposite side.
pub const WRAP_MARGIN: f32 = 5.0;

/// Spread applied around `base_hue` when seeding agent hues.
const HUE_JITTER: f32 = 30.0;

/// High level simulation clock (steps processed since construction).
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

/// Errors surfaced when constructing or reconfiguring a simulation.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Failure propagated from the spatial index.
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Edge policy applied to agents leaving the world rectangle.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryMode {
    /// Teleport to the opposite edge once past the wrap margin.
    #[default]
    Wrap,
    /// Reflect the offending velocity component and clamp into bounds.
    Bounce,
}

/// Initial placement of the population.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpawnPattern {
    /// Uniformly random within the world rectangle.
    #[default]
    Random,
    /// On a circle of radius `min(width, height) / 4` around the center.
    Ring,
    /// Row-major lattice inset one cell pitch from the edges.
    Grid,
}

/// Direction of a radial shock impulse.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShockPolarity {
    /// Drives agents away from the origin.
    Push,
    /// Draws agents toward the origin.
    Pull,
}

impl ShockPolarity {
    /// Sign multiplier applied to the impulse magnitude.
    #[must_use]
    pub const fn signum(self) -> f32 {
        match self {
            Self::Push => 1.0,
            Self::Pull => -1.0,
        }
    }
}

/// Static configuration for a starling simulation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of agents; the population is fixed for the simulation's life.
    pub count: usize,
    /// Width of the world in world units.
    pub world_width: f32,
    /// Height of the world in world units.
    pub world_height: f32,
    /// Neighbor radius feeding alignment and cohesion.
    pub vision: f32,
    /// Inner radius feeding separation; never larger than `vision`.
    pub separation_radius: f32,
    /// Hard cap on velocity magnitude after integration.
    pub max_speed: f32,
    /// Optional floor on the speed of moving agents; 0 disables it.
    pub min_speed: f32,
    /// Cap on each individual steering force before weighting.
    pub max_force: f32,
    /// Weight of the alignment steering term.
    pub align_weight: f32,
    /// Weight of the cohesion steering term.
    pub cohesion_weight: f32,
    /// Weight of the separation steering term.
    pub separation_weight: f32,
    /// Uniform per-axis acceleration jitter; 0 disables it.
    pub noise: f32,
    /// Edge policy for agents leaving the world rectangle.
    pub boundary: BoundaryMode,
    /// Initial placement of the population.
    pub spawn: SpawnPattern,
    /// Leaf capacity of the neighbor quadtree.
    pub quadtree_capacity: usize,
    /// Shock radius at injection time.
    pub shock_base_radius: f32,
    /// Shock radius reached at the end of its life.
    pub shock_max_radius: f32,
    /// Shock lifetime in seconds.
    pub shock_life: f32,
    /// Peak force applied by a shock at its origin.
    pub shock_impulse: f32,
    /// Hue burst applied to agents caught in a shock; 0 keeps shocks
    /// purely physical.
    pub shock_hue_shift: f32,
    /// Center of the hue band agents spawn with.
    pub base_hue: f32,
    /// Upper bound on the per-step delta time, seconds.
    pub max_step_dt: f32,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent step summaries retained in-memory.
    pub history_capacity: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            count: 280,
            world_width: 1920.0,
            world_height: 1080.0,
            vision: 84.0,
            separation_radius: 18.0,
            max_speed: 3.2,
            min_speed: 0.0,
            max_force: 0.06,
            align_weight: 1.0,
            cohesion_weight: 0.76,
            separation_weight: 1.8,
            noise: 0.0,
            boundary: BoundaryMode::Wrap,
            spawn: SpawnPattern::Random,
            quadtree_capacity: 8,
            shock_base_radius: 30.0,
            shock_max_radius: 290.0,
            shock_life: 1.2,
            shock_impulse: 1.8,
            shock_hue_shift: 120.0,
            base_hue: 210.0,
            max_step_dt: 0.032,
            rng_seed: None,
            history_capacity: 256,
        }
    }
}

impl SimulationConfig {
    /// Check every field against its documented range.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.count == 0 {
            return Err(SimulationError::InvalidConfig("count must be positive"));
        }
        if !self.world_width.is_finite()
            || !self.world_height.is_finite()
            || self.world_width <= 0.0
            || self.world_height <= 0.0
        {
            return Err(SimulationError::InvalidConfig(
                "world dimensions must be positive and finite",
            ));
        }
        if !self.vision.is_finite() || self.vision < 0.0 {
            return Err(SimulationError::InvalidConfig(
                "vision must be non-negative",
            ));
        }
        if !self.separation_radius.is_finite() || self.separation_radius < 0.0 {
            return Err(SimulationError::InvalidConfig(
                "separation_radius must be non-negative",
            ));
        }
        if self.separation_radius > self.vision {
            return Err(SimulationError::InvalidConfig(
                "separation_radius cannot exceed vision",
            ));
        }
        if !self.max_speed.is_finite() || self.max_speed <= 0.0 {
            return Err(SimulationError::InvalidConfig("max_speed must be positive"));
        }
        if !self.min_speed.is_finite() || self.min_speed < 0.0 || self.min_speed > self.max_speed {
            return Err(SimulationError::InvalidConfig(
                "min_speed must lie in [0, max_speed]",
            ));
        }
        if !self.max_force.is_finite() || self.max_force <= 0.0 {
            return Err(SimulationError::InvalidConfig("max_force must be positive"));
        }
        if !self.align_weight.is_finite()
            || !self.cohesion_weight.is_finite()
            || !self.separation_weight.is_finite()
            || self.align_weight < 0.0
            || self.cohesion_weight < 0.0
            || self.separation_weight < 0.0
        {
            return Err(SimulationError::InvalidConfig(
                "steering weights must be non-negative",
            ));
        }
        if !self.noise.is_finite() || self.noise < 0.0 {
            return Err(SimulationError::InvalidConfig("noise must be non-negative"));
        }
        if self.quadtree_capacity == 0 {
            return Err(SimulationError::InvalidConfig(
                "quadtree_capacity must be positive",
            ));
        }
        if !self.shock_base_radius.is_finite() || self.shock_base_radius <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "shock_base_radius must be positive",
            ));
        }
        if !self.shock_max_radius.is_finite() || self.shock_max_radius < self.shock_base_radius {
            return Err(SimulationError::InvalidConfig(
                "shock_max_radius cannot fall below shock_base_radius",
            ));
        }
        if !self.shock_life.is_finite() || self.shock_life <= 0.0 {
            return Err(SimulationError::InvalidConfig("shock_life must be positive"));
        }
        if !self.shock_impulse.is_finite() || self.shock_impulse <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "shock_impulse must be positive",
            ));
        }
        if !self.shock_hue_shift.is_finite() || self.shock_hue_shift < 0.0 {
            return Err(SimulationError::InvalidConfig(
                "shock_hue_shift must be non-negative",
            ));
        }
        if !self.base_hue.is_finite() {
            return Err(SimulationError::InvalidConfig("base_hue must be finite"));
        }
        if !self.max_step_dt.is_finite() || self.max_step_dt <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "max_step_dt must be positive",
            ));
        }
        if self.history_capacity == 0 {
            return Err(SimulationError::InvalidConfig(
                "history_capacity must be positive",
            ));
        }
        Ok(())
    }

    /// Returns an RNG for the configured seed, generating one from entropy
    /// if absent.
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

/// Axis-aligned 2D position (SoA column representation).
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

/// Velocity in world units per step.
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

/// Acceleration accumulated within a single step and consumed by
/// integration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Acceleration {
    pub ax: f32,
    pub ay: f32,
}

impl Acceleration {
    /// Construct a new acceleration vector.
    #[must_use]
    pub const fn new(ax: f32, ay: f32) -> Self {
        Self { ax, ay }
    }
}

/// Scalar fields for a single agent used when inserting into the SoA store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentData {
    pub position: Position,
    pub velocity: Velocity,
    pub hue: f32,
}

impl AgentData {
    /// Creates a new agent payload with the provided scalar fields.
    #[must_use]
    pub const fn new(position: Position, velocity: Velocity, hue: f32) -> Self {
        Self {
            position,
            velocity,
            hue,
        }
    }
}

/// Read-only per-agent state handed to rendering collaborators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentSnapshot {
    pub position: Position,
    pub velocity: Velocity,
    pub hue: f32,
    pub speed: f32,
}

/// Collection of per-agent columns for hot-path iteration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentColumns {
    positions: Vec<Position>,
    velocities: Vec<Velocity>,
    accelerations: Vec<Acceleration>,
    hues: Vec<f32>,
    speeds: Vec<f32>,
}

impl AgentColumns {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: Vec::with_capacity(capacity),
            velocities: Vec::with_capacity(capacity),
            accelerations: Vec::with_capacity(capacity),
            hues: Vec::with_capacity(capacity),
            speeds: Vec::with_capacity(capacity),
        }
    }

    /// Number of active rows in the columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true if there are no active rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all rows while retaining capacity.
    pub fn clear(&mut self) {
        self.positions.clear();
        self.velocities.clear();
        self.accelerations.clear();
        self.hues.clear();
        self.speeds.clear();
    }

    /// Push a new row onto each column. The acceleration lane starts zeroed
    /// and the speed lane starts at the velocity's magnitude.
    pub fn push(&mut self, agent: AgentData) {
        let speed = (agent.velocity.vx * agent.velocity.vx
            + agent.velocity.vy * agent.velocity.vy)
            .sqrt();
        self.positions.push(agent.position);
        self.velocities.push(agent.velocity);
        self.accelerations.push(Acceleration::default());
        self.hues.push(agent.hue);
        self.speeds.push(speed);
        self.debug_assert_coherent();
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> AgentData {
        AgentData {
            position: self.positions[index],
            velocity: self.velocities[index],
            hue: self.hues[index],
        }
    }

    /// Immutable access to the positions slice.
    #[must_use]
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// Mutable access to the positions slice.
    #[must_use]
    pub fn positions_mut(&mut self) -> &mut [Position] {
        &mut self.positions
    }

    /// Immutable access to the velocities slice.
    #[must_use]
    pub fn velocities(&self) -> &[Velocity] {
        &self.velocities
    }

    /// Mutable access to the velocities slice.
    #[must_use]
    pub fn velocities_mut(&mut self) -> &mut [Velocity] {
        &mut self.velocities
    }

    /// Immutable access to the acceleration accumulators.
    #[must_use]
    pub fn accelerations(&self) -> &[Acceleration] {
        &self.accelerations
    }

    /// Mutable access to the acceleration accumulators.
    #[must_use]
    pub fn accelerations_mut(&mut self) -> &mut [Acceleration] {
        &mut self.accelerations
    }

    /// Immutable access to agent hues.
    #[must_use]
    pub fn hues(&self) -> &[f32] {
        &self.hues
    }

    /// Mutable access to agent hues.
    #[must_use]
    pub fn hues_mut(&mut self) -> &mut [f32] {
        &mut self.hues
    }

    /// Immutable access to the derived speed column.
    #[must_use]
    pub fn speeds(&self) -> &[f32] {
        &self.speeds
    }

    /// Mutable access to the derived speed column.
    #[must_use]
    pub fn speeds_mut(&mut self) -> &mut [f32] {
        &mut self.speeds
    }

    /// Split access used when applying radial impulses: positions read-only
    /// alongside mutable accelerations and hues.
    #[must_use]
    pub fn impulse_lanes(&mut self) -> (&[Position], &mut [Acceleration], &mut [f32]) {
        (&self.positions, &mut self.accelerations, &mut self.hues)
    }

    /// Split access used by the integration pass: mutable positions,
    /// velocities, and speeds alongside read-only accelerations.
    #[must_use]
    pub fn integration_lanes(
        &mut self,
    ) -> (&mut [Position], &mut [Velocity], &[Acceleration], &mut [f32]) {
        (
            &mut self.positions,
            &mut self.velocities,
            &self.accelerations,
            &mut self.speeds,
        )
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.accelerations.len());
        debug_assert_eq!(self.positions.len(), self.hues.len());
        debug_assert_eq!(self.positions.len(), self.speeds.len());
    }
}

/// A transient radial impulse aging toward expiry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ShockEvent {
    pub origin: Position,
    pub elapsed: f32,
    pub life: f32,
    pub polarity: ShockPolarity,
}

/// Events emitted after processing a simulation step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StepEvents {
    pub tick: Tick,
    pub shocks_expired: usize,
    pub agents_sanitized: usize,
}

/// Per-step aggregate retained in the bounded history.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSummary {
    pub tick: Tick,
    pub agent_count: usize,
    pub active_shocks: usize,
    pub average_speed: f32,
    pub max_speed: f32,
}

/// Owning simulation state advanced one step at a time.
pub struct Simulation {
    config: SimulationConfig,
    tick: Tick,
    rng: SmallRng,
    agents: AgentColumns,
    index: Quadtree,
    pending_shocks: Vec<ShockEvent>,
    active_shocks: Vec<ShockEvent>,
    position_scratch: Vec<(f32, f32)>,
    query_scratch: Vec<u32>,
    history: VecDeque<StepSummary>,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("tick", &self.tick)
            .field("agent_count", &self.agents.len())
            .field("active_shocks", &self.active_shocks.len())
            .field("config", &self.config)
            .finish()
    }
}

fn clamp_magnitude(x: f32, y: f32, max: f32) -> (f32, f32) {
    let m2 = x * x + y * y;
    if m2 > max * max {
        let scale = max / m2.sqrt();
        (x * scale, y * scale)
    } else {
        (x, y)
    }
}

fn clamp_step_dt(dt: f32, max_dt: f32) -> f32 {
    if dt.is_finite() {
        dt.clamp(0.0, max_dt)
    } else {
        0.0
    }
}

fn spawn_position(config: &SimulationConfig, rng: &mut SmallRng, slot: usize) -> Position {
    let width = config.world_width;
    let height = config.world_height;
    match config.spawn {
        SpawnPattern::Random => Position::new(
            rng.random_range(0.0..width),
            rng.random_range(0.0..height),
        ),
        SpawnPattern::Ring => {
            let angle = rng.random_range(0.0..std::f32::consts::TAU);
            let radius = width.min(height) * 0.25;
            Position::new(
                width * 0.5 + angle.cos() * radius,
                height * 0.5 + angle.sin() * radius,
            )
        }
        SpawnPattern::Grid => {
            let cols = ((config.count as f32).sqrt().floor().max(8.0)) as usize;
            let rows = config.count.div_ceil(cols);
            let pitch_x = width / (cols + 1) as f32;
            let pitch_y = height / (rows + 1) as f32;
            let col = slot % cols;
            let row = slot / cols;
            Position::new(pitch_x * (col + 1) as f32, pitch_y * (row + 1) as f32)
        }
    }
}

fn spawn_agents(config: &SimulationConfig, rng: &mut SmallRng) -> AgentColumns {
    let mut columns = AgentColumns::with_capacity(config.count);
    let spawn_speed = config.max_speed * 0.5;
    for slot in 0..config.count {
        let position = spawn_position(config, rng, slot);
        let rx: f32 = rng.random_range(-1.0..1.0);
        let ry: f32 = rng.random_range(-1.0..1.0);
        let magnitude = (rx * rx + ry * ry).sqrt();
        let velocity = if magnitude > 0.0 {
            Velocity::new(rx * spawn_speed / magnitude, ry * spawn_speed / magnitude)
        } else {
            Velocity::default()
        };
        let hue =
            (config.base_hue + rng.random_range(-HUE_JITTER..HUE_JITTER)).rem_euclid(360.0);
        columns.push(AgentData::new(position, velocity, hue));
    }
    columns
}

impl Simulation {
    /// Instantiate a simulation from the supplied configuration.
    pub fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        let mut rng = config.seeded_rng();
        let index = Quadtree::new(config.quadtree_capacity)?;
        let agents = spawn_agents(&config, &mut rng);
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            tick: Tick::zero(),
            rng,
            agents,
            index,
            pending_shocks: Vec::new(),
            active_shocks: Vec::new(),
            position_scratch: Vec::new(),
            query_scratch: Vec::new(),
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Advance the simulation by one step.
    ///
    /// `dt` is wall-clock-derived, clamped to `[0, max_step_dt]`, and only
    /// ages shock events; steering and integration run on a unit timestep.
    pub fn step(&mut self, dt: f32) -> StepEvents {
        let dt = clamp_step_dt(dt, self.config.max_step_dt);
        let next_tick = self.tick.next();

        let index_ready = self.stage_rebuild_index();
        self.stage_reset_accelerations();
        if index_ready {
            self.stage_flocking();
        }
        self.stage_noise();
        let shocks_expired = self.stage_shocks(dt);
        self.stage_integrate();
        let agents_sanitized = self.stage_sanitize();

        self.tick = next_tick;
        self.record_summary();

        StepEvents {
            tick: self.tick,
            shocks_expired,
            agents_sanitized,
        }
    }

    /// Queue a radial impulse at `(x, y)`; it joins the active set at the
    /// shock phase of the next step.
    pub fn inject_shock(&mut self, x: f32, y: f32, polarity: ShockPolarity) {
        self.pending_shocks.push(ShockEvent {
            origin: Position::new(x, y),
            elapsed: 0.0,
            life: self.config.shock_life,
            polarity,
        });
    }

    /// Copy the observable per-agent state for rendering collaborators.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        (0..self.agents.len())
            .map(|i| AgentSnapshot {
                position: self.agents.positions()[i],
                velocity: self.agents.velocities()[i],
                hue: self.agents.hues()[i],
                speed: self.agents.speeds()[i],
            })
            .collect()
    }

    /// Rectangles of the quadtree built by the most recent step, for
    /// diagnostic overlays. Empty before the first step.
    #[must_use]
    pub fn debug_index_rects(&self) -> Vec<Rect> {
        self.index.node_rects().collect()
    }

    /// Update the world bounds consumed by the next index rebuild, pulling
    /// every agent into the new rectangle.
    pub fn resize(&mut self, width: f32, height: f32) -> Result<(), SimulationError> {
        if !width.is_finite() || !height.is_finite() || width <= 0.0 || height <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "world dimensions must be positive and finite",
            ));
        }
        self.config.world_width = width;
        self.config.world_height = height;
        for position in self.agents.positions_mut() {
            position.x = position.x.clamp(0.0, width);
            position.y = position.y.clamp(0.0, height);
        }
        Ok(())
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Mutable access to the configuration (for hot edits). World bounds
    /// changes should go through [`Simulation::resize`] so agent positions
    /// stay inside the index root.
    #[must_use]
    pub fn config_mut(&mut self) -> &mut SimulationConfig {
        &mut self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Number of agents in the fixed population.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Read-only access to the agent columns.
    #[must_use]
    pub fn agents(&self) -> &AgentColumns {
        &self.agents
    }

    /// Mutable access to the agent columns. Values written here must stay
    /// finite; the sanitize pass resets anything that is not.
    #[must_use]
    pub fn agents_mut(&mut self) -> &mut AgentColumns {
        &mut self.agents
    }

    /// Shocks currently applying force, oldest first.
    #[must_use]
    pub fn shocks(&self) -> &[ShockEvent] {
        &self.active_shocks
    }

    /// Number of shocks currently applying force.
    #[must_use]
    pub fn active_shock_count(&self) -> usize {
        self.active_shocks.len()
    }

    /// Iterate over retained step summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StepSummary> {
        self.history.iter()
    }

    /// The most recent step summary, if any step has run.
    #[must_use]
    pub fn summary(&self) -> Option<&StepSummary> {
        self.history.back()
    }

    /// Borrow the simulation RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Root rectangle for the index rebuild. Wrap mode parks agents inside
    /// the margin band, so the root is widened to keep them insertable.
    fn index_root(&self) -> Rect {
        let width = self.config.world_width;
        let height = self.config.world_height;
        match self.config.boundary {
            BoundaryMode::Wrap => Rect::new(
                -WRAP_MARGIN,
                -WRAP_MARGIN,
                width + 2.0 * WRAP_MARGIN,
                height + 2.0 * WRAP_MARGIN,
            ),
            BoundaryMode::Bounce => Rect::new(0.0, 0.0, width, height),
        }
    }

    fn stage_rebuild_index(&mut self) -> bool {
        let root = self.index_root();
        self.position_scratch.clear();
        self.position_scratch
            .extend(self.agents.positions().iter().map(|p| (p.x, p.y)));
        self.index.rebuild(root, &self.position_scratch).is_ok()
    }

    fn stage_reset_accelerations(&mut self) {
        for acceleration in self.agents.accelerations_mut() {
            *acceleration = Acceleration::default();
        }
    }

    fn stage_flocking(&mut self) {
        let count = self.agents.len();
        let vision = self.config.vision;
        let separation_radius = self.config.separation_radius;
        let max_force = self.config.max_force;
        let align_weight = self.config.align_weight;
        let cohesion_weight = self.config.cohesion_weight;
        let separation_weight = self.config.separation_weight;

        let positions = self.agents.positions();
        let velocities = self.agents.velocities();
        let index = &self.index;

        let steering: Vec<Acceleration> = (0..count)
            .into_par_iter()
            .map_init(Vec::new, |scratch: &mut Vec<u32>, i| {
                let origin = positions[i];
                scratch.clear();
                index.candidates_within(origin.x, origin.y, vision, scratch);

                let mut neighbor_count = 0u32;
                let mut close_count = 0u32;
                let mut center_x = 0.0f32;
                let mut center_y = 0.0f32;
                let mut align_x = 0.0f32;
                let mut align_y = 0.0f32;
                let mut repel_x = 0.0f32;
                let mut repel_y = 0.0f32;

                for &candidate in scratch.iter() {
                    let j = candidate as usize;
                    if j == i {
                        continue;
                    }
                    let dx = positions[j].x - origin.x;
                    let dy = positions[j].y - origin.y;
                    let d2 = dx * dx + dy * dy;
                    if d2 == 0.0 {
                        continue;
                    }
                    let d = d2.sqrt();
                    if d < vision {
                        neighbor_count += 1;
                        center_x += positions[j].x;
                        center_y += positions[j].y;
                        align_x += velocities[j].vx;
                        align_y += velocities[j].vy;
                    }
                    if d < separation_radius {
                        close_count += 1;
                        repel_x -= dx / d;
                        repel_y -= dy / d;
                    }
                }

                let mut ax = 0.0f32;
                let mut ay = 0.0f32;
                if neighbor_count > 0 {
                    let total = neighbor_count as f32;
                    let (fx, fy) = clamp_magnitude(
                        align_x / total - velocities[i].vx,
                        align_y / total - velocities[i].vy,
                        max_force,
                    );
                    ax += fx * align_weight;
                    ay += fy * align_weight;
                    let (fx, fy) = clamp_magnitude(
                        center_x / total - origin.x,
                        center_y / total - origin.y,
                        max_force,
                    );
                    ax += fx * cohesion_weight;
                    ay += fy * cohesion_weight;
                }
                if close_count > 0 {
                    let (fx, fy) = clamp_magnitude(repel_x, repel_y, max_force * 1.5);
                    ax += fx * separation_weight;
                    ay += fy * separation_weight;
                }
                Acceleration::new(ax, ay)
            })
            .collect();

        for (acceleration, steer) in self.agents.accelerations_mut().iter_mut().zip(steering) {
            acceleration.ax += steer.ax;
            acceleration.ay += steer.ay;
        }
    }

    fn stage_noise(&mut self) {
        let noise = self.config.noise;
        if noise <= 0.0 {
            return;
        }
        for acceleration in self.agents.accelerations_mut() {
            acceleration.ax += self.rng.random_range(-noise..noise);
            acceleration.ay += self.rng.random_range(-noise..noise);
        }
    }

    fn stage_shocks(&mut self, dt: f32) -> usize {
        if !self.pending_shocks.is_empty() {
            self.active_shocks.append(&mut self.pending_shocks);
        }
        if self.active_shocks.is_empty() {
            return 0;
        }
        let base_radius = self.config.shock_base_radius;
        let radius_span = self.config.shock_max_radius - self.config.shock_base_radius;
        let impulse = self.config.shock_impulse;
        let hue_shift = self.config.shock_hue_shift;

        let mut scratch = std::mem::take(&mut self.query_scratch);
        for slot in 0..self.active_shocks.len() {
            self.active_shocks[slot].elapsed += dt;
            let shock = self.active_shocks[slot];
            let progress = (shock.elapsed / shock.life).min(1.0);
            let radius = base_radius + progress * radius_span;
            let strength = 1.0 - progress;
            let sign = shock.polarity.signum();

            scratch.clear();
            self.index
                .candidates_within(shock.origin.x, shock.origin.y, radius, &mut scratch);
            let (positions, accelerations, hues) = self.agents.impulse_lanes();
            for &candidate in &scratch {
                let i = candidate as usize;
                let dx = positions[i].x - shock.origin.x;
                let dy = positions[i].y - shock.origin.y;
                let mut distance = (dx * dx + dy * dy).sqrt();
                if distance == 0.0 {
                    distance = 1.0;
                }
                let falloff = 1.0 - (distance / radius).min(1.0);
                let force = sign * impulse * strength * falloff;
                accelerations[i].ax += (dx / distance) * force;
                accelerations[i].ay += (dy / distance) * force;
                if hue_shift > 0.0 {
                    hues[i] = (hues[i] + hue_shift * falloff).rem_euclid(360.0);
                }
            }
        }
        scratch.clear();
        self.query_scratch = scratch;

        let before = self.active_shocks.len();
        self.active_shocks.retain(|shock| shock.elapsed < shock.life);
        before - self.active_shocks.len()
    }

    fn stage_integrate(&mut self) {
        let width = self.config.world_width;
        let height = self.config.world_height;
        let max_speed = self.config.max_speed;
        let min_speed = self.config.min_speed;
        let boundary = self.config.boundary;

        let (positions, velocities, accelerations, speeds) = self.agents.integration_lanes();
        for i in 0..positions.len() {
            let (mut vx, mut vy) = clamp_magnitude(
                velocities[i].vx + accelerations[i].ax,
                velocities[i].vy + accelerations[i].ay,
                max_speed,
            );
            if min_speed > 0.0 {
                let speed_sq = vx * vx + vy * vy;
                if speed_sq > 0.0 && speed_sq < min_speed * min_speed {
                    let scale = min_speed / speed_sq.sqrt();
                    vx *= scale;
                    vy *= scale;
                }
            }

            let mut x = positions[i].x + vx;
            let mut y = positions[i].y + vy;
            match boundary {
                BoundaryMode::Wrap => {
                    if x < -WRAP_MARGIN {
                        x = width + WRAP_MARGIN;
                    } else if x > width + WRAP_MARGIN {
                        x = -WRAP_MARGIN;
                    }
                    if y < -WRAP_MARGIN {
                        y = height + WRAP_MARGIN;
                    } else if y > height + WRAP_MARGIN {
                        y = -WRAP_MARGIN;
                    }
                }
                BoundaryMode::Bounce => {
                    if x < 0.0 {
                        x = 0.0;
                        vx = -vx;
                    } else if x > width {
                        x = width;
                        vx = -vx;
                    }
                    if y < 0.0 {
                        y = 0.0;
                        vy = -vy;
                    } else if y > height {
                        y = height;
                        vy = -vy;
                    }
                }
            }

            positions[i] = Position::new(x, y);
            velocities[i] = Velocity::new(vx, vy);
            speeds[i] = (vx * vx + vy * vy).sqrt();
        }
    }

    /// Reset any agent whose position or velocity went non-finite. Runs
    /// after integration so corruption never survives a full step.
    fn stage_sanitize(&mut self) -> usize {
        let center = Position::new(
            self.config.world_width * 0.5,
            self.config.world_height * 0.5,
        );
        let base_hue = self.config.base_hue;
        let mut corrected = 0usize;

        let (positions, velocities, _, speeds) = self.agents.integration_lanes();
        for i in 0..positions.len() {
            let position = positions[i];
            let velocity = velocities[i];
            if position.x.is_finite()
                && position.y.is_finite()
                && velocity.vx.is_finite()
                && velocity.vy.is_finite()
            {
                continue;
            }
            positions[i] = center;
            velocities[i] = Velocity::default();
            speeds[i] = 0.0;
            corrected += 1;
        }
        for hue in self.agents.hues_mut() {
            if !hue.is_finite() {
                *hue = base_hue;
            }
        }
        corrected
    }

    fn record_summary(&mut self) {
        let speeds = self.agents.speeds();
        let agent_count = speeds.len();
        let average_speed = if agent_count == 0 {
            0.0
        } else {
            speeds.iter().sum::<f32>() / agent_count as f32
        };
        let max_speed = speeds
            .iter()
            .copied()
            .map(OrderedFloat)
            .max()
            .map_or(0.0, OrderedFloat::into_inner);
        let summary = StepSummary {
            tick: self.tick,
            agent_count,
            active_shocks: self.active_shocks.len(),
            average_speed,
            max_speed,
        };
        if self.history.len() == self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }
}
