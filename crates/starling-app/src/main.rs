use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use starling_core::{BoundaryMode, ShockPolarity, Simulation, SimulationConfig, SpawnPattern};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "starling",
    version,
    about = "Headless flocking simulation runner"
)]
struct Cli {
    /// Number of steps to simulate.
    #[arg(long, default_value_t = 600)]
    steps: u64,

    /// Fixed per-step delta time in seconds.
    #[arg(long, default_value_t = 0.016)]
    dt: f32,

    /// JSON configuration file; absent fields fall back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the RNG seed for a reproducible run.
    #[arg(long)]
    seed: Option<u64>,

    /// Override the agent count.
    #[arg(long)]
    count: Option<usize>,

    /// Override the boundary policy.
    #[arg(long, value_enum)]
    boundary: Option<BoundaryArg>,

    /// Override the spawn pattern.
    #[arg(long, value_enum)]
    spawn: Option<SpawnArg>,

    /// Inject a shock at the world center every N steps, alternating
    /// push and pull.
    #[arg(long)]
    shock_interval: Option<u64>,

    /// Log a summary line every N steps; 0 silences periodic logging.
    #[arg(long, default_value_t = 120)]
    log_every: u64,

    /// Write the final agent snapshot to this file as JSON.
    #[arg(long)]
    snapshot_out: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum BoundaryArg {
    Wrap,
    Bounce,
}

impl From<BoundaryArg> for BoundaryMode {
    fn from(arg: BoundaryArg) -> Self {
        match arg {
            BoundaryArg::Wrap => Self::Wrap,
            BoundaryArg::Bounce => Self::Bounce,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum SpawnArg {
    Random,
    Ring,
    Grid,
}

impl From<SpawnArg> for SpawnPattern {
    fn from(arg: SpawnArg) -> Self {
        match arg {
            SpawnArg::Random => Self::Random,
            SpawnArg::Ring => Self::Ring,
            SpawnArg::Grid => Self::Grid,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    let mut simulation = Simulation::new(config)?;
    info!(
        agents = simulation.agent_count(),
        steps = cli.steps,
        dt = cli.dt,
        "Starting starling run"
    );

    run(&mut simulation, &cli);

    if let Some(summary) = simulation.summary() {
        info!(
            tick = summary.tick.0,
            avg_speed = summary.average_speed,
            max_speed = summary.max_speed,
            "Run complete"
        );
    }

    if let Some(path) = &cli.snapshot_out {
        let json = serde_json::to_string_pretty(&simulation.snapshot())
            .context("failed to serialize snapshot")?;
        fs::write(path, json)
            .with_context(|| format!("failed to write snapshot to {}", path.display()))?;
        info!(path = %path.display(), "Wrote final snapshot");
    }

    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_config(cli: &Cli) -> Result<SimulationConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => SimulationConfig::default(),
    };

    if let Some(seed) = cli.seed {
        config.rng_seed = Some(seed);
    }
    if let Some(count) = cli.count {
        config.count = count;
    }
    if let Some(boundary) = cli.boundary {
        config.boundary = boundary.into();
    }
    if let Some(spawn) = cli.spawn {
        config.spawn = spawn.into();
    }
    Ok(config)
}

fn run(simulation: &mut Simulation, cli: &Cli) {
    let center_x = simulation.config().world_width * 0.5;
    let center_y = simulation.config().world_height * 0.5;
    let mut next_polarity = ShockPolarity::Push;

    for step in 0..cli.steps {
        if let Some(interval) = cli.shock_interval
            && interval > 0
            && step % interval == 0
        {
            simulation.inject_shock(center_x, center_y, next_polarity);
            next_polarity = match next_polarity {
                ShockPolarity::Push => ShockPolarity::Pull,
                ShockPolarity::Pull => ShockPolarity::Push,
            };
        }

        let events = simulation.step(cli.dt);
        if events.agents_sanitized > 0 {
            info!(
                tick = events.tick.0,
                reset = events.agents_sanitized,
                "Reset non-finite agents"
            );
        }

        if cli.log_every > 0
            && (step + 1) % cli.log_every == 0
            && let Some(summary) = simulation.summary()
        {
            info!(
                tick = summary.tick.0,
                avg_speed = summary.average_speed,
                max_speed = summary.max_speed,
                shocks = summary.active_shocks,
                "Step summary"
            );
        }
    }
}
