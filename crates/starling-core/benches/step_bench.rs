use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use starling_core::{ShockPolarity, Simulation, SimulationConfig};
use std::time::Duration;

fn bench_simulation_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("sim_step");
    // Allow env overrides so CI and local runs can trade time for stability.
    let samples: usize = std::env::var("STARLING_BENCH_SAMPLES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(30);
    let warm: u64 = std::env::var("STARLING_BENCH_WARMUP_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(2);
    let measure: u64 = std::env::var("STARLING_BENCH_MEASURE_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(8);
    group.sample_size(samples);
    group.warm_up_time(Duration::from_secs(warm));
    group.measurement_time(Duration::from_secs(measure));
    let steps: usize = std::env::var("STARLING_BENCH_STEPS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64);
    let counts: Vec<usize> = std::env::var("STARLING_BENCH_AGENTS")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|t| t.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![500_usize, 2000, 5000]);
    for &count in &counts {
        group.bench_function(format!("steps{steps}_agents{count}"), |b| {
            b.iter_batched(
                || {
                    let config = SimulationConfig {
                        count,
                        // Compact world to stress neighbor density.
                        world_width: 800.0,
                        world_height: 800.0,
                        rng_seed: Some(0xBEEF),
                        history_capacity: 1,
                        ..SimulationConfig::default()
                    };
                    Simulation::new(config).expect("simulation")
                },
                |mut simulation| {
                    for step in 0..steps {
                        if step % 32 == 0 {
                            simulation.inject_shock(400.0, 400.0, ShockPolarity::Push);
                        }
                        simulation.step(0.016);
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_simulation_steps);
criterion_main!(benches);
