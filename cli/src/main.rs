//! `kalman-rotation` CLI: run the reference rotation scenario through a
//! chosen smoother algorithm and print the predicted, filtered and smoothed
//! trajectories.
//!
//! The drive sequence is the reference one: predict the whole trajectory
//! from the first observation, roll back to step 1, filter with every
//! observation, then smooth.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use kalman_core::{Algorithm, DMat, DVec, Kalman};
use parscan::{Runtime, RuntimeConfig};
use sim::rotation::{RotationScenario, STEPS};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Debug, ValueEnum)]
enum AlgorithmArg {
    Ultimate,
    Conventional,
    Oddeven,
    Associative,
}

impl From<&AlgorithmArg> for Algorithm {
    fn from(arg: &AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Ultimate => Algorithm::Ultimate,
            AlgorithmArg::Conventional => Algorithm::Conventional,
            AlgorithmArg::Oddeven => Algorithm::OddEven,
            AlgorithmArg::Associative => Algorithm::Associative,
        }
    }
}

#[derive(Parser)]
#[command(name = "kalman-rotation", about = "Rotation scenario smoother driver")]
struct Cli {
    /// Smoother algorithm.
    #[arg(long, value_enum, default_value = "ultimate")]
    algorithm: AlgorithmArg,
    /// Worker-thread limit for the batch engines (-1 = library default).
    #[arg(long, default_value_t = -1)]
    nthreads: i32,
    /// Scan block size for the batch engines (-1 = library default).
    #[arg(long, default_value_t = -1)]
    blocksize: i32,
    /// Write the trajectories to a JSON file.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = RuntimeConfig::default();
    if cli.nthreads > 0 {
        config.nthreads = Some(cli.nthreads as usize);
    }
    if cli.blocksize > 0 {
        config.blocksize = cli.blocksize as usize;
    }
    let runtime = Arc::new(Runtime::new(config));

    let algorithm = Algorithm::from(&cli.algorithm);
    println!(
        "rotation algorithm={:?} nthreads={} blocksize={}",
        algorithm, cli.nthreads, cli.blocksize
    );

    let scenario = RotationScenario::reference();
    print_matrix("F", &scenario.f, 4);
    print_matrix("G", &scenario.g, 4);

    let mut kalman = Kalman::with_runtime(algorithm, runtime);

    // -----------------------------------------------------------------
    // Phase 1: predict every state from the first observation alone.
    // -----------------------------------------------------------------
    let mut predicted = Vec::with_capacity(STEPS);
    kalman.evolve(2, None, None, None, None);
    kalman.observe(
        Some(&scenario.g),
        Some(&scenario.observations[0]),
        Some(&scenario.observation_noise),
    );
    predicted.push(kalman.estimate(0));

    let zero = DVec::zeros(2);
    for i in 1..STEPS {
        kalman.evolve(
            2,
            Some(&scenario.h),
            Some(&scenario.f),
            Some(&zero),
            Some(&scenario.evolution_noise),
        );
        kalman.observe(None, None, None);
        predicted.push(kalman.estimate(i as i64));
    }
    println!(
        "earliest->latest {}->{}",
        kalman.earliest(),
        kalman.latest()
    );

    // -----------------------------------------------------------------
    // Phase 2: roll back to step 1 and filter with every observation.
    // Step 0's observation survives the rollback.
    // -----------------------------------------------------------------
    kalman.rollback(1);
    kalman.observe(
        Some(&scenario.g),
        Some(&scenario.observations[1]),
        Some(&scenario.observation_noise),
    );

    let mut filtered = Vec::with_capacity(STEPS);
    filtered.push(kalman.estimate(0));
    filtered.push(kalman.estimate(1));
    for i in 2..STEPS {
        kalman.evolve(
            2,
            Some(&scenario.h),
            Some(&scenario.f),
            Some(&zero),
            Some(&scenario.evolution_noise),
        );
        kalman.observe(
            Some(&scenario.g),
            Some(&scenario.observations[i]),
            Some(&scenario.observation_noise),
        );
        filtered.push(kalman.estimate(i as i64));
    }

    // -----------------------------------------------------------------
    // Phase 3: smooth.
    // -----------------------------------------------------------------
    kalman.smooth();
    let smoothed: Vec<DVec> = (0..STEPS).map(|i| kalman.estimate(i as i64)).collect();

    let cov0 = kalman.covariance(0);
    println!("covariance of smoothed estimate of state 0 =");
    print_matrix("", &cov0.explicit(), 8);

    print_trajectory("predicted", &predicted);
    print_trajectory("filtered", &filtered);
    print_trajectory("smoothed", &smoothed);

    if let Some(path) = &cli.output {
        let as_rows = |t: &[DVec]| -> Vec<Vec<f64>> {
            t.iter().map(|v| v.iter().copied().collect()).collect()
        };
        let json = serde_json::json!({
            "algorithm": format!("{algorithm:?}"),
            "predicted": as_rows(&predicted),
            "filtered": as_rows(&filtered),
            "smoothed": as_rows(&smoothed),
            "smoothed_covariance_0": as_rows(
                &cov0.explicit().column_iter().map(|c| c.into_owned()).collect::<Vec<_>>()
            ),
        });
        std::fs::write(path, serde_json::to_string_pretty(&json)?)?;
        println!("trajectories saved to {}", path.display());
    }

    println!("rotation done");
    Ok(())
}

/// Print a matrix row-wise, like the reference driver's `matrix_print`.
fn print_matrix(name: &str, m: &DMat, decimals: usize) {
    if !name.is_empty() {
        println!("{name} =");
    }
    for i in 0..m.nrows() {
        let row: Vec<String> = (0..m.ncols())
            .map(|j| format!("{:>12.decimals$}", m[(i, j)]))
            .collect();
        println!("  {}", row.join(" "));
    }
}

/// Print a trajectory as a dim × steps matrix, one state per column.
fn print_trajectory(name: &str, trajectory: &[DVec]) {
    println!("{name} =");
    let dim = trajectory.first().map_or(0, |v| v.len());
    for r in 0..dim {
        let row: Vec<String> = trajectory
            .iter()
            .map(|v| format!("{:>8.4}", v[r]))
            .collect();
        println!("  {}", row.join(" "));
    }
}
