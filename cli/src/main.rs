mod tables;

use clap::Parser;
use optimizer::{CapacityTable, Optimizer, PreferenceIndex};
use std::error::Error;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Try to generate an optimal set of user-session assignments.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to the user preferences csv
    user_pref_csv: PathBuf,

    /// Path to the session capacities csv
    session_cap_csv: PathBuf,

    /// Number of randomized trials to run
    #[arg(long, default_value_t = 10)]
    n_iter: u32,

    /// Number of preference columns expected in the preferences csv
    #[arg(long, default_value_t = 5)]
    n_prefs: u32,

    /// Seed for reproducible runs; random when omitted
    #[arg(long)]
    seed: Option<u64>,

    /// Path of the best assignment csv to write
    #[arg(long, default_value = "best_assignments.csv")]
    output: PathBuf,
}

fn main() {
    // Setup formatting and environment for trace
    let fmt_layer = fmt::layer().with_file(true).with_line_number(true).pretty();
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    let cli = Cli::parse();

    if let Err(err) = run(&cli) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let pref_rows = tables::read_preference_rows(&cli.user_pref_csv, cli.n_prefs)?;
    let cap_rows = tables::read_capacity_rows(&cli.session_cap_csv)?;
    info!(
        preference_rows = pref_rows.len(),
        capacity_rows = cap_rows.len(),
        "loaded input tables"
    );

    let index = PreferenceIndex::from_rows(&pref_rows)?;
    let capacity = CapacityTable::from_rows(&cap_rows);

    let optimizer = Optimizer {
        n_iter: cli.n_iter,
        n_prefs: cli.n_prefs,
        seed: cli.seed,
    };
    let best = optimizer.run(&index, &capacity)?;

    // Only written when the whole run succeeded
    tables::write_assignment_rows(&cli.output, &best)?;
    info!(
        score = best.score,
        output = %cli.output.display(),
        "wrote best assignment"
    );

    Ok(())
}
