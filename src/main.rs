use std::path::PathBuf;

use clap::Parser;
use forward_contact::{run_forward, AbortHandle, ForwardConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about = "Forward simulation with corrective contact springs")]
struct Cli {
    /// Run description (TOML)
    #[arg(long)]
    config: PathBuf,

    /// Output base directory; each run gets a timestamped subdirectory
    #[arg(long, default_value = "output-forward-contact")]
    output: PathBuf,

    /// Final simulation time in seconds
    #[arg(long)]
    final_time: Option<f64>,

    /// Record per-spring weights and forces
    #[arg(long)]
    detailed: bool,

    /// Keep results in memory only
    #[arg(long)]
    no_write: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let mut cfg = ForwardConfig::from_toml_file(&cli.config)?;
    if let Some(v) = cli.final_time {
        cfg.final_time = v;
    }
    if cli.detailed {
        cfg.detailed_results = true;
    }
    if cli.no_write {
        cfg.write_results = false;
    }

    let summary = run_forward(&cfg, &cli.output, &AbortHandle::new())?;

    println!(
        "Run '{}' complete. Samples: {} | Reached t = {:.4} s",
        cfg.name,
        summary.samples,
        summary.reached_time.unwrap_or(cfg.initial_time)
    );
    for spring in &summary.springs {
        match (spring.peak_weight, spring.peak_applied) {
            (Some(w), Some(f)) => println!(
                "Spring {} on {}: peak weight {:.3} | peak load {:.2}",
                spring.id, spring.body, w, f
            ),
            _ => println!(
                "Spring {} on {}: window {:.3}-{:.3} s",
                spring.id,
                spring.body,
                spring.window.onset_time,
                spring.window.end_time()
            ),
        }
    }
    if let Some(outputs) = &summary.outputs {
        println!("Run directory: {}", outputs.output_dir.display());
        println!("States: {}", outputs.states_path.display());
        for path in &outputs.spring_paths {
            println!("Spring history: {}", path.display());
        }
    }
    if let Some(path) = &summary.summary_path {
        println!("Summary: {}", path.display());
    }

    Ok(())
}
