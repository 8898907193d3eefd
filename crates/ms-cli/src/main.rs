//! massscales CLI

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ms_core::BiasCoefficient;
use ms_inference::{IterationController, RunStore, Stage2Artifact, generate_dimuons};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "massscales")]
#[command(about = "Muon momentum-scale calibration from dimuon mass fits")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured stage range (aggregate, jacobian, fit)
    Run {
        /// Run configuration (YAML, or JSON by extension)
        #[arg(short, long)]
        config: PathBuf,

        /// Override the first stage (0-2)
        #[arg(long)]
        first_stage: Option<u8>,

        /// Override the last stage (0-2)
        #[arg(long)]
        last_stage: Option<u8>,

        /// Override the store root directory
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Override the run identifier
        #[arg(long)]
        run: Option<String>,

        /// Threads (0 = auto)
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Summarise a stage 2 artifact
    Summary {
        /// Path to stage2.json
        #[arg(short, long)]
        input: PathBuf,

        /// Output file (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate toy dimuon events for the binning of a configuration
    Generate {
        /// Run configuration providing the binning
        #[arg(short, long)]
        config: PathBuf,

        /// Number of events
        #[arg(long, default_value = "100000")]
        n_events: usize,

        /// Generator seed
        #[arg(long, default_value = "17")]
        seed: u64,

        /// Output file (JSON array)
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Print version
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Run { config, first_stage, last_stage, out_dir, run, threads } => {
            cmd_run(&config, first_stage, last_stage, out_dir, run, threads)
        }
        Commands::Summary { input, output } => cmd_summary(&input, output.as_ref()),
        Commands::Generate { config, n_events, seed, output } => {
            cmd_generate(&config, n_events, seed, &output)
        }
        Commands::Version => {
            println!("massscales {}", ms_core::VERSION);
            Ok(())
        }
    }
}

fn cmd_run(
    path: &PathBuf,
    first_stage: Option<u8>,
    last_stage: Option<u8>,
    out_dir: Option<PathBuf>,
    run: Option<String>,
    threads: Option<usize>,
) -> Result<()> {
    let (mut cfg, digest) = config::read_run_config(path)?;
    if let Some(s) = first_stage {
        cfg.pipeline.first_stage = s;
    }
    if let Some(s) = last_stage {
        cfg.pipeline.last_stage = s;
    }
    if let Some(dir) = out_dir {
        cfg.out_dir = dir;
    }
    if let Some(r) = run {
        cfg.pipeline.run = r;
    }
    let threads = threads.unwrap_or(cfg.threads);
    if threads > 0 {
        // Best-effort; if a global pool already exists, keep going.
        let _ = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global();
    }

    let binner = cfg.pipeline.binner()?;
    let feed = config::build_feed(&cfg.sample, &cfg.pipeline, &binner)?;
    let store = RunStore::new(&cfg.out_dir);
    let controller = IterationController::new(cfg.pipeline, store)?.with_config_sha256(digest);
    tracing::info!(
        tag = %controller.config().tag,
        run = %controller.config().run,
        first_stage = controller.config().first_stage,
        last_stage = controller.config().last_stage,
        "run started"
    );
    let report = controller.run(feed.as_ref())?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_summary(input: &PathBuf, output: Option<&PathBuf>) -> Result<()> {
    let bytes = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let art: Stage2Artifact = serde_json::from_slice(&bytes)?;

    let fitted: Vec<_> = art.rows.iter().filter(|r| r.mask).collect();
    let (mut sw, mut swx) = (0.0, 0.0);
    for r in &fitted {
        if r.beta_error > 0.0 {
            let w = 1.0 / (r.beta_error * r.beta_error);
            sw += w;
            swx += w * r.beta;
        }
    }
    let mean_beta = if sw > 0.0 { Some(swx / sw) } else { None };
    let chi2: f64 = fitted.iter().map(|r| r.chi2_after).sum();
    let ndof: i64 = fitted.iter().map(|r| r.ndof).sum();

    let fitted_bias: serde_json::Map<String, serde_json::Value> = BiasCoefficient::ALL
        .iter()
        .map(|&c| (c.as_str().to_string(), serde_json::json!(art.fitted.get(c))))
        .collect();

    let value = serde_json::json!({
        "tag": art.header.tag,
        "run": art.header.run,
        "n_bins": art.header.binning.n_bins,
        "n_rows": art.rows.len(),
        "n_fitted": art.summary.n_fitted(),
        "mean_beta": mean_beta,
        "chi2": chi2,
        "ndof": ndof,
        "fitted": fitted_bias,
        "cumulative": art.snapshot.cumulative,
    });
    write_json(output, value)
}

fn cmd_generate(config: &PathBuf, n_events: usize, seed: u64, output: &PathBuf) -> Result<()> {
    let (cfg, _) = config::read_run_config(config)?;
    let binner = cfg.pipeline.binner()?;
    let events = generate_dimuons(&binner, n_events, seed)?;
    tracing::info!(n = events.len(), path = %output.display(), "writing events");
    std::fs::write(output, serde_json::to_vec(&events)?)?;
    Ok(())
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
