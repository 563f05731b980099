//! # netlab
//!
//! Runs a TOML-described experiment against the synthetic testbed and writes
//! every trace sink plus the final report into an output directory.
//!
//! ```bash
//! # Validate a scenario without running it
//! netlab check scenarios/bulksend-changelink.toml
//!
//! # Run it, second repetition, into ./out
//! netlab run scenarios/bulksend-changelink.toml --out out --run 1
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use netlab_core::config::{ExperimentConfigInput, TimeInput};
use netlab_core::sink::SinkBackend;
use netlab_core::{Experiment, ExperimentConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "netlab", about = "Discrete-event network experiment runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an experiment and write its sinks and report.
    Run {
        /// Experiment description (TOML).
        config: PathBuf,

        /// Directory receiving trace files, report.json and report.txt.
        #[arg(long, default_value = "out")]
        out: PathBuf,

        /// Run index; selects the random stream and the sink suffix.
        #[arg(long)]
        run: Option<u32>,

        /// Override the configured seed.
        #[arg(long)]
        seed: Option<u64>,

        /// Override the stop time (e.g. "12s", "500ms").
        #[arg(long)]
        stop_time: Option<String>,
    },
    /// Parse and validate an experiment without running it.
    Check {
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    match Cli::parse().command {
        Command::Run {
            config,
            out,
            run,
            seed,
            stop_time,
        } => {
            let mut input = load_input(&config)?;
            if let Some(run) = run {
                input.run = run;
            }
            if let Some(seed) = seed {
                input.seed = Some(seed);
            }
            if let Some(stop) = stop_time {
                input.stop_time = Some(TimeInput::Text(stop));
            }
            let cfg = input
                .resolve()
                .with_context(|| format!("invalid experiment {}", config.display()))?;
            run_experiment(cfg, &out)
        }
        Command::Check { config } => {
            let cfg = load(&config)?;
            netlab_testbed::collaborators(&cfg)
                .with_context(|| format!("{}: stack configuration", config.display()))?;
            println!(
                "{}: ok ({} nodes, {} links, {} apps, {} link events, {} plans, {} traces)",
                cfg.name,
                cfg.nodes.len(),
                cfg.links.len(),
                cfg.apps.len(),
                cfg.link_events.len(),
                cfg.plans.len(),
                cfg.traces.len(),
            );
            Ok(())
        }
    }
}

fn load_input(path: &Path) -> anyhow::Result<ExperimentConfigInput> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    ExperimentConfigInput::from_toml_str(&text)
        .with_context(|| format!("invalid experiment {}", path.display()))
}

fn load(path: &Path) -> anyhow::Result<ExperimentConfig> {
    load_input(path)?
        .resolve()
        .with_context(|| format!("invalid experiment {}", path.display()))
}

fn run_experiment(cfg: ExperimentConfig, out: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(out).with_context(|| format!("failed to create {}", out.display()))?;
    let collab = netlab_testbed::collaborators(&cfg).context("failed to build collaborators")?;

    let started = std::time::Instant::now();
    let report = Experiment::new(cfg, collab)
        .with_sinks(SinkBackend::Directory(out.to_path_buf()))
        .run()
        .context("experiment failed")?;
    tracing::info!(
        wall_ms = started.elapsed().as_millis() as u64,
        flows = report.flows.len(),
        sinks = report.sinks.len(),
        "experiment finished"
    );

    let json = report.to_json().context("failed to serialize report")?;
    fs::write(out.join("report.json"), json).context("failed to write report.json")?;
    let text = report.render_text();
    fs::write(out.join("report.txt"), &text).context("failed to write report.txt")?;
    print!("{text}");
    Ok(())
}
