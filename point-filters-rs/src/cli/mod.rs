//! Command-line interface for point filter pipelines.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::core::buffer::{PointBuffer, PointBufferSet};
use crate::core::loaders::load_points_csv;
use crate::core::stats::{median_absolute_deviation, NORMAL_CONSISTENCY};
use crate::core::writers::write_points_csv;
use crate::pipeline::Pipeline;
use crate::PipelineConfig;

#[derive(Parser)]
#[command(name = "point-filters")]
#[command(about = "Point cloud filter pipeline", version)]
pub struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a YAML pipeline over a CSV point file
    Run {
        /// Pipeline YAML file
        pipeline: PathBuf,
        /// Input CSV file (header row names the dimensions)
        input: PathBuf,
        /// Output CSV file
        output: PathBuf,
        /// Stream points through the stages one at a time
        #[arg(long)]
        stream: bool,
    },

    /// Print per-dimension statistics of a CSV point file
    Info {
        /// Input CSV file
        input: PathBuf,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            format!("{}...", value.chars().take(36).collect::<String>())
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    let result = match cli.command {
        Commands::Run {
            pipeline,
            input,
            output,
            stream,
        } => cmd_run(&pipeline, &input, &output, stream),
        Commands::Info { input } => cmd_info(&input),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn cmd_run(pipeline_path: &Path, input: &Path, output: &Path, stream_flag: bool) -> Result<()> {
    let start = Instant::now();

    let config = PipelineConfig::from_yaml(pipeline_path).map_err(|e| {
        anyhow::anyhow!("Failed to load pipeline {}: {}", pipeline_path.display(), e)
    })?;
    info!("Loaded pipeline from: {}", pipeline_path.display());

    // The command-line flag wins over the file.
    let stream = stream_flag || config.stream;
    let mut pipeline = Pipeline::from_config(&config)?;
    if pipeline.is_empty() {
        warn!("Pipeline {} has no stages; copying input", pipeline_path.display());
    }

    let spinner = create_spinner("Loading points...");
    let buffer = load_points_csv(input)
        .with_context(|| format!("Failed to load points from {}", input.display()))?;
    let points_in = buffer.len();

    let mode = if stream { "streaming" } else { "bulk" };
    spinner.set_message(format!("Running {} stages ({})...", pipeline.len(), mode));
    let result = pipeline.run(buffer, stream);
    spinner.finish_and_clear();
    let buffers = result?;

    let merged = merge(buffers)?;
    write_points_csv(output, &merged)
        .with_context(|| format!("Failed to write points to {}", output.display()))?;

    let stage_names: Vec<&str> = pipeline.stages().iter().map(|s| s.name()).collect();
    print_summary(
        "Pipeline Complete",
        &[
            ("Input file", input.display().to_string()),
            ("Output file", output.display().to_string()),
            ("Stages", stage_names.join(", ")),
            ("Mode", mode.to_string()),
            ("Points in", points_in.to_string()),
            ("Points out", merged.len().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );

    Ok(())
}

/// Concatenate a buffer set into one buffer, in order.
fn merge(buffers: PointBufferSet) -> Result<PointBuffer> {
    let mut iter = buffers.into_iter();
    let Some(mut merged) = iter.next() else {
        anyhow::bail!("Pipeline produced no output buffer");
    };

    for buffer in iter {
        anyhow::ensure!(
            buffer.layout() == merged.layout(),
            "Pipeline produced buffers with different dimensions"
        );
        for id in 0..buffer.len() {
            merged.push_row(&buffer.row(id))?;
        }
    }
    Ok(merged)
}

fn cmd_info(input: &Path) -> Result<()> {
    let start = Instant::now();

    let spinner = create_spinner("Loading points...");
    let result = load_points_csv(input);
    spinner.finish_and_clear();
    let buffer = result.with_context(|| format!("Failed to load points from {}", input.display()))?;

    let mut items = vec![
        ("Input file", input.display().to_string()),
        ("Points", buffer.len().to_string()),
    ];

    for (dim, name) in buffer.layout().dims() {
        let values = buffer.column(dim);
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let line = match median_absolute_deviation(values) {
            Some(est) => format!(
                "[{:.3}, {:.3}] med {:.3} mad {:.3}",
                min,
                max,
                est.median,
                est.scaled(NORMAL_CONSISTENCY)
            ),
            None => "no values".to_string(),
        };
        items.push((name, line));
    }

    items.push(("Duration", format!("{:.2?}", start.elapsed())));
    print_summary("Point File Info", &items);

    Ok(())
}
