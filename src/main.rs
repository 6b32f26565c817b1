//! CLI entry point for daq_scan
//!
//! Runs scans against simulated hardware, which is useful for trying out
//! configurations and watching the engine's concurrency in the logs.
//!
//! # Usage
//!
//! A 1-D scan with two detectors:
//! ```bash
//! daq_scan run --points 10 --detectors 2
//! ```
//!
//! A 2-D scan with concurrent readout, points printed as JSON lines:
//! ```bash
//! daq_scan run --points 5 --inner 3 --concurrent --json
//! ```
//!
//! A hardware-triggered line nested inside a stepped axis:
//! ```bash
//! daq_scan run --points 3 --triggered 20
//! ```
//!
//! Print the effective configuration:
//! ```bash
//! daq_scan config --config config/scan.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use daq_scan::composer::ScanArg;
use daq_scan::sim::{SimDetector, SimMotor, SimMoveController, SimTriggeredDetector};
use daq_scan::telemetry::{self, OutputFormat};
use daq_scan::{DeviceHandle, HardwareTriggeredLine, MemorySink, Scan, ScanConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "daq_scan")]
#[command(about = "Concurrent step-scan engine with simulated hardware", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/scan.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Compact, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scan over simulated devices
    Run {
        /// Points along the outer axis
        #[arg(long, default_value_t = 5)]
        points: usize,

        /// Step size of the outer axis
        #[arg(long, default_value_t = 1.0)]
        step: f64,

        /// Points along a nested inner axis (0 for a 1-D scan)
        #[arg(long, default_value_t = 0)]
        inner: usize,

        /// Number of software-triggered detectors
        #[arg(long, default_value_t = 1)]
        detectors: usize,

        /// Detector collection time in seconds
        #[arg(long, default_value_t = 0.01)]
        collection_time: f64,

        /// Replace the detectors with a hardware-triggered line of this many frames
        #[arg(long)]
        triggered: Option<usize>,

        /// Read detectors concurrently with the next move
        #[arg(long)]
        concurrent: bool,

        /// Print points as JSON lines instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormat> for OutputFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Pretty => OutputFormat::Pretty,
            LogFormat::Compact => OutputFormat::Compact,
            LogFormat::Json => OutputFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref())?;
    telemetry::init_from_config(&config, cli.log_format.into())?;

    match cli.command {
        Commands::Run {
            points,
            step,
            inner,
            detectors,
            collection_time,
            triggered,
            concurrent,
            json,
        } => {
            let mut config = config;
            if concurrent {
                config.pipeline.concurrent_readout = true;
            }
            let plan = RunPlan {
                points,
                step,
                inner,
                detectors,
                collection_time,
                triggered,
            };
            run_simulated_scan(config, plan, json).await
        }
        Commands::Config => {
            println!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ScanConfig> {
    let config = match path {
        Some(path) => ScanConfig::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ScanConfig::load().context("loading configuration")?,
    };
    Ok(config)
}

struct RunPlan {
    points: usize,
    step: f64,
    inner: usize,
    detectors: usize,
    collection_time: f64,
    triggered: Option<usize>,
}

async fn run_simulated_scan(config: ScanConfig, plan: RunPlan, json: bool) -> Result<()> {
    let outer = DeviceHandle::scannable(Arc::new(SimMotor::new("stage_x").with_level(3).with_speed(50.0)));
    let temperature = DeviceHandle::scannable(Arc::new(SimMotor::new("temperature").with_position(21.5)));

    let last = plan.step * plan.points.saturating_sub(1) as f64;
    let mut args: Vec<ScanArg> = vec![
        outer.into(),
        0.0.into(),
        last.into(),
        plan.step.into(),
    ];

    if plan.inner > 0 {
        let inner = DeviceHandle::scannable(Arc::new(SimMotor::new("stage_y").with_level(4).with_speed(50.0)));
        args.extend([
            ScanArg::from(inner),
            ScanArg::from(0.0),
            ScanArg::from((plan.inner - 1) as f64 * 0.5),
            ScanArg::from(0.5),
        ]);
    }

    match plan.triggered {
        Some(frames) => {
            let axis = DeviceHandle::scannable(Arc::new(SimMotor::new("theta")));
            let mut line = HardwareTriggeredLine::new(
                axis,
                Arc::new(SimMoveController::new("trajectory")),
                0.0,
                frames.saturating_sub(1) as f64 * 0.1,
                0.1,
            )?;
            for i in 0..plan.detectors.max(1) {
                let detector = SimTriggeredDetector::new(&format!("frames{i}")).with_collection_time(plan.collection_time);
                line = line.with_detector(DeviceHandle::hardware_triggered(Arc::new(detector)))?;
            }
            args.push(line.into());
        }
        None => {
            for i in 0..plan.detectors {
                let detector = Arc::new(
                    SimDetector::new(&format!("counter{i}"))
                        .with_level(5)
                        .with_readout_delay(Duration::from_millis(5))
                        .with_random_deferred_delay(Duration::from_millis(20))
                        .with_gain(100.0 * (i + 1) as f64)
                        .with_noise(1.0),
                );
                let mut handle = DeviceHandle::detector(detector.clone());
                if config.pipeline.concurrent_readout {
                    handle = handle.with_deferred_values(detector);
                }
                args.push(handle.into());
                args.push(plan.collection_time.into());
            }
        }
    }
    args.push(temperature.into());

    let sink = Arc::new(MemorySink::new("simulated"));
    let scan = Scan::builder().args(args).config(config).sink(sink.clone()).build().await?;
    info!(command = scan.tree().command(), points = scan.total_points(), "Scan built");

    let summary = scan.run().await?;

    let points = sink.points();
    if json {
        for point in &points {
            println!("{}", serde_json::to_string(point)?);
        }
    } else if let Some(first) = points.first() {
        println!("{}", first.header().join("\t"));
        for point in &points {
            println!("{}", point.to_row().join("\t"));
        }
    }
    eprintln!(
        "{}: {} of {} points published ({})",
        summary.status, summary.points_published, summary.total_points, summary.command
    );
    Ok(())
}
