//! CLI Entry Point for xpcs-daq
//!
//! Provides command-line interface for:
//! - Running a full acquisition against the simulated detector
//! - Inspecting IMM sparse-frame containers
//!
//! # Usage
//!
//! Run an acquisition:
//! ```bash
//! xpcs_daq acquire --path ./data --file-name A001 --num-images 50
//! ```
//!
//! Inspect a container:
//! ```bash
//! xpcs_daq imm-info ./data/A001_00001-00050.imm --frames
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
// Use mimalloc for improved allocation performance in multi-threaded DAQ scenarios
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use xpcs_daq::acquire::{AcquisitionMode, AcquisitionRequest, DetectorSession, Orchestrator};
use xpcs_daq::config::Settings;
use xpcs_daq::device::{AreaDetector, Device, MonitorDevice, SimDetector};
use xpcs_daq::imm::ImmReader;

#[derive(Parser)]
#[command(name = "xpcs-daq")]
#[command(about = "XPCS beamline acquisition orchestrator", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Falls back to built-in defaults when absent.
    #[arg(long, default_value = "config/xpcs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one acquisition on the simulated detector
    Acquire {
        /// Directory the frame container and metadata artifact land in
        #[arg(long, default_value = "./data")]
        path: PathBuf,

        /// Base name for the frame series
        #[arg(long, default_value = "A001")]
        file_name: String,

        /// Number of frames to acquire
        #[arg(long, default_value = "50")]
        num_images: u32,

        /// Exposure time per frame in seconds
        #[arg(long, default_value = "0.001")]
        acquire_time: f64,

        /// Frame-to-frame period in seconds
        #[arg(long, default_value = "0.002")]
        acquire_period: f64,

        /// Sample name recorded in the run metadata
        #[arg(long, default_value = "simulated_sample")]
        sample: String,

        /// Submit the run for XPCS analysis after the transfer workflow
        #[arg(long)]
        analyze: bool,
    },

    /// Index an IMM container and print its layout
    ImmInfo {
        /// Container file to inspect
        file: PathBuf,

        /// Frames bundled per acquisition point
        #[arg(long, default_value = "1")]
        frames_per_point: usize,

        /// Print every frame entry instead of just the summary
        #[arg(long)]
        frames: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("🔬 xpcs-daq - XPCS Acquisition Orchestrator");
    println!();

    let cli = Cli::parse();

    // A missing config file falls through to the serde defaults; explicit
    // settings always come from the file plus XPCS_DAQ_ environment overrides.
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    settings.validate().map_err(|e| anyhow::anyhow!(e))?;
    xpcs_daq::logging::init_from_settings(&settings).map_err(|e| anyhow::anyhow!(e))?;

    match cli.command {
        Commands::Acquire {
            path,
            file_name,
            num_images,
            acquire_time,
            acquire_period,
            sample,
            analyze,
        } => {
            let request = {
                let mut r = AcquisitionRequest::new(
                    path,
                    file_name,
                    acquire_time,
                    acquire_period,
                    num_images,
                )
                .with_sample_name(sample);
                if analyze {
                    r = r.for_analysis();
                }
                r
            };
            run_acquisition(settings, request).await
        }
        Commands::ImmInfo {
            file,
            frames_per_point,
            frames,
        } => imm_info(&file, frames_per_point, frames),
    }
}

/// How long the one-shot binary holds the process open for the
/// fire-and-forget workflow dispatch before giving up on its outcome.
const DISPATCH_GRACE: Duration = Duration::from_secs(30);

async fn run_acquisition(settings: Settings, request: AcquisitionRequest) -> Result<()> {
    println!("🔧 Bringing up the simulated detector...");
    let detector: Arc<dyn AreaDetector> =
        Arc::new(SimDetector::new("sim_lambda", 516, 516).with_mean_photons(96));

    let session = match settings.detector_by_name("sim_lambda") {
        Some(definition) => DetectorSession::from_definition(definition, detector),
        None => DetectorSession::new(25, "sim_lambda", AcquisitionMode::internal(), detector),
    }
    .with_geometry(516, 516);

    let mut orchestrator = Orchestrator::new(&settings);
    let ring_monitor: Arc<dyn Device> = Arc::new(MonitorDevice::new(
        "ring_current_monitor",
        orchestrator.beamline().ring_current.clone(),
    ));
    let monitors = vec![ring_monitor];

    println!(
        "▶️  Acquiring {} frames into {}...",
        request.num_images,
        request.data_path.display()
    );
    let summary = orchestrator.acquire(&session, &request, &monitors).await?;

    println!();
    println!("✅ Acquisition complete");
    println!("   Run UID:   {} (scan {})", summary.run_uid, summary.scan_id);
    println!("   Datums:    {}", summary.datum_count);
    if let Some(written) = &summary.written_file {
        println!("   Container: {written}");
    }
    println!("   Artifact:  {}", summary.artifact_path.display());
    println!("   Elapsed:   {:.2?}", summary.elapsed);

    // The dispatch leg runs detached; returning from main would tear down
    // the runtime and cancel it mid-retry, so hold the process open until
    // the outcome lands in the ledger.
    if orchestrator.drain_dispatches(DISPATCH_GRACE).await {
        if let Some(record) = orchestrator.dispatch_ledger().records().last() {
            let status = if record.succeeded {
                "succeeded"
            } else {
                "failed (see logs)"
            };
            println!(
                "📨 Workflow {} {status} after {} attempt(s)",
                record.workflow, record.attempts
            );
        }
    } else {
        println!(
            "⚠️  Workflow dispatch still running after {DISPATCH_GRACE:?}; exiting without its outcome"
        );
    }
    Ok(())
}

fn imm_info(file: &PathBuf, frames_per_point: usize, list_frames: bool) -> Result<()> {
    let reader = ImmReader::open(file, frames_per_point)?;

    println!("📦 {}", file.display());
    println!("   Frames:      {}", reader.frame_count());
    println!("   Points:      {}", reader.point_count());
    println!("   Geometry:    {} x {}", reader.rows(), reader.cols());
    println!("   Compression: {:?}", reader.compression());

    if list_frames {
        println!();
        println!("{:>8}  {:>14}  {:>10}  {:>16}", "frame", "offset", "dlen", "epoch_ns");
        for (i, entry) in reader.index().iter().enumerate() {
            let header = reader.header(i)?;
            println!(
                "{i:>8}  {:>14}  {:>10}  {:>16}",
                entry.offset, entry.dlen, header.epoch_ns
            );
        }
    }
    Ok(())
}
