use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use radcab_sensor::{CaptureOptions, DeviceSession};
use radcab_source::{FireState, SourceController};

#[derive(Parser)]
#[command(name = "radcab", about = "Radcab X-ray cabinet CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sensor identity and current settings
    Info {
        /// Also report the source controller on this serial port
        #[arg(long)]
        port: Option<String>,
    },
    /// Capture frames, optionally driving the X-ray source
    Capture {
        /// Number of frames to capture
        #[arg(short, default_value_t = 1)]
        n: usize,
        /// Sensor integration time in milliseconds
        #[arg(long, default_value_t = 500)]
        exposure_ms: u32,
        /// Output directory for raw frame files
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// Source controller serial port; omit for sensor-only capture
        #[arg(long)]
        port: Option<String>,
        /// Tube voltage in kVp (requires --port)
        #[arg(long, default_value_t = 26)]
        kvp: u8,
        /// Source exposure timer in deciseconds (requires --port)
        #[arg(long, default_value_t = 140)]
        timer_ds: u16,
    },
    /// Query or control the X-ray source directly
    Source {
        /// Source controller serial port
        #[arg(long)]
        port: String,
        #[command(subcommand)]
        command: SourceCommands,
    },
}

#[derive(Subcommand)]
enum SourceCommands {
    /// Show device, revision, state, mode, kVp and timer
    Status,
    /// Set tube voltage in kVp
    SetKvp { kvp: u8 },
    /// Set exposure timer in deciseconds
    SetTimer { deciseconds: u16 },
    /// Run a complete fire sequence
    Fire,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { port } => info(port.as_deref()).await,
        Commands::Capture {
            n,
            exposure_ms,
            dir,
            port,
            kvp,
            timer_ds,
        } => capture(n, exposure_ms, &dir, port.as_deref(), kvp, timer_ds).await,
        Commands::Source { port, command } => source(&port, command),
    }
}

async fn info(port: Option<&str>) -> Result<()> {
    let mut session = DeviceSession::open().await?;
    let identity = session.identity().await?;
    let geometry = session.geometry().await?;
    let exposure = session.exposure_ms().await?;

    println!("vendor:   {}", identity.vendor);
    println!("model:    {}", identity.model);
    println!("firmware: {}", identity.firmware);
    println!("serial:   {}", identity.serial);
    println!("geometry: {}x{}", geometry.width, geometry.height);
    println!("exposure: {exposure} ms");

    if let Some(path) = port {
        let mut ctl = SourceController::open(path)?;
        println!("source:   {} rev {}", ctl.get_device()?, ctl.get_revision()?);
        println!("state:    {:?}", ctl.get_state()?);
        println!("kVp:      {}", ctl.get_kvp()?);
        println!("timer:    {} ds", ctl.get_exposure_deciseconds()?);
    }
    Ok(())
}

async fn capture(
    n: usize,
    exposure_ms: u32,
    dir: &std::path::Path,
    port: Option<&str>,
    kvp: u8,
    timer_ds: u16,
) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating output directory {}", dir.display()))?;

    let mut session = DeviceSession::open().await?;
    session.set_exposure_ms(exposure_ms).await?;

    let mut source = match port {
        Some(path) => {
            let mut ctl = SourceController::open(path)?;
            ctl.set_mode_remote()?;
            ctl.set_kvp(kvp)?;
            ctl.set_exposure_deciseconds(timer_ds)?;
            ctl.fire_begin()?;
            Some(ctl)
        }
        None => None,
    };

    let engine = session.capture_engine(CaptureOptions::for_exposure_ms(exposure_ms));
    let result = engine.capture(n).await;

    // Settle the source before looking at the frames; the tube must not be
    // left emitting on a capture error.
    if let Some(ctl) = source.as_mut() {
        match &result {
            Ok(_) => {
                // Source timer runs in deciseconds; pad generously.
                let wait = Duration::from_millis(u64::from(timer_ds) * 100 + 2000);
                if ctl.fire_state() == FireState::AwaitingComplete {
                    ctl.wait_complete(wait)?;
                }
            }
            Err(_) => ctl.fire_abort()?,
        }
    }

    let frames = result?;
    for (i, frame) in frames.iter().enumerate() {
        let path = dir.join(format!("cap_{i:02}.bin"));
        std::fs::write(&path, frame.payload())
            .with_context(|| format!("writing {}", path.display()))?;
        println!(
            "{}: {}x{} mean {:.1}",
            path.display(),
            frame.width(),
            frame.height(),
            frame.mean_sample()
        );
    }
    if frames.len() < n {
        println!("captured {}/{n} frames", frames.len());
    }
    Ok(())
}

fn source(port: &str, command: SourceCommands) -> Result<()> {
    let mut ctl = SourceController::open(port)?;
    match command {
        SourceCommands::Status => {
            println!("device:   {}", ctl.get_device()?);
            println!("revision: {}", ctl.get_revision()?);
            println!("state:    {:?}", ctl.get_state()?);
            println!("mode:     {:?}", ctl.get_mode()?);
            println!("kVp:      {}", ctl.get_kvp()?);
            println!("timer:    {} ds", ctl.get_exposure_deciseconds()?);
        }
        SourceCommands::SetKvp { kvp } => {
            ctl.set_mode_remote()?;
            ctl.set_kvp(kvp)?;
            println!("kVp set to {kvp}");
        }
        SourceCommands::SetTimer { deciseconds } => {
            ctl.set_mode_remote()?;
            ctl.set_exposure_deciseconds(deciseconds)?;
            println!("timer set to {deciseconds} ds");
        }
        SourceCommands::Fire => {
            ctl.set_mode_remote()?;
            let timer_ds = ctl.get_exposure_deciseconds()?;
            let wait = Duration::from_millis(u64::from(timer_ds) * 100 + 2000);
            ctl.fire(wait)?;
            println!("exposure complete");
        }
    }
    Ok(())
}
