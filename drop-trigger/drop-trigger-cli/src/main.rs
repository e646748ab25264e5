use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use futures::stream::{Stream, StreamExt};
use machine_vision_formats::pixel_format::RGB8;
use tokio::{runtime::Handle, sync::mpsc, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use drop_trigger::{CaptureController, FrameAnalyzer, physics};
use drop_trigger_types::{CaptureSettings, CaptureState, CaptureStatus};

mod config;
mod file_recorder;
mod logging;
mod synthetic;

use config::DropTriggerConfig;
use file_recorder::FileRecorder;
use logging::LogOptions;
use synthetic::SyntheticLedSource;

#[derive(Debug, Parser)]
#[command(name = "drop-trigger", author, version, about)]
struct Cli {
    /// Configuration file (TOML). Built-in defaults are used if not given.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also append the log to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// More console output; repeat for trace level
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// The command to run. Defaults to "run".
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Arm, wait for the LED flash and record
    Run {
        /// Number of captures
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
    /// Print the default configuration as TOML
    PrintDefaultConfig,
    /// Print when recording starts relative to the trigger
    Timing,
}

fn load_config(path: Option<&PathBuf>) -> eyre::Result<DropTriggerConfig> {
    match path {
        Some(path) => config::parse_config_file(path)
            .with_context(|| format!("reading config {}", path.display())),
        None => {
            let mut cfg = DropTriggerConfig::default();
            config::expand_default_paths(&mut cfg)?;
            Ok(cfg)
        }
    }
}

fn print_timing(settings: &CaptureSettings) -> eyre::Result<()> {
    settings.validate()?;
    let fall = physics::drop_time(settings.drop_height_meters);
    let delay = physics::recording_start_delay(settings).as_secs_f64();
    println!(
        "drop height:       {:.1} cm",
        settings.drop_height_meters * 100.0
    );
    println!("fall time:         {fall:.3} s");
    println!("recording starts:  {delay:.3} s after the trigger");
    println!("impact at:         {:.3} s into the recording", fall - delay);
    println!(
        "recording length:  {:.2} s at {} fps",
        settings.total_duration().as_secs_f64(),
        settings.frame_rate
    );
    Ok(())
}

async fn log_status(changes: impl Stream<Item = (CaptureStatus, CaptureStatus)>) {
    let mut changes = std::pin::pin!(changes);
    while let Some((old, new)) = changes.next().await {
        if old.state != new.state {
            info!("{}", new.state);
        } else if old.progress != new.progress {
            debug!("recording {:.0}%", new.progress * 100.0);
        }
    }
}

async fn run(cfg: DropTriggerConfig, count: usize) -> eyre::Result<()> {
    let settings = cfg.capture.to_capture_settings();
    settings.validate()?;
    tokio::fs::create_dir_all(&cfg.output_dir)
        .await
        .with_context(|| format!("creating {}", cfg.output_dir.display()))?;
    info!("writing recordings to {}", cfg.output_dir.display());

    let (tx, rx) = mpsc::channel(16);
    let recorder = Arc::new(FileRecorder::new(&cfg.output_dir, tx, Handle::current()));
    let ctl = CaptureController::new(recorder, cfg.detector.clone())?;
    let forward = tokio::spawn(ctl.clone().forward_recorder_events(rx));
    let status = tokio::spawn(log_status(ctl.subscribe()));

    let mut analyzer = FrameAnalyzer::<RGB8>::spawn(ctl.clone())?;
    let mut source = SyntheticLedSource::new(&cfg.source);
    let frame_interval = Duration::try_from_secs_f64(1.0 / cfg.source.frame_rate)
        .wrap_err("invalid source frame rate")?;
    let flash_delay = Duration::try_from_secs_f64(cfg.source.flash_delay_secs)
        .wrap_err("invalid flash delay")?;
    let mut ticker = tokio::time::interval(frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let ctrl_c = tokio::signal::ctrl_c();
    let mut ctrl_c = std::pin::pin!(ctrl_c);
    let mut n_completed = 0;

    'captures: for i in 1..=count {
        // A still lit LED would trigger the new attempt at once.
        while source.led().is_lit(ctl.session_time()) {
            ticker.tick().await;
        }
        ctl.arm(settings.clone())?;
        let press_at = ctl.session_time() + flash_delay;
        let mut flashed = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut ctrl_c => {
                    info!("interrupted");
                    ctl.disarm();
                    break 'captures;
                }
            }
            let now = ctl.session_time();
            if !flashed && now >= press_at && ctl.is_detecting() {
                flashed = source.press_button(now);
                if flashed {
                    debug!("LED flash at {:.3} s", now.as_secs_f64());
                }
            }
            match ctl.state() {
                CaptureState::Completed { artifact } => {
                    info!("capture {i} of {count} saved to {artifact}");
                    n_completed += 1;
                    break;
                }
                CaptureState::Error { reason } => {
                    warn!("capture {i} of {count} failed: {reason}");
                    break;
                }
                _ => {}
            }
            analyzer.submit(source.render(now)?, now)?;
        }
    }

    let stats = analyzer.close()?;
    info!(
        "{n_completed} of {count} captures completed, {} frames analyzed, {} dropped",
        stats.analyzed, stats.dropped
    );
    forward.abort();
    status.abort();
    Ok(())
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    logging::init(&LogOptions {
        file: cli.log_file.clone(),
        verbose: cli.verbose,
    })?;

    let cfg = load_config(cli.config.as_ref())?;
    match cli.command.unwrap_or(Commands::Run { count: 1 }) {
        Commands::Run { count } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("drop-trigger-runtime")
                .build()?;
            runtime.block_on(run(cfg, count))?;
        }
        Commands::PrintDefaultConfig => {
            print!("{}", DropTriggerConfig::default().to_toml()?);
        }
        Commands::Timing => print_timing(&cfg.capture.to_capture_settings())?,
    }
    Ok(())
}
