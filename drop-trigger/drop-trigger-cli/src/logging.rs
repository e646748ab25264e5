//! Console and log file output.
//!
//! The console shows `info` and above unless `-v` is given or `RUST_LOG` is
//! set. The log file, when requested, is appended to and always gets this
//! program's debug output, so a failed capture can be reconstructed later.

use std::{fs::OpenOptions, path::PathBuf, sync::Mutex};

use time::{UtcOffset, format_description::well_known::Rfc3339};
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::LevelFilter,
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

const FILE_DIRECTIVES: &str = "info,drop_trigger=debug";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("local UTC offset: {source}")]
    Offset {
        #[from]
        source: time::error::ComponentRange,
    },
    #[error("opening log file: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("installing subscriber: {source}")]
    Init {
        #[from]
        source: tracing_subscriber::util::TryInitError,
    },
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Append the log to this file.
    pub file: Option<PathBuf>,
    /// Number of `-v` flags.
    pub verbose: u8,
}

impl LogOptions {
    fn console_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

/// Timestamps in the UTC offset in effect when the program started.
fn session_timer() -> Result<OffsetTime<Rfc3339>, LoggingError> {
    let offset = UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?;
    Ok(OffsetTime::new(offset, Rfc3339))
}

fn console_filter(level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

pub fn init(opts: &LogOptions) -> Result<(), LoggingError> {
    let timer = session_timer()?;

    let console = fmt::layer()
        .compact()
        .with_timer(timer.clone())
        .with_target(false)
        .with_thread_names(true)
        .with_ansi(!cfg!(windows))
        .with_filter(console_filter(opts.console_level()));

    let file = match &opts.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_timer(timer)
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_thread_names(true)
                    .with_line_number(true)
                    .with_filter(EnvFilter::new(FILE_DIRECTIVES)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()?;

    if let Some(path) = &opts.file {
        tracing::debug!("appending log to {}", path.display());
    }
    Ok(())
}
