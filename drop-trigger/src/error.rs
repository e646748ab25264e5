use drop_trigger_types::InvalidSettings;

/// Possible errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot handle {event} while {from}")]
    InvalidTransition {
        from: &'static str,
        event: &'static str,
    },
    #[error("invalid capture settings: {0}")]
    InvalidSettings(#[from] InvalidSettings),
    #[error("detector configuration cannot change while detection is enabled")]
    DetectorBusy,
    #[error("no tokio runtime: {source}")]
    NoRuntime {
        #[from]
        source: tokio::runtime::TryCurrentError,
    },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("frame analysis worker disconnected")]
    WorkerDisconnected,
    #[error("frame analysis worker already closed")]
    AlreadyClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
