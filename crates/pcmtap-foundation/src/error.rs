use thiserror::Error;

/// Closed error space for the driver adapter boundary.
///
/// Raw driver error integers never cross into the engine; the adapter
/// translates them into one of these variants. `Overrun` and `Suspended`
/// are transient and handled by recover-then-start; everything in `Fatal`
/// ends the capture session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("buffer overrun")]
    Overrun,

    #[error("stream suspended by the hardware")]
    Suspended,

    #[error("device busy, try again")]
    Busy,

    #[error("device disconnected")]
    Disconnected,

    #[error("driver failure: {0}")]
    Fatal(String),
}

impl DriverError {
    /// Transient errors are candidates for `recover`; the rest tear the
    /// session down.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverError::Overrun | DriverError::Suspended | DriverError::Busy
        )
    }
}

/// Fatal capture-session errors. Recoverable driver conditions never show
/// up here; by the time one of these is constructed the capture thread is
/// on its way out and the main thread gets an unload request.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("driver error in {call}: {source}")]
    Driver {
        call: &'static str,
        source: DriverError,
    },

    #[error("resume failed: {0}")]
    ResumeFailed(String),

    #[error("poll failed: {0}")]
    Poll(String),

    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to spawn capture thread: {0}")]
    Spawn(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid buffer metrics: {0}")]
    BufferMetrics(String),

    #[error("invalid sample specification")]
    SampleSpec,

    #[error("source name {0:?} is already registered")]
    NameTaken(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_split() {
        assert!(DriverError::Overrun.is_transient());
        assert!(DriverError::Suspended.is_transient());
        assert!(DriverError::Busy.is_transient());
        assert!(!DriverError::Disconnected.is_transient());
        assert!(!DriverError::Fatal("gone".into()).is_transient());
    }

    #[test]
    fn config_error_nests_into_capture_error() {
        let e: CaptureError = ConfigError::SampleSpec.into();
        assert!(matches!(e, CaptureError::Config(ConfigError::SampleSpec)));
    }
}
