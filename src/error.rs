use std::path::PathBuf;

use parking_lot::Mutex;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("schema mismatch in {path}: expected schema {expected}, found {found}")]
    SchemaMismatch {
        path: PathBuf,
        expected: u16,
        found: u16,
    },

    #[error("checksum mismatch in sector [{start}, {end})")]
    SectorChecksumMismatch { start: usize, end: usize },

    #[error("store out of space")]
    OutOfSpace,

    #[error("composite key of {0} encoded bytes cannot fit within a sector")]
    CompositeKeyTooLarge(usize),

    #[error("cannot reset the store: {0} sessions still authenticated")]
    SessionsStillAuthenticated(usize),

    #[error("replay index capacity {0} is not a power of two")]
    IndexCapacityNotPowerOfTwo(usize),

    #[error("unknown recording {0}")]
    UnknownRecording(i64),

    #[error("read of [{position}, {position}+{length}) is out of bounds for recording {recording_id}")]
    ReadOutOfBounds {
        recording_id: i64,
        position: i64,
        length: i32,
    },

    #[error("malformed FIX message: {0}")]
    MalformedMessage(&'static str),

    #[error("malformed context record at byte {position}")]
    MalformedContextRecord { position: usize },
}

/// Per-agent error reporting. Agents never propagate errors across their
/// boundary; they hand them to the sink and continue their duty cycle.
pub trait ErrorSink: Send + Sync {
    fn on_error(&self, error: &Error);
}

/// Default sink: structured log record, nothing else.
pub struct LoggingErrorSink;

impl ErrorSink for LoggingErrorSink {
    fn on_error(&self, error: &Error) {
        tracing::error!(%error);
    }
}

/// Sink that retains every report, for assertions in tests and for
/// operator tooling that wants to inspect the error stream.
#[derive(Default)]
pub struct CollectingErrorSink {
    errors: Mutex<Vec<String>>,
}

impl CollectingErrorSink {
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.errors.lock())
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.errors.lock().iter().any(|e| e.contains(needle))
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }
}

impl ErrorSink for CollectingErrorSink {
    fn on_error(&self, error: &Error) {
        self.errors.lock().push(error.to_string());
    }
}
