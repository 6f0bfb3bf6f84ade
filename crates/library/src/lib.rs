pub mod config;
pub mod gains;
pub mod pool;
pub mod scan;
pub mod state;

use std::path::PathBuf;

use metadata::MetadataError;

pub use config::{ClientConfig, ConfigError, ScanConfig, ScanPolicy};
pub use gains::{GainBatcher, GainError, LoudnessAnalyzer, Mp3Gain};
pub use pool::{Dispatch, WorkerPool};
pub use scan::{FileFailure, PendingFile, ScanOutcome, ScanOverrides, ScanPlan, Scanner};
pub use state::ScanState;

#[derive(Debug)]
pub enum ScanError {
    Io(std::io::Error),
    Walk(walkdir::Error),
    Json(serde_json::Error),
    Glob(glob::PatternError),
    Metadata(MetadataError),
    Gain(GainError),
    File { path: PathBuf, source: Box<ScanError> },
    Interrupted { received: usize, expected: usize },
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Io(err) => write!(f, "io error: {}", err),
            ScanError::Walk(err) => write!(f, "walk error: {}", err),
            ScanError::Json(err) => write!(f, "json error: {}", err),
            ScanError::Glob(err) => write!(f, "bad glob: {}", err),
            ScanError::Metadata(err) => write!(f, "{}", err),
            ScanError::Gain(err) => write!(f, "gain error: {}", err),
            ScanError::File { path, source } => write!(f, "{}: {}", path.display(), source),
            ScanError::Interrupted { received, expected } => write!(
                f,
                "workers stopped after {} of {} files",
                received, expected
            ),
        }
    }
}

impl std::error::Error for ScanError {}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        ScanError::Io(err)
    }
}

impl From<walkdir::Error> for ScanError {
    fn from(err: walkdir::Error) -> Self {
        ScanError::Walk(err)
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(err: serde_json::Error) -> Self {
        ScanError::Json(err)
    }
}

impl From<glob::PatternError> for ScanError {
    fn from(err: glob::PatternError) -> Self {
        ScanError::Glob(err)
    }
}

impl From<MetadataError> for ScanError {
    fn from(err: MetadataError) -> Self {
        ScanError::Metadata(err)
    }
}

impl From<GainError> for ScanError {
    fn from(err: GainError) -> Self {
        ScanError::Gain(err)
    }
}
