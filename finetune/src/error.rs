use std::{error::Error, fmt, io};

use machine_learning::MlErr;

/// The result type of the fine-tuning run.
pub type Result<T> = std::result::Result<T, FinetuneErr>;

/// All errors that can end a fine-tuning run.
#[derive(Debug)]
pub enum FinetuneErr {
    /// Invalid configuration, caught before the run starts.
    InvalidConfig(String),
    /// A score was recorded for an epoch outside the score arrays.
    ScoreOutOfRange { epoch: usize, epochs: usize },
    /// The model, the data or a checkpoint failed.
    Ml(MlErr),
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for FinetuneErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::ScoreOutOfRange { epoch, epochs } => {
                write!(f, "can't record scores for epoch {epoch}, the run has {epochs} epochs")
            }
            Self::Ml(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl Error for FinetuneErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Ml(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MlErr> for FinetuneErr {
    fn from(e: MlErr) -> Self {
        Self::Ml(e)
    }
}

impl From<io::Error> for FinetuneErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for FinetuneErr {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}
