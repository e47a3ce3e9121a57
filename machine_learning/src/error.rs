use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use ndarray::ShapeError;
use safetensors::SafeTensorError;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    Shape(ShapeError),
    InvalidInput(String),
    MissingForwardCache {
        layer: &'static str,
    },
    CheckpointMissingKey(String),
    CheckpointUnexpectedKey(String),
    CheckpointShapeMismatch {
        key: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    CheckpointDtype {
        key: String,
        dtype: String,
    },
    CheckpointMetadata {
        key: String,
        value: String,
    },
    Safetensors(SafeTensorError),
    EmptyDataset(String),
    Io(io::Error),
    Image(image::ImageError),
    Csv(csv::Error),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => format!("There's a size mismatch for {what}, got {got} and expected {expected}"),
            MlErr::Shape(e) => format!("Invalid array shape: {e}"),
            MlErr::InvalidInput(msg) => format!("Invalid input: {msg}"),
            MlErr::MissingForwardCache { layer } => {
                format!("Called backward on a {layer} layer without a previous forward pass")
            }
            MlErr::CheckpointMissingKey(key) => {
                format!("The checkpoint has no entry for the model's {key}")
            }
            MlErr::CheckpointUnexpectedKey(key) => {
                format!("The checkpoint entry {key} doesn't belong to the model")
            }
            MlErr::CheckpointShapeMismatch { key, got, expected } => format!(
                "The checkpoint entry {key} has shape {got:?} but the model expects {expected:?}"
            ),
            MlErr::CheckpointDtype { key, dtype } => {
                format!("The checkpoint entry {key} is stored as {dtype}, only F32 is supported")
            }
            MlErr::CheckpointMetadata { key, value } => {
                format!("Failed to parse checkpoint metadata {key}={value}")
            }
            MlErr::Safetensors(e) => format!("safetensors error: {e:?}"),
            MlErr::EmptyDataset(msg) => format!("Empty dataset: {msg}"),
            MlErr::Io(e) => format!("io error: {e}"),
            MlErr::Image(e) => format!("image error: {e}"),
            MlErr::Csv(e) => format!("csv error: {e}"),
        };

        write!(f, "{s}")
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Shape(e) => Some(e),
            MlErr::Io(e) => Some(e),
            MlErr::Image(e) => Some(e),
            MlErr::Csv(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for MlErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<SafeTensorError> for MlErr {
    fn from(value: SafeTensorError) -> Self {
        Self::Safetensors(value)
    }
}

impl From<io::Error> for MlErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<image::ImageError> for MlErr {
    fn from(value: image::ImageError) -> Self {
        Self::Image(value)
    }
}

impl From<csv::Error> for MlErr {
    fn from(value: csv::Error) -> Self {
        Self::Csv(value)
    }
}
