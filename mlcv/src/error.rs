use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to (de)serialize artifact: {0}")]
    Encode(#[from] bincode::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("shape mismatch: expected {expected}, found {found}")]
    Shape { expected: String, found: String },
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("need at least two classes to train a classifier, found {0}")]
    SingleClass(usize),
    #[error("empty input: {0}")]
    EmptyInput(&'static str),
    #[error("artifact {name} not found at {path:?}")]
    MissingArtifact { name: String, path: PathBuf },
}

impl Error {
    pub(crate) fn shape(expected: impl ToString, found: impl ToString) -> Self {
        Self::Shape {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub(crate) fn invalid(name: &'static str, reason: impl ToString) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.to_string(),
        }
    }

    /// Whether the failure came from reading the artifact rather than its contents.
    ///
    /// A missing, unreadable or truncated file is recoverable by recomputing the artifact.
    pub fn is_io(&self) -> bool {
        match self {
            Error::Io(_) | Error::MissingArtifact { .. } => true,
            Error::Encode(e) => matches!(**e, bincode::ErrorKind::Io(_)),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
