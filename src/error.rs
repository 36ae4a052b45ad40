use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::bundle::{DeclaredFormat, ExecutionFormat};

pub type PublishResult<T> = Result<T, PublishError>;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("{0}")]
    Configuration(String),

    #[error("{0}")]
    IncompatibleOptions(String),

    #[error("Could not find the bundled output for entry point {}", entry.display())]
    BundleResolution { entry: PathBuf },

    #[error("Cannot deploy with format \"{declared}\": the bundled worker is {actual}")]
    FormatMismatch {
        declared: DeclaredFormat,
        actual: ExecutionFormat,
    },

    #[error("{context} failed ({status}): {message}")]
    Remote {
        context: String,
        status: reqwest::StatusCode,
        message: String,
    },

    #[error("{0}")]
    UnexpectedResponse(String),

    #[error("Custom build command `{command}` failed: {status}")]
    CustomBuild { command: String, status: ExitStatus },

    #[error("Build failed: {0}")]
    Build(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Json5(#[from] json5::Error),
}

impl PublishError {
    pub(crate) fn missing(message: impl Into<String>) -> Self {
        PublishError::Configuration(message.into())
    }

    /// Exit code to surface to the shell. A failed build command passes its
    /// own status through.
    pub fn exit_code(&self) -> i32 {
        match self {
            PublishError::CustomBuild { status, .. } => status.code().unwrap_or(1),
            _ => 1,
        }
    }
}
