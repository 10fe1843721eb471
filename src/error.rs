use std::path::PathBuf;

use thiserror::Error;

/// Failure categories surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required external binary or script is absent.
    ToolMissing,
    /// No valid build configuration or toolchain is available.
    ConfigurationMissing,
    /// A driven subprocess exited unsuccessfully or was cancelled.
    SubprocessFailed,
    /// Tool output did not have the expected shape.
    ParseFailure,
    /// An expected directory or file was absent or unreadable.
    FilesystemError,
}

/// Errors returned by workspace discovery, sourcing and build operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Required tool or script not found: {0}")]
    ToolMissing(String),

    #[error("Missing {0}. Configure a build configuration and toolchain first.")]
    ConfigurationMissing(&'static str),

    #[error("`{program}` failed with exit code {}: {stderr}", display_code(.code))]
    SubprocessFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Unexpected output: {0}")]
    ParseFailure(String),

    #[error("Cannot access {}: {source}", .path.display())]
    FilesystemError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}

impl Error {
    /// Returns the category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ToolMissing(_) => ErrorKind::ToolMissing,
            Error::ConfigurationMissing(_) => ErrorKind::ConfigurationMissing,
            Error::SubprocessFailed { .. } | Error::Cancelled(_) => ErrorKind::SubprocessFailed,
            Error::ParseFailure(_) | Error::Xml(_) => ErrorKind::ParseFailure,
            Error::FilesystemError { .. } | Error::Io(_) => ErrorKind::FilesystemError,
        }
    }

    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::FilesystemError {
            path: path.into(),
            source,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
