use std::path::PathBuf;

use itertools::Itertools;
use thiserror::Error;

use crate::{fixup::Diagnostic, options::Ddir};

/// Everything that can go wrong while turning job descriptions into ready
/// worker records.
#[derive(Error, Debug)]
pub enum SetupError {
    /// No arena could be created, not even with a capacity of one record.
    #[error("failed to setup shared job area (last tried capacity {capacity}): {reason}")]
    ArenaCreationFailed { capacity: usize, reason: String },

    /// Every arena slot is occupied.
    #[error("maximum number of jobs ({max}) reached")]
    JobLimitReached { max: usize },

    #[error("failed to load engine {name}")]
    EngineLoadFailed { name: String },

    #[error("{ddir} rate lower than supported")]
    InvalidRate { ddir: Ddir },

    /// Entropy source and job-file I/O.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A normalizer rule rejected the configuration, or a warning was
    /// promoted because warnings are fatal.
    #[error("job {job}: {}", format_diagnostics(.reasons))]
    ConfigConflict { job: String, reasons: Vec<Diagnostic> },

    #[error("bad option <{key}>: {message}")]
    Option { key: String, message: String },

    #[error("{}:{line}: {message}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("debug mask {0} not found")]
    Debug(String),

    #[error("no job in slot {ordinal}")]
    UnknownJob { ordinal: u32 },

    /// The arena already holds records and cannot be resized.
    #[error("cannot resize job area to {requested} while {live} jobs are placed")]
    ArenaBusy { requested: usize, live: usize },
}

impl SetupError {
    /// errno-style code recorded on the job that failed.
    pub fn code(&self) -> i32 {
        match self {
            SetupError::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            SetupError::ArenaCreationFailed { .. } => libc::ENOMEM,
            SetupError::JobLimitReached { .. } | SetupError::ArenaBusy { .. } => libc::EBUSY,
            SetupError::EngineLoadFailed { .. } | SetupError::UnknownJob { .. } => libc::ENOENT,
            SetupError::InvalidRate { .. }
            | SetupError::ConfigConflict { .. }
            | SetupError::Option { .. }
            | SetupError::Parse { .. }
            | SetupError::Debug(_) => libc::EINVAL,
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SetupError::Io {
            context: context.into(),
            source,
        }
    }
}

fn format_diagnostics(reasons: &[Diagnostic]) -> String {
    reasons.iter().map(|d| &d.message).join("; ")
}
