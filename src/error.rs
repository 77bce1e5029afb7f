//! Error taxonomy for the surface-data pipeline.
//!
//! Every error is fatal: the controller never retries or recovers locally, it
//! unwinds to `main` and surfaces whatever diagnostic text the failing tool
//! produced.
use crate::stage::StageKind;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad or ambiguous settings, output conflicts, unsupported forcing, or an
    /// unparseable namelist.
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    StageExecution(#[from] StageExecutionError),

    /// Remote sample download failed.
    #[error("network error: {0}")]
    Network(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StageExecutionError {
    #[error(
        "stage {stage} failed: `{command}` exited with {}\n{stderr}",
        describe_exit(.code)
    )]
    NonZeroExit {
        stage: StageKind,
        command: String,
        /// Exit code; `None` when the tool was killed by a signal.
        code: Option<i32>,
        stderr: String,
    },

    #[error("stage {stage} failed: could not start `{command}`: {reason}")]
    Spawn {
        stage: StageKind,
        command: String,
        reason: String,
    },

    #[error("stage {stage} failed: {what} not found in tool output")]
    OutputNotFound { stage: StageKind, what: String },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "termination by signal".to_string(),
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Config(message.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::Io {
            context: context.into(),
            source,
        }
    }

    /// Build an I/O error whose context names the path being touched.
    pub fn io_at(verb: &str, path: &Path, source: std::io::Error) -> Self {
        Self::io(format!("{verb} {}", path.display()), source)
    }
}

impl From<ureq::Error> for PipelineError {
    fn from(err: ureq::Error) -> Self {
        PipelineError::Network(err.to_string())
    }
}
