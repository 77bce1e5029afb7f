//! Synchronous execution of external geophysical tools.
//!
//! Each stage builds an `ExternalCommand`; the executor resolves the program,
//! layers the stage's environment overlay on top of the inherited environment,
//! waits for exit, and hands back the captured stdout.
use crate::error::{PipelineError, Result, StageExecutionError};
use crate::stage::{EnvOverlays, StageKind};
use crate::util::format_command_line;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// One invocation of an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    pub stage: StageKind,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// File fed to the tool on standard input.
    pub stdin: Option<PathBuf>,
    pub current_dir: PathBuf,
}

impl ExternalCommand {
    pub fn new(stage: StageKind, program: impl Into<PathBuf>, current_dir: &Path) -> Self {
        Self {
            stage,
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            current_dir: current_dir.to_path_buf(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    pub fn stdin_from(mut self, path: &Path) -> Self {
        self.stdin = Some(path.to_path_buf());
        self
    }

    /// Shell-quoted rendering for logs and error messages.
    pub fn command_line(&self) -> String {
        let line = format_command_line(&self.program, &self.args);
        match &self.stdin {
            Some(stdin) => format!("{line} < {}", stdin.display()),
            None => line,
        }
    }
}

/// Runs external commands and returns their captured stdout.
///
/// A nonzero exit is always an error; implementations never retry.
pub trait CommandExecutor {
    fn run(&mut self, command: &ExternalCommand) -> Result<String>;
}

/// Executor backed by real child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    overlays: EnvOverlays,
}

impl ProcessExecutor {
    pub fn new(overlays: EnvOverlays) -> Self {
        Self { overlays }
    }

    fn resolve_program(&self, command: &ExternalCommand) -> Result<PathBuf> {
        let program = &command.program;
        if program.components().count() > 1 || program.is_absolute() {
            return Ok(program.clone());
        }
        which::which(program).map_err(|err| {
            StageExecutionError::Spawn {
                stage: command.stage,
                command: command.command_line(),
                reason: err.to_string(),
            }
            .into()
        })
    }
}

impl CommandExecutor for ProcessExecutor {
    fn run(&mut self, command: &ExternalCommand) -> Result<String> {
        let command_line = command.command_line();
        tracing::info!(stage = %command.stage, "executing {command_line}");

        let program = self.resolve_program(command)?;
        let mut child = Command::new(&program);
        child.args(&command.args);
        child.current_dir(&command.current_dir);
        for (key, value) in self.overlays.for_stage(command.stage) {
            child.env(key, value);
        }
        match &command.stdin {
            Some(path) => {
                let file =
                    File::open(path).map_err(|err| PipelineError::io_at("open", path, err))?;
                child.stdin(Stdio::from(file));
            }
            None => {
                child.stdin(Stdio::null());
            }
        }
        child.stdout(Stdio::piped());
        child.stderr(Stdio::piped());

        let output = child.output().map_err(|err| StageExecutionError::Spawn {
            stage: command.stage,
            command: command_line.clone(),
            reason: err.to_string(),
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        tracing::debug!(stage = %command.stage, "stdout:\n{stdout}");

        if !output.status.success() {
            return Err(StageExecutionError::NonZeroExit {
                stage: command.stage,
                command: command_line,
                code: output.status.code(),
                stderr,
            }
            .into());
        }
        if !stderr.trim().is_empty() {
            tracing::debug!(stage = %command.stage, "stderr:\n{stderr}");
        }
        tracing::info!(stage = %command.stage, "done");
        Ok(stdout)
    }
}
