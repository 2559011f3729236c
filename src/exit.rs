use std::fmt;

use crate::report::ReportError;
use crate::scan::ScanError;
use crate::update::UpdateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    InvalidArgs,
    ScanFailed,
    ScanCancelled,
    ExternalCommandFailed,
    UpdateFailed,
    ReportFailed,
    Interrupted,
}

impl ExitCode {
    pub const fn as_i32(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::InvalidArgs => 2,
            ExitCode::ScanFailed => 10,
            ExitCode::ScanCancelled => 11,
            ExitCode::ExternalCommandFailed => 20,
            ExitCode::UpdateFailed => 30,
            ExitCode::ReportFailed => 40,
            ExitCode::Interrupted => 130,
        }
    }
}

#[derive(Debug)]
pub struct ExitError {
    pub code: ExitCode,
    pub err: anyhow::Error,
}

impl ExitError {
    pub fn new(code: ExitCode, err: anyhow::Error) -> Self {
        Self { code, err }
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.err.fmt(f)
    }
}

impl std::error::Error for ExitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.err.as_ref())
    }
}

pub fn exit_code(err: &anyhow::Error) -> i32 {
    classify(err).as_i32()
}

fn classify(err: &anyhow::Error) -> ExitCode {
    if let Some(exit) = err.downcast_ref::<ExitError>() {
        return exit.code;
    }
    for cause in err.chain() {
        if let Some(scan) = cause.downcast_ref::<ScanError>() {
            return match scan {
                ScanError::InvalidConfig(_) | ScanError::ExecutableNotFound { .. } => {
                    ExitCode::InvalidArgs
                }
                ScanError::Spawn { .. } | ScanError::Wait(_) => ExitCode::ExternalCommandFailed,
                ScanError::Cancelled => ExitCode::ScanCancelled,
                ScanError::AlreadyRunning
                | ScanError::ProcessFailed { .. }
                | ScanError::TimedOut(_) => ExitCode::ScanFailed,
            };
        }
        if cause.downcast_ref::<UpdateError>().is_some() {
            return ExitCode::UpdateFailed;
        }
        if cause.downcast_ref::<ReportError>().is_some() {
            return ExitCode::ReportFailed;
        }
    }
    ExitCode::ExternalCommandFailed
}

pub fn invalid_args(message: impl Into<String>) -> anyhow::Error {
    ExitError::new(ExitCode::InvalidArgs, anyhow::anyhow!(message.into())).into()
}

pub fn invalid_args_err(err: anyhow::Error) -> anyhow::Error {
    ExitError::new(ExitCode::InvalidArgs, err).into()
}
