use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PROJECT_NAME: &str = "Dependency Check";
pub const DEFAULT_OUTPUT_FORMAT: &str = "JSON";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    pub install_dir: PathBuf,
    pub project_path: PathBuf,
    pub project_name: String,
    pub output_format: String,
    pub skip_self_update: bool,
    pub api_key: Option<String>,
    pub timeout: Option<Duration>,
}

impl ScanConfig {
    pub fn new(install_dir: impl Into<PathBuf>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            project_path: project_path.into(),
            project_name: DEFAULT_PROJECT_NAME.to_string(),
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            skip_self_update: true,
            api_key: None,
            timeout: None,
        }
    }

    /// Empty keys are treated the same as no key.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Running => "running",
            ScanState::Completed => "completed",
            ScanState::Failed => "failed",
            ScanState::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Failed | ScanState::Cancelled
        )
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub exit_code: i32,
    pub report_path: PathBuf,
}

impl ScanResult {
    pub fn state(&self) -> ScanState {
        if self.exit_code == 0 {
            ScanState::Completed
        } else {
            ScanState::Failed
        }
    }
}
