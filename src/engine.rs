use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use time::OffsetDateTime;

use crate::core::{OutputChunk, Report, ScanConfig, ScanResult, ScanState};
use crate::logs::{ScanRecord, UpdateRecord};
use crate::report::{self, Readiness, ReportError};
use crate::scan::{ScanCommand, ScanError, ScanObserver, ScanRunner};
use crate::update::{
    HttpReleaseClient, ReleaseClient, UpdateObserver, UpdateOutcome, UpdateSettings, UpdateStep,
    Updater,
};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Connect timeout and the budget for small requests.
    pub http_timeout: Duration,
    /// Budget for the whole release archive download.
    pub download_timeout: Duration,
    pub readiness: Readiness,
    pub write_logs: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(3600),
            readiness: Readiness::default(),
            write_logs: true,
        }
    }
}

/// Coordinates a scan, the report it produces, and tool updates.
#[derive(Clone)]
pub struct Engine {
    opts: EngineOptions,
    home_dir: PathBuf,
    runner: ScanRunner,
}

#[derive(Debug)]
pub struct ScanOutcome {
    pub result: ScanResult,
    pub report: Report,
    pub log_path: Option<PathBuf>,
}

impl Engine {
    pub fn new(opts: EngineOptions, home_dir: PathBuf) -> Self {
        Self {
            opts,
            home_dir,
            runner: ScanRunner::new(),
        }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    /// Handle to the scan runner, e.g. for cancelling from a signal handler.
    pub fn runner(&self) -> &ScanRunner {
        &self.runner
    }

    /// Runs a scan and, only when it completes with exit code 0, loads the report.
    pub fn scan(&self, config: &ScanConfig, observer: &mut dyn ScanObserver) -> Result<ScanOutcome> {
        let started_at = OffsetDateTime::now_utc();
        let run = self.runner.run(config, observer);
        let finished_at = OffsetDateTime::now_utc();

        let command_line = ScanCommand::build(config).redacted_command_line();
        let (state, output) = match self.runner.current() {
            Some(execution) => (execution.state(), execution.output()),
            None => (ScanState::Idle, String::new()),
        };

        let outcome = match run {
            Ok(result) if result.exit_code != 0 => Err(ScanError::ProcessFailed {
                exit_code: result.exit_code,
            }
            .into()),
            Ok(result) => {
                report::wait_until_ready(&result.report_path, self.opts.readiness);
                match report::load(&result.report_path) {
                    Ok(report) => Ok((result, report)),
                    Err(err) => Err(anyhow::Error::new(err)),
                }
            }
            Err(err) => Err(anyhow::Error::new(err)),
        };

        let exit_code = match &outcome {
            Ok((result, _)) => Some(result.exit_code),
            Err(err) => err.downcast_ref::<ScanError>().and_then(|e| match e {
                ScanError::ProcessFailed { exit_code } => Some(*exit_code),
                _ => None,
            }),
        };
        let log_path = self.write_scan_log(ScanRecord {
            started_at,
            finished_at,
            state,
            project_path: &config.project_path,
            command_line: &command_line,
            exit_code,
            error: outcome.as_ref().err().map(|e| format!("{e:#}")),
            output: &output,
        });

        match outcome {
            Ok((result, report)) => Ok(ScanOutcome {
                result,
                report,
                log_path,
            }),
            Err(err) => match log_path {
                Some(path) => Err(err.context(format!(
                    "scan did not produce a report (log: {})",
                    crate::logs::mask_home(&path, &self.home_dir)
                ))),
                None => Err(err),
            },
        }
    }

    pub fn load_report(&self, path: &Path) -> Result<Report, ReportError> {
        report::load(path)
    }

    pub fn updater(&self, settings: UpdateSettings) -> Result<Updater<HttpReleaseClient>> {
        let client = HttpReleaseClient::new(self.opts.http_timeout, self.opts.download_timeout)
            .context("failed to build the HTTP client")?;
        Ok(Updater::new(client, settings))
    }

    pub fn update<C: ReleaseClient>(
        &self,
        updater: &Updater<C>,
        install_dir: &Path,
        observer: &mut dyn UpdateObserver,
    ) -> Result<UpdateOutcome> {
        let started_at = OffsetDateTime::now_utc();
        let mut recorder = StepRecorder {
            inner: observer,
            steps: Vec::new(),
        };
        let res = updater.update(install_dir, &mut recorder);
        let finished_at = OffsetDateTime::now_utc();

        let version = match &res {
            Ok(outcome) => Some(outcome.plan.latest_version.clone()),
            Err(_) => None,
        };
        self.write_update_log(UpdateRecord {
            started_at,
            finished_at,
            install_dir,
            version: version.as_deref(),
            steps: &recorder.steps,
            warning: res
                .as_ref()
                .ok()
                .and_then(|o| o.cleanup_warning.as_ref())
                .map(|w| w.to_string()),
            error: res.as_ref().err().map(|e| e.to_string()),
        });

        Ok(res?)
    }

    fn write_scan_log(&self, record: ScanRecord<'_>) -> Option<PathBuf> {
        if !self.opts.write_logs {
            return None;
        }
        crate::logs::write_scan_log(&self.home_dir, &record).ok()
    }

    fn write_update_log(&self, record: UpdateRecord<'_>) -> Option<PathBuf> {
        if !self.opts.write_logs {
            return None;
        }
        crate::logs::write_update_log(&self.home_dir, &record).ok()
    }
}

struct StepRecorder<'a> {
    inner: &'a mut dyn UpdateObserver,
    steps: Vec<(UpdateStep, String)>,
}

impl UpdateObserver for StepRecorder<'_> {
    fn on_status(&mut self, step: UpdateStep, message: &str) {
        self.steps.push((step, message.to_string()));
        self.inner.on_status(step, message);
    }
}

/// Collects a scan's output in memory; handy for callers without a terminal.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    pub chunks: Vec<OutputChunk>,
    pub states: Vec<ScanState>,
}

impl ScanObserver for CollectingObserver {
    fn on_output(&mut self, chunk: &OutputChunk) {
        self.chunks.push(chunk.clone());
    }

    fn on_state(&mut self, state: ScanState) {
        self.states.push(state);
    }
}
