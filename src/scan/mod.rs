use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use wait_timeout::ChildExt;

use crate::core::{OutputChunk, OutputStream, ScanConfig, ScanResult, ScanState};
use crate::platform;

pub const CANCEL_MARKER: &str = "\n[scan cancelled]\n";
pub const TIMEOUT_MARKER: &str = "\n[scan timed out]\n";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const READER_GRACE: Duration = Duration::from_secs(2);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid scan configuration: {0}")]
    InvalidConfig(String),
    #[error("dependency-check executable not found: {}", path.display())]
    ExecutableNotFound { path: PathBuf },
    #[error("a scan is already running")]
    AlreadyRunning,
    #[error("failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed while waiting for dependency-check: {0}")]
    Wait(#[source] std::io::Error),
    #[error("dependency-check exited with code {exit_code}")]
    ProcessFailed { exit_code: i32 },
    #[error("scan was cancelled")]
    Cancelled,
    #[error("scan timed out after {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ScanArg {
    flag: &'static str,
    value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCommand {
    program: PathBuf,
    options: Vec<ScanArg>,
}

impl ScanCommand {
    pub fn build(config: &ScanConfig) -> Self {
        let project = config.project_path.display().to_string();
        let mut options = vec![
            ScanArg::value("--project", config.project_name.clone()),
            ScanArg::value("--scan", project.clone()),
            ScanArg::value("--out", project),
            ScanArg::value("--format", config.output_format.clone()),
        ];
        if config.skip_self_update {
            options.push(ScanArg::flag("--noupdate"));
        }
        if let Some(key) = config.api_key() {
            options.push(ScanArg::value("--nvdApiKey", key.to_string()));
        }
        options.push(ScanArg::flag("--prettyPrint"));

        Self {
            program: platform::executable_path(&config.install_dir),
            options,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.options.len() * 2);
        for opt in &self.options {
            args.push(opt.flag.to_string());
            if let Some(value) = &opt.value {
                args.push(value.clone());
            }
        }
        args
    }

    /// Shell-style rendering with every value quoted, as shown to the user.
    pub fn command_line(&self) -> String {
        let mut line = quote(&self.program.display().to_string());
        for opt in &self.options {
            line.push(' ');
            line.push_str(opt.flag);
            if let Some(value) = &opt.value {
                line.push(' ');
                line.push_str(&quote(value));
            }
        }
        line
    }

    /// Same as `command_line` with the API key value replaced.
    pub fn redacted_command_line(&self) -> String {
        let redacted = Self {
            program: self.program.clone(),
            options: self
                .options
                .iter()
                .map(|opt| {
                    if opt.flag == "--nvdApiKey" {
                        ScanArg::value(opt.flag, "***".to_string())
                    } else {
                        opt.clone()
                    }
                })
                .collect(),
        };
        redacted.command_line()
    }
}

impl ScanArg {
    fn flag(flag: &'static str) -> Self {
        Self { flag, value: None }
    }

    fn value(flag: &'static str, value: String) -> Self {
        Self {
            flag,
            value: Some(value),
        }
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\\\""))
}

/// Formats that make the tool write `dependency-check-report.json`.
pub const JSON_REPORT_FORMATS: &[&str] = &["JSON", "ALL"];

pub fn validate_output_format(format: &str) -> Result<(), ScanError> {
    let format = format.trim();
    if format.is_empty() {
        return Err(ScanError::InvalidConfig("output format is empty".to_string()));
    }
    if !JSON_REPORT_FORMATS
        .iter()
        .any(|f| f.eq_ignore_ascii_case(format))
    {
        return Err(ScanError::InvalidConfig(format!(
            "output format {format} does not produce the JSON report (use {})",
            JSON_REPORT_FORMATS.join(" or ")
        )));
    }
    Ok(())
}

pub fn validate_config(config: &ScanConfig) -> Result<(), ScanError> {
    for (name, path) in [
        ("install directory", &config.install_dir),
        ("project path", &config.project_path),
    ] {
        if path.as_os_str().is_empty() {
            return Err(ScanError::InvalidConfig(format!("{name} is empty")));
        }
        if !path.is_dir() {
            return Err(ScanError::InvalidConfig(format!(
                "{name} does not exist: {}",
                path.display()
            )));
        }
    }
    validate_output_format(&config.output_format)?;

    let exe = platform::executable_path(&config.install_dir);
    if !exe.is_file() {
        return Err(ScanError::ExecutableNotFound { path: exe });
    }
    Ok(())
}

/// Receives everything a running scan produces, in order.
pub trait ScanObserver {
    fn on_start(&mut self, _command: &ScanCommand) {}
    fn on_output(&mut self, _chunk: &OutputChunk) {}
    fn on_state(&mut self, _state: ScanState) {}
}

impl ScanObserver for () {}

#[derive(Debug)]
struct Progress {
    state: ScanState,
    output: String,
}

/// One invocation of the external tool. Shared by handle between the runner
/// and anything that displays it; readers may see partial output.
#[derive(Debug)]
pub struct ScanExecution {
    command: ScanCommand,
    progress: Mutex<Progress>,
    child: Mutex<Option<Child>>,
}

impl ScanExecution {
    fn new(command: ScanCommand, child: Child) -> Self {
        Self {
            command,
            progress: Mutex::new(Progress {
                state: ScanState::Running,
                output: String::new(),
            }),
            child: Mutex::new(Some(child)),
        }
    }

    pub fn command(&self) -> &ScanCommand {
        &self.command
    }

    pub fn state(&self) -> ScanState {
        self.progress().state
    }

    pub fn output(&self) -> String {
        self.progress().output.clone()
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn child(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records output while the scan is running. Once a terminal state is
    /// set the output is frozen and late chunks are dropped.
    fn append(&self, text: &str) -> bool {
        let mut progress = self.progress();
        if progress.state != ScanState::Running {
            return false;
        }
        progress.output.push_str(text);
        true
    }

    fn cancel(&self) -> bool {
        let mut progress = self.progress();
        if progress.state != ScanState::Running {
            return false;
        }
        if let Some(child) = self.child().as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                platform::terminate(child);
            }
        }
        progress.state = ScanState::Cancelled;
        progress.output.push_str(CANCEL_MARKER);
        true
    }

    /// Moves a running execution to its terminal state. Returns the state
    /// that actually holds, which is `Cancelled` if cancellation won the race.
    fn finish(&self, state: ScanState, marker: Option<&str>) -> ScanState {
        let mut progress = self.progress();
        if progress.state == ScanState::Running {
            progress.state = state;
            if let Some(marker) = marker {
                progress.output.push_str(marker);
            }
        }
        progress.state
    }

    fn try_exit_code(&self) -> Result<Option<i32>, ScanError> {
        let mut guard = self.child();
        let Some(child) = guard.as_mut() else {
            return Ok(None);
        };
        let status = child.try_wait().map_err(ScanError::Wait)?;
        Ok(status.map(|s| s.code().unwrap_or(-1)))
    }

    fn wait_exit_code(&self, timeout: Duration) -> Result<Option<i32>, ScanError> {
        let mut guard = self.child();
        let Some(child) = guard.as_mut() else {
            return Ok(None);
        };
        let status = child.wait_timeout(timeout).map_err(ScanError::Wait)?;
        Ok(status.map(|s| s.code().unwrap_or(-1)))
    }

    /// Waits briefly for a terminated child, then kills it and reaps.
    fn reap(&self) {
        let mut guard = self.child();
        if let Some(mut child) = guard.take() {
            if !matches!(child.wait_timeout(TERMINATE_GRACE), Ok(Some(_))) {
                platform::kill(&mut child);
                let _ = child.wait();
            }
        }
    }
}

/// Runs at most one scan at a time. Cloning yields another handle to the
/// same runner, so a signal handler can hold one for `cancel`.
#[derive(Debug, Clone, Default)]
pub struct ScanRunner {
    current: Arc<Mutex<Option<Arc<ScanExecution>>>>,
}

impl ScanRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<ScanExecution>> {
        self.slot().clone()
    }

    pub fn is_running(&self) -> bool {
        self.current()
            .map(|e| e.state() == ScanState::Running)
            .unwrap_or(false)
    }

    /// Cancels the running scan, if any. Never fails; returns whether a
    /// running scan was actually cancelled.
    pub fn cancel(&self) -> bool {
        match self.current() {
            Some(execution) => execution.cancel(),
            None => false,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<ScanExecution>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn run(
        &self,
        config: &ScanConfig,
        observer: &mut dyn ScanObserver,
    ) -> Result<ScanResult, ScanError> {
        validate_config(config)?;
        let command = ScanCommand::build(config);

        let (execution, rx) = {
            let mut slot = self.slot();
            if let Some(current) = slot.as_ref() {
                if current.state() == ScanState::Running {
                    return Err(ScanError::AlreadyRunning);
                }
            }

            let mut child = platform::spawn_piped(command.program(), &command.args()).map_err(
                |source| ScanError::Spawn {
                    program: command.program().to_path_buf(),
                    source,
                },
            )?;
            let (tx, rx) = mpsc::channel();
            if let Some(out) = child.stdout.take() {
                spawn_reader(out, OutputStream::Stdout, tx.clone());
            }
            if let Some(err) = child.stderr.take() {
                spawn_reader(err, OutputStream::Stderr, tx);
            }

            let execution = Arc::new(ScanExecution::new(command, child));
            *slot = Some(Arc::clone(&execution));
            (execution, rx)
        };

        observer.on_start(execution.command());
        observer.on_state(ScanState::Running);

        let exit_code = match pump(&execution, &rx, config.timeout, observer) {
            Ok(code) => code,
            Err(err) => {
                execution.reap();
                if matches!(err, ScanError::Cancelled) {
                    observer.on_state(ScanState::Cancelled);
                } else {
                    observer.on_state(execution.finish(ScanState::Failed, None));
                }
                return Err(err);
            }
        };
        execution.reap();

        let result = ScanResult {
            exit_code,
            report_path: crate::report::default_report_path(&config.project_path),
        };
        let state = execution.finish(result.state(), None);
        observer.on_state(state);
        if state == ScanState::Cancelled {
            return Err(ScanError::Cancelled);
        }
        Ok(result)
    }
}

fn spawn_reader<R>(pipe: R, stream: OutputStream, tx: Sender<OutputChunk>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let chunk = OutputChunk {
                        stream,
                        text: String::from_utf8_lossy(&buf).into_owned(),
                    };
                    if tx.send(chunk).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Forwards output until the child has exited and both pipes are drained.
fn pump(
    execution: &ScanExecution,
    rx: &Receiver<OutputChunk>,
    timeout: Option<Duration>,
    observer: &mut dyn ScanObserver,
) -> Result<i32, ScanError> {
    let started = Instant::now();
    let mut readers_done = false;
    let mut exit: Option<(i32, Instant)> = None;

    loop {
        if readers_done {
            if exit.is_none() {
                if let Some(code) = execution.wait_exit_code(POLL_INTERVAL)? {
                    exit = Some((code, Instant::now()));
                }
            }
        } else {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => forward(execution, observer, &chunk),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => readers_done = true,
            }
        }

        // Checked on every pass: a chatty child must not starve cancel or timeout.
        if execution.state() == ScanState::Cancelled {
            return Err(ScanError::Cancelled);
        }

        if exit.is_none() {
            if let Some(code) = execution.try_exit_code()? {
                exit = Some((code, Instant::now()));
            }
        }

        match exit {
            Some((code, exited_at)) => {
                if readers_done || exited_at.elapsed() >= READER_GRACE {
                    while let Ok(chunk) = rx.try_recv() {
                        forward(execution, observer, &chunk);
                    }
                    return Ok(code);
                }
            }
            None => {
                if let Some(limit) = timeout {
                    if started.elapsed() >= limit {
                        if let Some(child) = execution.child().as_mut() {
                            platform::terminate(child);
                        }
                        if execution.finish(ScanState::Failed, Some(TIMEOUT_MARKER))
                            == ScanState::Cancelled
                        {
                            return Err(ScanError::Cancelled);
                        }
                        return Err(ScanError::TimedOut(limit));
                    }
                }
            }
        }
    }
}

fn forward(execution: &ScanExecution, observer: &mut dyn ScanObserver, chunk: &OutputChunk) {
    if execution.append(&chunk.text) {
        observer.on_output(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_key(key: Option<&str>, skip_self_update: bool) -> ScanConfig {
        let mut cfg = ScanConfig::new("/opt/dc", "/repo");
        cfg.skip_self_update = skip_self_update;
        cfg.api_key = key.map(|k| k.to_string());
        cfg
    }

    #[test]
    fn command_line_has_fixed_flag_order() {
        let cmd = ScanCommand::build(&config_with_key(None, true));
        let line = cmd.command_line();
        let exe = platform::executable_path(Path::new("/opt/dc"));
        assert_eq!(
            line,
            format!(
                "\"{}\" --project \"Dependency Check\" --scan \"/repo\" --out \"/repo\" --format \"JSON\" --noupdate --prettyPrint",
                exe.display()
            )
        );
    }

    #[test]
    fn skip_self_update_without_key_adds_noupdate_only() {
        let cmd = ScanCommand::build(&config_with_key(None, true));
        let args = cmd.args();
        assert!(args.iter().any(|a| a == "--noupdate"));
        assert!(!args.iter().any(|a| a == "--nvdApiKey"));
    }

    #[test]
    fn self_update_allowed_omits_noupdate() {
        let cmd = ScanCommand::build(&config_with_key(None, false));
        assert!(!cmd.args().iter().any(|a| a == "--noupdate"));
    }

    #[test]
    fn api_key_appears_once_and_quoted() {
        for key in ["abc-123", "with space", "quo\"te"] {
            let cmd = ScanCommand::build(&config_with_key(Some(key), true));
            let line = cmd.command_line();
            let token = format!("--nvdApiKey {}", quote(key));
            assert_eq!(line.matches("--nvdApiKey").count(), 1, "line={line}");
            assert!(line.contains(&token), "line={line}");
            assert!(line.ends_with("--prettyPrint"), "line={line}");

            let args = cmd.args();
            let idx = args
                .iter()
                .position(|a| a == "--nvdApiKey")
                .expect("flag present");
            assert_eq!(args[idx + 1], key);
        }
    }

    #[test]
    fn blank_api_key_is_ignored() {
        let cmd = ScanCommand::build(&config_with_key(Some("  "), true));
        assert!(!cmd.command_line().contains("--nvdApiKey"));
    }

    #[test]
    fn redacted_line_hides_key() {
        let cmd = ScanCommand::build(&config_with_key(Some("secret"), true));
        let line = cmd.redacted_command_line();
        assert!(!line.contains("secret"));
        assert!(line.contains("--nvdApiKey \"***\""));
    }

    #[test]
    fn format_is_specified_once() {
        let mut cfg = config_with_key(None, true);
        cfg.output_format = "ALL".to_string();
        let line = ScanCommand::build(&cfg).command_line();
        assert_eq!(line.matches("--format").count(), 1);
        assert!(line.contains("--format \"ALL\""));
    }

    #[test]
    fn only_formats_with_a_json_report_are_accepted() {
        for ok in ["JSON", "json", " All "] {
            assert!(validate_output_format(ok).is_ok(), "{ok}");
        }
        for bad in ["HTML", "XML", "CSV", "SARIF", ""] {
            assert!(
                matches!(validate_output_format(bad), Err(ScanError::InvalidConfig(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn missing_project_is_rejected_before_spawn() {
        let cfg = ScanConfig::new("", "/definitely/not/here");
        assert!(matches!(
            validate_config(&cfg),
            Err(ScanError::InvalidConfig(_))
        ));
    }

    #[test]
    fn cancel_without_scan_is_noop() {
        let runner = ScanRunner::new();
        assert!(!runner.cancel());
        assert!(!runner.is_running());
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::atomic::{AtomicU64, Ordering};

        struct Fixture {
            root: PathBuf,
            config: ScanConfig,
        }

        impl Drop for Fixture {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.root);
            }
        }

        fn fixture(script: &str) -> Fixture {
            static SEQ: AtomicU64 = AtomicU64::new(0);
            let seq = SEQ.fetch_add(1, Ordering::Relaxed);
            let root = std::env::temp_dir().join(format!(
                "depcheck-scan-test-{}-{seq}",
                std::process::id()
            ));
            let _ = std::fs::remove_dir_all(&root);
            let install = root.join("install");
            let project = root.join("project");
            std::fs::create_dir_all(&project).expect("mkdir project");
            let exe = platform::executable_path(&install);
            std::fs::create_dir_all(exe.parent().expect("parent")).expect("mkdir bin");
            std::fs::write(&exe, script).expect("write script");
            let mut perms = std::fs::metadata(&exe).expect("metadata").permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&exe, perms).expect("chmod");

            Fixture {
                config: ScanConfig::new(install, project),
                root,
            }
        }

        #[derive(Default)]
        struct Recorder {
            chunks: Vec<OutputChunk>,
            states: Vec<ScanState>,
            late_chunks: usize,
        }

        impl ScanObserver for Recorder {
            fn on_output(&mut self, chunk: &OutputChunk) {
                if self.states.last().is_some_and(|s| s.is_terminal()) {
                    self.late_chunks += 1;
                }
                self.chunks.push(chunk.clone());
            }

            fn on_state(&mut self, state: ScanState) {
                self.states.push(state);
            }
        }

        #[test]
        fn streams_both_channels_in_order() {
            let fx = fixture("#!/bin/sh\necho one\necho two\necho err1 >&2\necho three\nexit 0\n");
            let runner = ScanRunner::new();
            let mut rec = Recorder::default();
            let result = runner.run(&fx.config, &mut rec).expect("run");

            assert_eq!(result.exit_code, 0);
            assert_eq!(result.state(), ScanState::Completed);
            let stdout: Vec<&str> = rec
                .chunks
                .iter()
                .filter(|c| c.stream == OutputStream::Stdout)
                .map(|c| c.text.as_str())
                .collect();
            assert_eq!(stdout, vec!["one\n", "two\n", "three\n"]);
            assert!(
                rec.chunks
                    .iter()
                    .any(|c| c.stream == OutputStream::Stderr && c.text == "err1\n")
            );
            assert_eq!(rec.states, vec![ScanState::Running, ScanState::Completed]);

            let execution = runner.current().expect("execution");
            assert_eq!(execution.state(), ScanState::Completed);
            let output = execution.output();
            assert!(output.contains("one\n") && output.contains("err1\n"));
        }

        #[test]
        fn passes_arguments_without_shell() {
            let fx = fixture("#!/bin/sh\nfor a in \"$@\"; do echo \"[$a]\"; done\n");
            let mut cfg = fx.config.clone();
            cfg.api_key = Some("k e y".to_string());
            let runner = ScanRunner::new();
            let mut rec = Recorder::default();
            runner.run(&cfg, &mut rec).expect("run");

            let lines: Vec<&str> = rec.chunks.iter().map(|c| c.text.trim_end()).collect();
            assert!(lines.contains(&"[--nvdApiKey]"), "lines={lines:?}");
            assert!(lines.contains(&"[k e y]"), "lines={lines:?}");
            assert_eq!(lines.last(), Some(&"[--prettyPrint]"));
        }

        #[test]
        fn non_zero_exit_is_failed() {
            let fx = fixture("#!/bin/sh\necho boom >&2\nexit 3\n");
            let runner = ScanRunner::new();
            let mut rec = Recorder::default();
            let result = runner.run(&fx.config, &mut rec).expect("run");
            assert_eq!(result.exit_code, 3);
            assert_eq!(rec.states.last(), Some(&ScanState::Failed));
            assert_eq!(
                runner.current().expect("execution").state(),
                ScanState::Failed
            );
        }

        #[test]
        fn missing_executable_spawns_nothing() {
            let fx = fixture("#!/bin/sh\nexit 0\n");
            let mut cfg = fx.config.clone();
            cfg.install_dir = fx.root.clone();
            let runner = ScanRunner::new();
            let err = runner.run(&cfg, &mut ()).expect_err("should fail");
            assert!(matches!(err, ScanError::ExecutableNotFound { .. }));
            assert!(runner.current().is_none());
        }

        #[test]
        fn second_run_while_running_is_rejected() {
            let fx = fixture("#!/bin/sh\necho started\nsleep 30\n");
            let runner = ScanRunner::new();
            let background = runner.clone();
            let cfg = fx.config.clone();
            let handle = thread::spawn(move || background.run(&cfg, &mut ()));

            let deadline = Instant::now() + Duration::from_secs(5);
            while !runner.is_running() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            assert!(runner.is_running());
            let first = runner.current().expect("execution");

            let err = runner.run(&fx.config, &mut ()).expect_err("should reject");
            assert!(matches!(err, ScanError::AlreadyRunning));
            assert!(Arc::ptr_eq(&first, &runner.current().expect("execution")));

            assert!(runner.cancel());
            let outcome = handle.join().expect("join");
            assert!(matches!(outcome, Err(ScanError::Cancelled)));
        }

        #[test]
        fn cancel_ends_in_cancelled_state_with_marker() {
            let fx = fixture("#!/bin/sh\necho started\nsleep 30\necho never\n");
            let runner = ScanRunner::new();
            let background = runner.clone();
            let cfg = fx.config.clone();
            let handle = thread::spawn(move || {
                let mut rec = Recorder::default();
                let outcome = background.run(&cfg, &mut rec);
                (outcome, rec)
            });

            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let started = runner
                    .current()
                    .map(|e| e.output().contains("started"))
                    .unwrap_or(false);
                if started || Instant::now() >= deadline {
                    break;
                }
                thread::sleep(Duration::from_millis(20));
            }

            assert!(runner.cancel());
            let execution = runner.current().expect("execution");
            assert_eq!(execution.state(), ScanState::Cancelled);

            let (outcome, rec) = handle.join().expect("join");
            assert!(matches!(outcome, Err(ScanError::Cancelled)));
            assert_eq!(rec.states.last(), Some(&ScanState::Cancelled));
            assert!(!rec.states.contains(&ScanState::Completed));
            assert!(!rec.states.contains(&ScanState::Failed));
            assert!(execution.output().ends_with(CANCEL_MARKER));
            assert!(!execution.output().contains("never"));

            assert!(!runner.cancel(), "second cancel is a no-op");
        }

        #[test]
        fn timeout_terminates_the_process() {
            let fx = fixture("#!/bin/sh\nsleep 30\n");
            let mut cfg = fx.config.clone();
            cfg.timeout = Some(Duration::from_millis(300));
            let runner = ScanRunner::new();
            let started = Instant::now();
            let err = runner.run(&cfg, &mut ()).expect_err("should time out");
            assert!(matches!(err, ScanError::TimedOut(_)));
            assert!(started.elapsed() < Duration::from_secs(10));
            let execution = runner.current().expect("execution");
            assert_eq!(execution.state(), ScanState::Failed);
            assert!(execution.output().ends_with(TIMEOUT_MARKER));
        }

        const CHATTY: &str = "while :; do echo tick; sleep 0.02; done\n";

        fn cancel_once_output_starts(runner: &ScanRunner) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                let started = runner
                    .current()
                    .map(|e| e.output().contains("tick"))
                    .unwrap_or(false);
                if started {
                    break;
                }
                thread::sleep(Duration::from_millis(20));
            }
            thread::sleep(Duration::from_millis(300));
            assert!(runner.cancel());
        }

        #[test]
        fn timeout_fires_while_child_keeps_printing() {
            let fx = fixture(&format!("#!/bin/sh\n{CHATTY}"));
            let mut cfg = fx.config.clone();
            cfg.timeout = Some(Duration::from_millis(500));
            let runner = ScanRunner::new();
            let started = Instant::now();
            let mut rec = Recorder::default();
            let err = runner.run(&cfg, &mut rec).expect_err("should time out");

            assert!(matches!(err, ScanError::TimedOut(_)), "err={err:?}");
            assert!(started.elapsed() < Duration::from_secs(10));
            let execution = runner.current().expect("execution");
            assert_eq!(execution.state(), ScanState::Failed);
            assert!(execution.output().contains("tick"));
            assert!(execution.output().ends_with(TIMEOUT_MARKER));
            assert_eq!(rec.late_chunks, 0);
        }

        #[test]
        fn output_after_cancel_is_dropped() {
            let fx = fixture(&format!(
                "#!/bin/sh\ntrap 'echo shutting down; echo bye; exit 143' TERM\n{CHATTY}"
            ));
            let runner = ScanRunner::new();
            let background = runner.clone();
            let cfg = fx.config.clone();
            let handle = thread::spawn(move || {
                let mut rec = Recorder::default();
                let outcome = background.run(&cfg, &mut rec);
                (outcome, rec)
            });

            cancel_once_output_starts(&runner);
            let (outcome, rec) = handle.join().expect("join");

            assert!(matches!(outcome, Err(ScanError::Cancelled)));
            assert_eq!(rec.states.last(), Some(&ScanState::Cancelled));
            assert_eq!(rec.late_chunks, 0);
            assert!(!rec.chunks.iter().any(|c| c.text.contains("bye")));
            let execution = runner.current().expect("execution");
            assert!(execution.output().ends_with(CANCEL_MARKER));
            assert!(!execution.output().contains("shutting down"));
        }

        #[test]
        fn child_ignoring_term_is_killed_after_grace() {
            let fx = fixture(&format!("#!/bin/sh\ntrap '' TERM\n{CHATTY}"));
            let runner = ScanRunner::new();
            let background = runner.clone();
            let cfg = fx.config.clone();
            let handle = thread::spawn(move || {
                let started = Instant::now();
                let outcome = background.run(&cfg, &mut ());
                (outcome, started.elapsed())
            });

            cancel_once_output_starts(&runner);
            let (outcome, elapsed) = handle.join().expect("join");

            assert!(matches!(outcome, Err(ScanError::Cancelled)));
            assert!(
                elapsed < TERMINATE_GRACE + Duration::from_secs(10),
                "elapsed={elapsed:?}"
            );
            assert!(
                runner
                    .current()
                    .expect("execution")
                    .output()
                    .ends_with(CANCEL_MARKER)
            );
        }

        #[test]
        fn runner_accepts_new_run_after_completion() {
            let fx = fixture("#!/bin/sh\nexit 0\n");
            let runner = ScanRunner::new();
            runner.run(&fx.config, &mut ()).expect("first");
            runner.run(&fx.config, &mut ()).expect("second");
        }
    }
}
