use std::io::{self, Write};
use std::time::Duration;

use anyhow::Error;
use indicatif::{ProgressBar, ProgressDrawTarget};
use unicode_width::UnicodeWidthChar;

use crate::core::{OutputChunk, OutputStream, Report, ReportSummary, ScanState};
use crate::scan::{ScanCommand, ScanObserver};
use crate::update::{UpdateObserver, UpdateOutcome, UpdateStep};

#[derive(Debug, Clone)]
pub struct UiConfig {
    pub color: bool,
    pub stderr_is_tty: bool,
    pub quiet: bool,
    pub verbose: bool,
    /// Keep stdout clean for machine-readable output.
    pub json: bool,
}

impl UiConfig {
    pub fn show_progress(&self) -> bool {
        self.stderr_is_tty && !self.quiet && !self.json
    }
}

pub fn eprintln_error(err: &Error) {
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "error:");
    let _ = writeln!(stderr, "  {err}");

    let mut causes = err.chain().skip(1).peekable();
    if causes.peek().is_some() {
        let _ = writeln!(stderr, "caused by:");
        for cause in causes {
            let _ = writeln!(stderr, "  - {cause}");
        }
    }

    let _ = writeln!(stderr, "next:");
    let _ = writeln!(
        stderr,
        "  - re-run with `--verbose` to see the command line and log file"
    );
    let _ = writeln!(
        stderr,
        "  - see `depcheck-runner --help` for commands and options"
    );
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Streams scan output to the terminal while a spinner counts lines.
pub struct ScanConsole<'a> {
    cfg: &'a UiConfig,
    pb: Option<ProgressBar>,
    lines: u64,
}

impl<'a> ScanConsole<'a> {
    pub fn new(cfg: &'a UiConfig) -> Self {
        Self {
            cfg,
            pb: None,
            lines: 0,
        }
    }

    fn write_chunk(&self, chunk: &OutputChunk) {
        if self.cfg.quiet {
            return;
        }
        let res = if chunk.stream == OutputStream::Stdout && !self.cfg.json {
            let mut out = io::stdout().lock();
            out.write_all(chunk.text.as_bytes()).and_then(|()| out.flush())
        } else {
            let mut err = io::stderr().lock();
            err.write_all(chunk.text.as_bytes()).and_then(|()| err.flush())
        };
        let _ = res;
    }
}

impl ScanObserver for ScanConsole<'_> {
    fn on_start(&mut self, command: &ScanCommand) {
        if self.cfg.verbose {
            eprintln!("running: {}", command.redacted_command_line());
        }
        if self.cfg.show_progress() {
            self.pb = Some(spinner("scanning...".to_string()));
        }
    }

    fn on_output(&mut self, chunk: &OutputChunk) {
        self.lines = self.lines.saturating_add(1);
        match &self.pb {
            Some(pb) => {
                pb.suspend(|| self.write_chunk(chunk));
                pb.set_message(format!("scanning... ({} lines)", self.lines));
            }
            None => self.write_chunk(chunk),
        }
    }

    fn on_state(&mut self, state: ScanState) {
        if !state.is_terminal() {
            return;
        }
        if let Some(pb) = self.pb.take() {
            pb.finish_and_clear();
        }
        if self.cfg.quiet {
            return;
        }
        match state {
            ScanState::Completed => eprintln!("Dependency-Check finished successfully."),
            ScanState::Failed => eprintln!("Dependency-Check failed."),
            ScanState::Cancelled => eprintln!("Scan cancelled."),
            ScanState::Idle | ScanState::Running => {}
        }
    }
}

pub struct UpdateConsole<'a> {
    cfg: &'a UiConfig,
    pb: Option<ProgressBar>,
}

impl<'a> UpdateConsole<'a> {
    pub fn new(cfg: &'a UiConfig) -> Self {
        Self { cfg, pb: None }
    }

    pub fn finish(&mut self) {
        if let Some(pb) = self.pb.take() {
            pb.finish_and_clear();
        }
    }
}

impl UpdateObserver for UpdateConsole<'_> {
    fn on_status(&mut self, step: UpdateStep, message: &str) {
        if self.cfg.quiet {
            return;
        }
        let line = format!("[{step}] {message}");
        if self.cfg.show_progress() {
            let pb = self.pb.get_or_insert_with(|| spinner(String::new()));
            pb.set_message(format!("{step}..."));
            pb.suspend(|| eprintln!("{line}"));
        } else if self.cfg.json {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
}

impl Drop for UpdateConsole<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

pub fn print_update_outcome(outcome: &UpdateOutcome, cfg: &UiConfig) {
    if cfg.quiet {
        return;
    }
    let mut out = io::stdout().lock();
    let _ = writeln!(
        out,
        "Installed Dependency-Check {} into {} ({} downloaded, {} entries)",
        outcome.plan.latest_version,
        outcome.plan.install_dir.display(),
        format_bytes(outcome.downloaded_bytes),
        outcome.extracted_entries
    );
    if let Some(warning) = &outcome.cleanup_warning {
        let _ = writeln!(out, "warning: {warning}");
    }
}

pub fn print_report(report: &Report, cfg: &UiConfig) {
    if cfg.quiet {
        return;
    }
    let summary = report.summary();
    let mut out = io::stdout().lock();
    write_summary(&mut out, &summary, cfg.color);
}

pub fn write_summary(out: &mut dyn Write, summary: &ReportSummary, color: bool) {
    let _ = writeln!(out, "Report:");
    if let Some(name) = &summary.project_name {
        let _ = writeln!(out, "  project: {name}");
    }
    if let Some(version) = &summary.engine_version {
        let _ = writeln!(out, "  engine: {version}");
    }
    let _ = writeln!(out, "  dependencies: {}", summary.dependency_count);
    let _ = writeln!(
        out,
        "  vulnerable dependencies: {}",
        summary.vulnerable_dependency_count
    );
    let _ = writeln!(out, "  vulnerabilities: {}", summary.vulnerability_count);

    if summary.by_severity.is_empty() {
        return;
    }
    let sev_w = summary
        .by_severity
        .iter()
        .map(|s| visible_width_ansi(&s.severity))
        .max()
        .unwrap_or(0)
        .max("SEVERITY".len());
    let _ = writeln!(out);
    let _ = writeln!(out, "  {}  COUNT", pad_end_ansi("SEVERITY", sev_w));
    for row in &summary.by_severity {
        let sev = pad_end_ansi(&format_severity(&row.severity, color), sev_w);
        let _ = writeln!(out, "  {sev}  {}", row.count);
    }
}

pub fn write_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let buf = serde_json::to_vec_pretty(value)?;

    let mut stdout = io::stdout().lock();
    match stdout.write_all(&buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
        Err(err) => return Err(err.into()),
    }
    match stdout.write_all(b"\n") {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn format_severity(severity: &str, color: bool) -> String {
    if !color {
        return severity.to_string();
    }
    let code = match severity {
        "CRITICAL" => "35",
        "HIGH" => "31",
        "MEDIUM" | "MODERATE" => "33",
        "LOW" => "32",
        _ => "90",
    };
    format!("\x1b[{code}m{severity}\x1b[0m")
}

fn pad_end_ansi(s: &str, width: usize) -> String {
    let w = visible_width_ansi(s);
    if w >= width {
        return s.to_string();
    }
    format!("{s}{}", " ".repeat(width - w))
}

fn visible_width_ansi(s: &str) -> usize {
    let mut width: usize = 0;
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' && chars.peek() == Some(&'[') {
            let _ = chars.next();
            for ch2 in chars.by_ref() {
                if ch2 == 'm' {
                    break;
                }
            }
            continue;
        }
        width = width.saturating_add(UnicodeWidthChar::width(ch).unwrap_or(0));
    }
    width
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let b = bytes as f64;
    if b < KB {
        return format!("{bytes} B");
    }
    if b < MB {
        return format!("{:.1} KiB", b / KB);
    }
    if b < GB {
        return format!("{:.1} MiB", b / MB);
    }
    format!("{:.1} GiB", b / GB)
}
