use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::ScanState;
use crate::update::UpdateStep;

const MAX_OUTPUT_BYTES: usize = 64 * 1024;

#[derive(Debug, Serialize)]
struct ScanLog {
    schema_version: &'static str,
    tool_version: String,
    command: &'static str,
    started_at: String,
    finished_at: String,
    status: String,
    project_path: String,
    command_line: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    output: String,
}

#[derive(Debug, Serialize)]
struct UpdateLog {
    schema_version: &'static str,
    tool_version: String,
    command: &'static str,
    started_at: String,
    finished_at: String,
    status: String,
    install_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    steps: Vec<UpdateStepLog>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct UpdateStepLog {
    step: &'static str,
    message: String,
}

/// What happened during one scan, as recorded on disk.
#[derive(Debug)]
pub struct ScanRecord<'a> {
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
    pub state: ScanState,
    pub project_path: &'a Path,
    pub command_line: &'a str,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub output: &'a str,
}

#[derive(Debug)]
pub struct UpdateRecord<'a> {
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
    pub install_dir: &'a Path,
    pub version: Option<&'a str>,
    pub steps: &'a [(UpdateStep, String)],
    pub warning: Option<String>,
    pub error: Option<String>,
}

pub fn logs_dir(home_dir: &Path) -> PathBuf {
    crate::config::config_dir(home_dir).join("logs")
}

pub fn write_scan_log(home_dir: &Path, record: &ScanRecord<'_>) -> Result<PathBuf> {
    let path = log_path(home_dir, "scan", record.finished_at)?;

    let status = if record.error.is_some() && !record.state.is_terminal() {
        "error".to_string()
    } else {
        record.state.to_string()
    };

    let log = ScanLog {
        schema_version: "1.0",
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        command: "scan",
        started_at: format_ts(record.started_at),
        finished_at: format_ts(record.finished_at),
        status,
        project_path: mask_home(record.project_path, home_dir),
        command_line: record.command_line.to_string(),
        exit_code: record.exit_code,
        error: record.error.clone(),
        output: truncate_string(record.output, MAX_OUTPUT_BYTES),
    };

    write_json(&path, &log)?;
    Ok(path)
}

pub fn write_update_log(home_dir: &Path, record: &UpdateRecord<'_>) -> Result<PathBuf> {
    let path = log_path(home_dir, "update", record.finished_at)?;

    let status = match (&record.error, &record.warning) {
        (Some(_), _) => "error",
        (None, Some(_)) => "ok_with_warning",
        (None, None) => "ok",
    };

    let log = UpdateLog {
        schema_version: "1.0",
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        command: "update",
        started_at: format_ts(record.started_at),
        finished_at: format_ts(record.finished_at),
        status: status.to_string(),
        install_dir: mask_home(record.install_dir, home_dir),
        version: record.version.map(|v| v.to_string()),
        steps: record
            .steps
            .iter()
            .map(|(step, message)| UpdateStepLog {
                step: step.as_str(),
                message: message.clone(),
            })
            .collect(),
        warning: record.warning.clone(),
        error: record.error.clone(),
    };

    write_json(&path, &log)?;
    Ok(path)
}

fn log_path(home_dir: &Path, kind: &str, finished_at: OffsetDateTime) -> Result<PathBuf> {
    let dir = logs_dir(home_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;

    let pid = std::process::id();
    let ts = finished_at.unix_timestamp_nanos();
    Ok(dir.join(format!("{kind}-{pid}-{ts}.json")))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_vec_pretty(value).context("failed to serialize log")?;
    buf.push(b'\n');
    std::fs::write(path, buf)
        .with_context(|| format!("failed to write log: {}", path.display()))
}

fn format_ts(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| "unknown".to_string())
}

pub fn mask_home(path: &Path, home_dir: &Path) -> String {
    let Ok(stripped) = path.strip_prefix(home_dir) else {
        return path.display().to_string();
    };
    let stripped = stripped.display().to_string();
    if stripped.is_empty() {
        "~".to_string()
    } else {
        format!("~/{stripped}")
    }
}

/// Keeps the tail: the end of the tool's output carries the interesting part.
fn truncate_string(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut idx = s.len() - max_bytes;
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    let tail = &s[idx..];
    format!("...(truncated, total={} bytes)\n{tail}", s.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn make_temp_home(tag: &str) -> PathBuf {
        static HOME_SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = HOME_SEQ.fetch_add(1, Ordering::Relaxed);
        let home = std::env::temp_dir().join(format!(
            "depcheck-log-{tag}-{}-{seq}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&home);
        std::fs::create_dir_all(&home).expect("create home");
        home
    }

    #[test]
    fn write_scan_log_records_status_and_masks_home() {
        let home = make_temp_home("scan");
        let project = home.join("work/app");
        let now = OffsetDateTime::now_utc();

        let path = write_scan_log(
            &home,
            &ScanRecord {
                started_at: now,
                finished_at: now,
                state: ScanState::Failed,
                project_path: &project,
                command_line: "\"dc.sh\" --project \"x\"",
                exit_code: Some(1),
                error: Some("dependency-check exited with code 1".to_string()),
                output: "line 1\nline 2\n",
            },
        )
        .expect("write log");

        assert!(path.starts_with(logs_dir(&home)));
        let v: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("parse");
        assert_eq!(v.get("command").and_then(|s| s.as_str()), Some("scan"));
        assert_eq!(v.get("status").and_then(|s| s.as_str()), Some("failed"));
        assert_eq!(v.get("exit_code").and_then(|s| s.as_i64()), Some(1));
        assert_eq!(
            v.get("project_path").and_then(|s| s.as_str()),
            Some("~/work/app")
        );
        assert!(
            v.get("output")
                .and_then(|s| s.as_str())
                .unwrap_or("")
                .contains("line 2")
        );

        let _ = std::fs::remove_dir_all(&home);
    }

    #[test]
    fn write_update_log_reports_warning_status() {
        let home = make_temp_home("update");
        let now = OffsetDateTime::now_utc();
        let steps = vec![
            (UpdateStep::ResolveVersion, "Latest version: 1.0.0".to_string()),
            (UpdateStep::Cleanup, "warning: failed to remove".to_string()),
        ];

        let path = write_update_log(
            &home,
            &UpdateRecord {
                started_at: now,
                finished_at: now,
                install_dir: Path::new("/opt/dc"),
                version: Some("1.0.0"),
                steps: &steps,
                warning: Some("failed to remove /opt/dc/dependency-check.zip".to_string()),
                error: None,
            },
        )
        .expect("write log");

        let v: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("parse");
        assert_eq!(
            v.get("status").and_then(|s| s.as_str()),
            Some("ok_with_warning")
        );
        assert_eq!(v.get("install_dir").and_then(|s| s.as_str()), Some("/opt/dc"));
        let steps = v.get("steps").and_then(|s| s.as_array()).expect("steps");
        assert_eq!(
            steps[0].get("step").and_then(|s| s.as_str()),
            Some("resolve-version")
        );

        let _ = std::fs::remove_dir_all(&home);
    }

    #[test]
    fn truncate_keeps_tail_on_char_boundary() {
        let s = "ééééé-end";
        let t = truncate_string(s, 6);
        assert!(t.ends_with("-end"), "{t}");
        assert!(t.starts_with("...(truncated, total="), "{t}");
    }
}
