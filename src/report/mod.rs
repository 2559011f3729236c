use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::core::Report;

pub const REPORT_FILE_NAME: &str = "dependency-check-report.json";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to read report {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse report {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
}

pub fn default_report_path(project_path: &Path) -> PathBuf {
    project_path.join(REPORT_FILE_NAME)
}

/// Reads and parses the JSON report written by the external tool.
pub fn load(report_path: &Path) -> Result<Report, ReportError> {
    let bytes = std::fs::read(report_path).map_err(|source| ReportError::Read {
        path: report_path.to_path_buf(),
        source,
    })?;
    parse(report_path, &bytes)
}

fn parse(report_path: &Path, bytes: &[u8]) -> Result<Report, ReportError> {
    serde_json::from_slice(bytes)
        .map(Report::new)
        .map_err(|e| ReportError::Parse {
            path: report_path.to_path_buf(),
            message: e.to_string(),
        })
}

#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_wait: Duration::from_secs(10),
        }
    }
}

/// Waits until `path` exists and its size is unchanged across two polls.
/// Returns false when `max_wait` elapses first.
pub fn wait_until_ready(path: &Path, readiness: Readiness) -> bool {
    let deadline = Instant::now() + readiness.max_wait;
    let mut last_len: Option<u64> = None;

    loop {
        let len = std::fs::metadata(path)
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len());
        if let (Some(prev), Some(len)) = (last_len, len) {
            if prev == len {
                return true;
            }
        }
        last_len = len;

        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(readiness.poll_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn make_temp_dir(tag: &str) -> PathBuf {
        static DIR_SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = DIR_SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "depcheck-report-{tag}-{}-{seq}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("create dir");
        dir
    }

    #[test]
    fn load_parses_object_written_by_serializer() {
        let dir = make_temp_dir("roundtrip");
        let path = default_report_path(&dir);
        let original = serde_json::json!({ "a": 1 });
        std::fs::write(&path, serde_json::to_vec(&original).expect("serialize")).expect("write");

        let report = load(&path).expect("load");
        assert_eq!(report.value(), &original);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_twice_yields_equal_reports() {
        let dir = make_temp_dir("idempotent");
        let path = default_report_path(&dir);
        std::fs::write(&path, br#"{"dependencies":[{"fileName":"x.jar"}]}"#).expect("write");

        let first = load(&path).expect("first load");
        let second = load(&path).expect("second load");
        assert_eq!(first, second);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_read_error() {
        let dir = make_temp_dir("missing");
        let err = load(&dir.join("nope.json")).expect_err("should fail");
        match err {
            ReportError::Read { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_json_is_parse_error_with_message() {
        let dir = make_temp_dir("malformed");
        let path = default_report_path(&dir);
        std::fs::write(&path, b"{\"dependencies\": [").expect("write");

        let err = load(&path).expect_err("should fail");
        let ReportError::Parse { message, .. } = &err else {
            panic!("unexpected error: {err:?}");
        };
        assert!(message.contains("EOF"), "message={message}");
        assert!(err.to_string().contains(message.as_str()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn any_json_value_is_accepted() {
        let dir = make_temp_dir("scalar");
        let path = default_report_path(&dir);
        std::fs::write(&path, b"42").expect("write");
        assert_eq!(load(&path).expect("load").value(), &serde_json::json!(42));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn wait_until_ready_sees_existing_stable_file() {
        let dir = make_temp_dir("ready");
        let path = default_report_path(&dir);
        std::fs::write(&path, b"{}").expect("write");
        let ready = wait_until_ready(
            &path,
            Readiness {
                poll_interval: Duration::from_millis(10),
                max_wait: Duration::from_secs(2),
            },
        );
        assert!(ready);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn wait_until_ready_gives_up_on_missing_file() {
        let dir = make_temp_dir("never");
        let ready = wait_until_ready(
            &dir.join(REPORT_FILE_NAME),
            Readiness {
                poll_interval: Duration::from_millis(10),
                max_wait: Duration::from_millis(50),
            },
        );
        assert!(!ready);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
