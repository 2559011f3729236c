mod output;
mod report;
mod scan;
mod update;

pub use output::{OutputChunk, OutputStream};
pub use report::{Report, ReportSummary, SeverityCount};
pub use scan::{DEFAULT_OUTPUT_FORMAT, DEFAULT_PROJECT_NAME, ScanConfig, ScanResult, ScanState};
pub use update::{ARCHIVE_FILE_NAME, UpdatePlan, release_download_url};
