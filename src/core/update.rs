use std::path::PathBuf;

use serde::Serialize;

pub const ARCHIVE_FILE_NAME: &str = "dependency-check.zip";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdatePlan {
    pub latest_version: String,
    pub download_url: String,
    pub archive_path: PathBuf,
    pub install_dir: PathBuf,
}

impl UpdatePlan {
    pub fn new(release_base_url: &str, version: &str, install_dir: PathBuf) -> Self {
        Self {
            latest_version: version.to_string(),
            download_url: release_download_url(release_base_url, version),
            archive_path: install_dir.join(ARCHIVE_FILE_NAME),
            install_dir,
        }
    }
}

pub fn release_download_url(release_base_url: &str, version: &str) -> String {
    let base = release_base_url.trim_end_matches('/');
    format!("{base}/releases/download/v{version}/dependency-check-{version}-release.zip")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_url_is_derived_from_version() {
        let plan = UpdatePlan::new(
            "https://github.com/jeremylong/DependencyCheck/",
            "10.0.3",
            PathBuf::from("/opt/dc"),
        );
        assert_eq!(
            plan.download_url,
            "https://github.com/jeremylong/DependencyCheck/releases/download/v10.0.3/dependency-check-10.0.3-release.zip"
        );
        assert_eq!(plan.archive_path, PathBuf::from("/opt/dc/dependency-check.zip"));
    }
}
