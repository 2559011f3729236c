use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use zip::ZipArchive;

use crate::core::UpdatePlan;
use crate::platform;

mod client;

pub use client::{HttpError, HttpReleaseClient, ReleaseClient};

pub const DEFAULT_VERSION_URL: &str = "https://jeremylong.github.io/DependencyCheck/current.txt";
pub const DEFAULT_RELEASE_BASE_URL: &str = "https://github.com/jeremylong/DependencyCheck";

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("an update is already running")]
    AlreadyRunning,
    #[error("failed to resolve the latest version from {url}: {message}")]
    VersionResolution { url: String, message: String },
    #[error("failed to delete the old installation in {}: {source}", path.display())]
    DeleteOldInstall {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: HttpError,
    },
    #[error("failed to extract {}: {message}", path.display())]
    Extract { path: PathBuf, message: String },
}

/// Non-fatal: the archive could not be removed after a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupWarning {
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to remove {}: {}",
            self.path.display(),
            self.message
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStep {
    ResolveVersion,
    ClearInstall,
    Download,
    Extract,
    Cleanup,
}

impl UpdateStep {
    pub const fn as_str(self) -> &'static str {
        match self {
            UpdateStep::ResolveVersion => "resolve-version",
            UpdateStep::ClearInstall => "clear-install",
            UpdateStep::Download => "download",
            UpdateStep::Extract => "extract",
            UpdateStep::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for UpdateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait UpdateObserver {
    fn on_status(&mut self, step: UpdateStep, message: &str);
}

impl UpdateObserver for () {
    fn on_status(&mut self, _step: UpdateStep, _message: &str) {}
}

#[derive(Debug, Clone)]
pub struct UpdateSettings {
    pub version_url: String,
    pub release_base_url: String,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            version_url: DEFAULT_VERSION_URL.to_string(),
            release_base_url: DEFAULT_RELEASE_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub plan: UpdatePlan,
    pub downloaded_bytes: u64,
    pub extracted_entries: usize,
    pub cleanup_warning: Option<CleanupWarning>,
}

pub struct Updater<C> {
    client: C,
    settings: UpdateSettings,
    busy: AtomicBool,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<C: ReleaseClient> Updater<C> {
    pub fn new(client: C, settings: UpdateSettings) -> Self {
        Self {
            client,
            settings,
            busy: AtomicBool::new(false),
        }
    }

    /// Resolves the latest version without touching the install directory.
    pub fn plan(&self, install_dir: &Path) -> Result<UpdatePlan, UpdateError> {
        let version = resolve_version(&self.client, &self.settings.version_url)?;
        Ok(UpdatePlan::new(
            &self.settings.release_base_url,
            &version,
            install_dir.to_path_buf(),
        ))
    }

    /// Replaces the contents of `install_dir` with the latest release.
    /// Steps run strictly in order and the first failure aborts.
    pub fn update(
        &self,
        install_dir: &Path,
        observer: &mut dyn UpdateObserver,
    ) -> Result<UpdateOutcome, UpdateError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(UpdateError::AlreadyRunning);
        }
        let _guard = BusyGuard(&self.busy);

        let version_url = &self.settings.version_url;
        observer.on_status(
            UpdateStep::ResolveVersion,
            &format!("Resolving the latest version from {version_url}"),
        );
        let version = resolve_version(&self.client, version_url)?;
        observer.on_status(
            UpdateStep::ResolveVersion,
            &format!("Latest version: {version}"),
        );
        let plan = UpdatePlan::new(
            &self.settings.release_base_url,
            &version,
            install_dir.to_path_buf(),
        );

        observer.on_status(
            UpdateStep::ClearInstall,
            &format!("Removing the old installation in {}", install_dir.display()),
        );
        if clear_install(install_dir)? {
            observer.on_status(UpdateStep::ClearInstall, "Old installation removed");
        } else {
            observer.on_status(
                UpdateStep::ClearInstall,
                "Install directory does not exist, nothing to remove",
            );
        }

        observer.on_status(
            UpdateStep::Download,
            &format!("Downloading {}", plan.download_url),
        );
        let downloaded_bytes =
            download_archive(&self.client, &plan.download_url, &plan.archive_path)?;
        observer.on_status(
            UpdateStep::Download,
            &format!(
                "Downloaded {downloaded_bytes} bytes to {}",
                plan.archive_path.display()
            ),
        );

        observer.on_status(
            UpdateStep::Extract,
            &format!("Extracting {}", plan.archive_path.display()),
        );
        let extracted_entries = extract_archive(&plan.archive_path, install_dir)?;
        observer.on_status(
            UpdateStep::Extract,
            &format!(
                "Extracted {extracted_entries} entries into {}",
                install_dir.display()
            ),
        );

        observer.on_status(
            UpdateStep::Cleanup,
            &format!("Removing {}", plan.archive_path.display()),
        );
        let cleanup_warning = cleanup(&plan.archive_path);
        match &cleanup_warning {
            None => observer.on_status(UpdateStep::Cleanup, "Archive removed"),
            Some(warning) => observer.on_status(UpdateStep::Cleanup, &format!("warning: {warning}")),
        }

        Ok(UpdateOutcome {
            plan,
            downloaded_bytes,
            extracted_entries,
            cleanup_warning,
        })
    }
}

pub fn resolve_version(client: &dyn ReleaseClient, url: &str) -> Result<String, UpdateError> {
    let body = client
        .fetch_text(url)
        .map_err(|e| UpdateError::VersionResolution {
            url: url.to_string(),
            message: e.to_string(),
        })?;
    let version = body.trim();
    if version.is_empty() {
        return Err(UpdateError::VersionResolution {
            url: url.to_string(),
            message: "empty response".to_string(),
        });
    }
    if version.contains(|c: char| c.is_whitespace() || c == '/') {
        return Err(UpdateError::VersionResolution {
            url: url.to_string(),
            message: format!("unexpected version string: {version}"),
        });
    }
    Ok(version.to_string())
}

/// Removes everything inside `dir`. Returns false when `dir` does not exist.
pub fn clear_install(dir: &Path) -> Result<bool, UpdateError> {
    let delete_err = |source: std::io::Error| UpdateError::DeleteOldInstall {
        path: dir.to_path_buf(),
        source,
    };

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(delete_err(err)),
    };

    for entry in entries {
        let entry = entry.map_err(delete_err)?;
        let file_type = entry.file_type().map_err(delete_err)?;
        let path = entry.path();
        let res = if file_type.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        res.map_err(|source| UpdateError::DeleteOldInstall { path, source })?;
    }
    Ok(true)
}

/// Downloads `url` to `dest`. A failed or short download leaves no file behind.
pub fn download_archive(
    client: &dyn ReleaseClient,
    url: &str,
    dest: &Path,
) -> Result<u64, UpdateError> {
    let download_err = |source: HttpError| UpdateError::Download {
        url: url.to_string(),
        source,
    };

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| download_err(e.into()))?;
    }
    let file = File::create(dest).map_err(|e| download_err(e.into()))?;
    let mut out = BufWriter::new(file);

    let res = client
        .download(url, &mut out)
        .and_then(|n| out.flush().map(|()| n).map_err(HttpError::from));
    drop(out);

    match res {
        Ok(n) => Ok(n),
        Err(err) => {
            let _ = std::fs::remove_file(dest);
            Err(download_err(err))
        }
    }
}

/// Unpacks `archive` into `dest`, keeping the archive's directory layout and
/// Unix permission bits. The tool's launcher must be present afterwards.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<usize, UpdateError> {
    let extract_err = |message: String| UpdateError::Extract {
        path: archive.to_path_buf(),
        message,
    };

    let file = File::open(archive).map_err(|e| extract_err(e.to_string()))?;
    let mut zip = ZipArchive::new(file).map_err(|e| extract_err(e.to_string()))?;

    let mut count = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| extract_err(e.to_string()))?;
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(extract_err(format!(
                "entry escapes the target directory: {}",
                entry.name()
            )));
        };
        let out_path = dest.join(&rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|e| extract_err(format!("{}: {e}", out_path.display())))?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| extract_err(format!("{}: {e}", parent.display())))?;
            }
            let mut out = File::create(&out_path)
                .map_err(|e| extract_err(format!("{}: {e}", out_path.display())))?;
            std::io::copy(&mut entry, &mut out)
                .map_err(|e| extract_err(format!("{}: {e}", out_path.display())))?;
        }

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| extract_err(format!("{}: {e}", out_path.display())))?;
        }

        count += 1;
    }

    let exe = platform::executable_path(dest);
    if !exe.is_file() {
        return Err(extract_err(format!(
            "archive did not contain {}",
            exe.strip_prefix(dest).unwrap_or(&exe).display()
        )));
    }
    Ok(count)
}

pub fn cleanup(archive: &Path) -> Option<CleanupWarning> {
    std::fs::remove_file(archive)
        .err()
        .map(|e| CleanupWarning {
            path: archive.to_path_buf(),
            message: e.to_string(),
        })
}
