use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use anyhow::{Result, anyhow};

#[cfg(windows)]
pub const EXECUTABLE_NAME: &str = "dependency-check.bat";
#[cfg(not(windows))]
pub const EXECUTABLE_NAME: &str = "dependency-check.sh";

/// `<install_dir>/dependency-check/bin/<executable>`, the layout of the release archive.
pub fn executable_path(install_dir: &Path) -> PathBuf {
    install_dir
        .join("dependency-check")
        .join("bin")
        .join(EXECUTABLE_NAME)
}

pub fn effective_home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("HOME is not set"))
}

/// Spawns `program` with piped stdout/stderr. On Unix the child leads a new
/// process group so `terminate` also reaches whatever the launcher script starts.
pub fn spawn_piped(program: &Path, args: &[String]) -> io::Result<Child> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    command.spawn()
}

/// Asks the child (and its process group) to stop. Errors are ignored: the
/// process may already be gone.
pub fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        let pid = child.id() as libc::pid_t;
        unsafe {
            libc::kill(-pid, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }
}

/// Forceful variant of `terminate`.
pub fn kill(child: &mut Child) {
    #[cfg(unix)]
    {
        let pid = child.id() as libc::pid_t;
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}
