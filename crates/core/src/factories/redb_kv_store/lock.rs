//! Pid file next to the database, used to clear locks left behind by a
//! hung instance of this program.

use heart_api::*;
use std::path::{Path, PathBuf};

const PID_FILE: &str = "LOCK.pid";

pub(super) fn pid_path(db_dir: &Path) -> PathBuf {
    db_dir.join(PID_FILE)
}

fn exe_name(path: &Path) -> Option<std::ffi::OsString> {
    path.file_name().map(|n| n.to_os_string())
}

/// If the pid file names another live process running our executable,
/// kill it and wait `release_delay` for the OS to release its locks.
///
/// Returns true if a process was killed.
pub(super) async fn release_stale(
    db_dir: &Path,
    release_delay: std::time::Duration,
) -> bool {
    let Ok(raw) = std::fs::read_to_string(pid_path(db_dir)) else {
        return false;
    };
    let Ok(pid) = raw.trim().parse::<u32>() else {
        tracing::debug!(%raw, "ignoring corrupt pid file");
        return false;
    };
    if pid == std::process::id() {
        return false;
    }

    let Some(ours) = std::env::current_exe().ok().and_then(|p| exe_name(&p))
    else {
        return false;
    };

    let pid = sysinfo::Pid::from_u32(pid);
    let mut system = sysinfo::System::new();
    if !system.refresh_process(pid) {
        return false;
    }
    let Some(process) = system.process(pid) else {
        return false;
    };
    if process.exe().and_then(exe_name).as_ref() != Some(&ours) {
        return false;
    }

    tracing::warn!(%pid, "killing stale process holding the datastore");
    if !process.kill() {
        return false;
    }
    tokio::time::sleep(release_delay).await;
    true
}

/// Record our pid.
pub(super) fn write(db_dir: &Path) -> HeartResult<()> {
    std::fs::write(pid_path(db_dir), std::process::id().to_string())?;
    Ok(())
}

/// Remove the pid file if it still names us.
pub(super) fn remove(db_dir: &Path) {
    let path = pid_path(db_dir);
    if std::fs::read_to_string(&path)
        .is_ok_and(|raw| raw.trim() == std::process::id().to_string())
    {
        if let Err(err) = std::fs::remove_file(&path) {
            tracing::warn!(?err, "remove pid file");
        }
    }
}
