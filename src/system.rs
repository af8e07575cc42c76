use std::ffi::OsStr;
use std::path::Path;
use sysinfo::{Disks, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// Answers whether a game executable is currently alive.
///
/// Detection is best effort: a renamed launcher or a wrapper process can
/// hide the game, so callers treat a `false` as "probably safe", not as a lock.
pub trait ProcessMonitor: Send + Sync {
    fn is_running(&self, exe_name: &str) -> bool;
}

#[derive(Clone, Copy, Default)]
pub struct SystemProcessMonitor;

impl ProcessMonitor for SystemProcessMonitor {
    fn is_running(&self, exe_name: &str) -> bool {
        let target = normalize_exe_name(exe_name);
        if target.is_empty() {
            return false;
        }

        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet),
        );

        let running = sys.processes().values().any(|process| {
            names_match(process.name(), &target)
                || process
                    .exe()
                    .and_then(Path::file_name)
                    .is_some_and(|name| names_match(name, &target))
        });
        if running {
            log::debug!("Process '{}' is running", exe_name);
        }
        running
    }
}

/// Lower-cases and strips a trailing `.exe`, so `Game.EXE`, `game.exe` and
/// `game` (the Linux/Proton view of the same binary) compare equal.
fn normalize_exe_name(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    match lowered.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lowered,
    }
}

fn names_match(candidate: &OsStr, normalized_target: &str) -> bool {
    normalize_exe_name(&candidate.to_string_lossy()) == normalized_target
}

/// Free bytes on the volume holding `path`, if the volume can be identified.
pub fn available_space(path: &Path) -> Option<u64> {
    let anchor = existing_ancestor(path)?;
    let anchor = anchor.canonicalize().unwrap_or(anchor);
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| anchor.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

fn existing_ancestor(path: &Path) -> Option<std::path::PathBuf> {
    path.ancestors()
        .find(|candidate| candidate.exists())
        .map(Path::to_path_buf)
}
