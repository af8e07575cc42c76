use crate::error::{CheckpointError, Result};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use walkdir::WalkDir;

const PROGRESS_EVERY: usize = 50;

#[derive(Debug, Clone)]
pub struct CopyProgress {
    pub stage: &'static str,
    pub current: String,
    pub done: usize,
    pub total: usize,
    pub bytes_copied: u64,
}

pub type ProgressFn = Arc<dyn Fn(CopyProgress) + Send + Sync>;

/// Optional hooks for a long-running copy: coarse progress reports and a
/// cancellation flag polled before every file.
#[derive(Clone, Default)]
pub struct TaskControl {
    pub progress: Option<ProgressFn>,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl TaskControl {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn report(&self, progress: CopyProgress) {
        if let Some(cb) = &self.progress {
            cb(progress);
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SourceFile {
    pub path: PathBuf,
    pub relative: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct TreeListing {
    pub files: Vec<SourceFile>,
    pub dirs: Vec<PathBuf>,
    pub total_bytes: u64,
}

impl TreeListing {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CopySummary {
    pub file_count: usize,
    pub total_bytes: u64,
}

/// Lists every file and directory under `root`, relative to it. Names in
/// `skip_root_names` are ignored when they sit directly under `root`.
pub(crate) fn scan_tree(root: &Path, skip_root_names: &[&str]) -> Result<TreeListing> {
    let mut listing = TreeListing::default();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            CheckpointError::io(format!("Failed to read directory {}", root.display()), e.into())
        })?;
        if entry.depth() == 0 {
            continue;
        }
        if entry.depth() == 1 {
            let name = entry.file_name().to_string_lossy();
            if skip_root_names.iter().any(|skip| *skip == name) {
                continue;
            }
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .map_err(|e| {
                CheckpointError::io(
                    "Failed to calculate relative path",
                    std::io::Error::new(std::io::ErrorKind::Other, e),
                )
            })?;

        let file_type = entry.file_type();
        if file_type.is_dir() {
            listing.dirs.push(relative);
        } else if file_type.is_file() || entry.path().is_file() {
            let metadata = fs::metadata(entry.path()).map_err(|e| {
                CheckpointError::io(
                    format!("Failed to get metadata for {}", entry.path().display()),
                    e,
                )
            })?;
            listing.total_bytes += metadata.len();
            listing.files.push(SourceFile {
                path: entry.path().to_path_buf(),
                relative,
            });
        } else {
            log::warn!("Skipping unsupported entry {}", entry.path().display());
        }
    }

    Ok(listing)
}

/// Copies a scanned tree under `destination`, which must already exist.
/// Stops at the first failure or cancellation; cleaning up is the caller's job.
pub(crate) fn copy_tree(
    listing: &TreeListing,
    destination: &Path,
    threads: usize,
    stage: &'static str,
    control: &TaskControl,
) -> Result<CopySummary> {
    if control.is_cancelled() {
        return Err(CheckpointError::Cancelled);
    }

    for dir in &listing.dirs {
        let target = destination.join(dir);
        fs::create_dir_all(&target).map_err(|e| {
            CheckpointError::io(format!("Failed to create directory {}", target.display()), e)
        })?;
    }

    let thread_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .map_err(|e| CheckpointError::Task(e.to_string()))?;

    let total = listing.files.len();
    let counter = AtomicUsize::new(0);
    let bytes = AtomicU64::new(0);

    let sizes: Result<Vec<u64>> = thread_pool.install(|| {
        listing
            .files
            .par_iter()
            .map(|file| {
                if control.is_cancelled() {
                    return Err(CheckpointError::Cancelled);
                }
                let copied = copy_file(&file.path, &destination.join(&file.relative))?;
                let done = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let bytes_copied = bytes.fetch_add(copied, Ordering::SeqCst) + copied;
                if done == total || done % PROGRESS_EVERY == 0 {
                    control.report(CopyProgress {
                        stage,
                        current: file.relative.to_string_lossy().to_string(),
                        done,
                        total,
                        bytes_copied,
                    });
                }
                Ok(copied)
            })
            .collect()
    });

    let sizes = sizes?;
    Ok(CopySummary {
        file_count: sizes.len(),
        total_bytes: sizes.iter().sum(),
    })
}

fn copy_file(source: &Path, target: &Path) -> Result<u64> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            CheckpointError::io(format!("Failed to create directory {}", parent.display()), e)
        })?;
    }
    fs::copy(source, target).map_err(|e| {
        CheckpointError::io(format!("Failed to copy file {}", source.display()), e)
    })
}

/// Empties `dir` without removing it.
pub(crate) fn clear_directory(dir: &Path) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| {
        CheckpointError::io(format!("Failed to read save directory {}", dir.display()), e)
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| {
            CheckpointError::io(format!("Failed to read entry in {}", dir.display()), e)
        })?;
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let removed = if is_dir {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|e| CheckpointError::io(format!("Failed to remove {}", path.display()), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("sub/deeper")).expect("mkdirs");
        fs::create_dir_all(root.join("empty")).expect("mkdirs");
        fs::write(root.join("save1.dat"), b"alpha").expect("write");
        fs::write(root.join("sub/save2.dat"), b"beta!").expect("write");
        fs::write(root.join("sub/deeper/save3.dat"), b"gamma!").expect("write");
    }

    #[test]
    fn scan_lists_files_and_empty_dirs() {
        let dir = tempdir().expect("tempdir");
        sample_tree(dir.path());
        fs::write(dir.path().join("skip.me"), b"x").expect("write");

        let listing = scan_tree(dir.path(), &["skip.me"]).expect("scan");
        assert_eq!(listing.files.len(), 3);
        assert_eq!(listing.total_bytes, 16);
        assert!(listing.dirs.contains(&PathBuf::from("empty")));
        assert!(listing
            .files
            .iter()
            .all(|f| f.relative != PathBuf::from("skip.me")));
    }

    #[test]
    fn copy_reproduces_structure_and_reports_progress() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("src");
        let target = dir.path().join("dst");
        sample_tree(&source);
        fs::create_dir_all(&target).expect("mkdir");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ref = seen.clone();
        let control = TaskControl::none().with_progress(Arc::new(move |p: CopyProgress| {
            seen_ref.lock().expect("lock").push((p.done, p.total, p.bytes_copied));
        }));

        let listing = scan_tree(&source, &[]).expect("scan");
        let summary = copy_tree(&listing, &target, 2, "copy", &control).expect("copy");

        assert_eq!(summary.file_count, 3);
        assert_eq!(summary.total_bytes, 16);
        assert!(target.join("empty").is_dir());
        assert_eq!(fs::read(target.join("sub/deeper/save3.dat")).expect("read"), b"gamma!");
        assert_eq!(seen.lock().expect("lock").last(), Some(&(3, 3, 16)));
    }

    #[test]
    fn scanned_total_matches_copied_bytes() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("src");
        let target = dir.path().join("dst");
        sample_tree(&source);
        fs::write(source.join("sub/big.bin"), vec![0u8; 70_000]).expect("write");
        fs::create_dir_all(&target).expect("mkdir");

        let listing = scan_tree(&source, &[]).expect("scan");
        let summary = copy_tree(&listing, &target, 2, "copy", &TaskControl::none()).expect("copy");

        assert_eq!(listing.total_bytes, 70_016);
        assert_eq!(summary.total_bytes, listing.total_bytes);
        assert_eq!(summary.file_count, listing.files.len());
    }

    #[test]
    fn preset_cancel_copies_nothing() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("src");
        let target = dir.path().join("dst");
        sample_tree(&source);
        fs::create_dir_all(&target).expect("mkdir");

        let cancel = Arc::new(AtomicBool::new(true));
        let control = TaskControl::none().with_cancel(cancel);
        let listing = scan_tree(&source, &[]).expect("scan");
        let err = copy_tree(&listing, &target, 1, "copy", &control).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(fs::read_dir(&target).expect("read").count(), 0);
    }

    #[test]
    fn clear_directory_keeps_the_directory() {
        let dir = tempdir().expect("tempdir");
        sample_tree(dir.path());
        clear_directory(dir.path()).expect("clear");
        assert!(dir.path().is_dir());
        assert_eq!(fs::read_dir(dir.path()).expect("read").count(), 0);
    }
}
