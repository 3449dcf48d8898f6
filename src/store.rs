use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use fs4::FileExt;
use serde::Serialize;
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::domain::AccessionId;
use crate::error::{Missing, RepoError};
use crate::fs_util::{
    self, DIR_EDIT_MODE, DIR_SECURE_MODE, FILE_READONLY_MODE, fs_err, set_mode, unlink_if_exists,
};
use crate::info::ValidationInfo;
use crate::toolkit::Toolkit;

pub const ROOT_MARKER: &str = ".sra-repo-db";
pub const LOCK_DIR: &str = ".lock";
pub const SIDECAR_NAME: &str = "info.json";
pub const PAYLOAD_SUFFIX: &str = ".fastq.gz";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Move,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Symbolic,
    Hard,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub linked: Vec<String>,
    pub conflicts: Vec<String>,
}

/// Sharded read-file repository: `root/<d1>/<d2>/<accession>/`.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: Utf8PathBuf,
    lock_timeout: Duration,
}

/// Holds the entry lock with the entry directory editable. Dropping it puts
/// the directory back into secure mode before the lock is released.
struct EntryGuard {
    dir: PathBuf,
    _lock: File,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        if let Err(err) = set_mode(&self.dir, DIR_SECURE_MODE) {
            warn!(dir = %self.dir.display(), "failed to restore secure mode: {err}");
        }
    }
}

impl ContentStore {
    pub fn init(root: &Utf8Path) -> Result<Self, RepoError> {
        fs::create_dir_all(root.join(LOCK_DIR).as_std_path())
            .map_err(|err| fs_err(root.as_std_path(), err))?;
        let marker = root.join(ROOT_MARKER);
        if !marker.as_std_path().is_file() {
            fs::write(marker.as_std_path(), b"")
                .map_err(|err| fs_err(marker.as_std_path(), err))?;
            info!(root = %root, "initialised storage root");
        }
        Self::open(root)
    }

    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, RepoError> {
        let root = root.into();
        if !root.join(ROOT_MARKER).as_std_path().is_file() {
            return Err(RepoError::NotARepository(root.into_std_path_buf()));
        }
        Ok(Self {
            root,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn resolve_path(&self, id: &AccessionId) -> Utf8PathBuf {
        let (dir1, dir2) = id.shard();
        self.root.join(dir1).join(dir2).join(id.as_str())
    }

    pub fn sidecar_path(&self, id: &AccessionId) -> Utf8PathBuf {
        self.resolve_path(id).join(SIDECAR_NAME)
    }

    pub fn exists(&self, id: &AccessionId) -> bool {
        self.resolve_path(id).as_std_path().is_dir()
    }

    /// Lazily walks both shard levels. Order is unspecified.
    pub fn list_entries(&self) -> Result<impl Iterator<Item = AccessionId>, RepoError> {
        let top = fs::read_dir(self.root.as_std_path())
            .map_err(|err| fs_err(self.root.as_std_path(), err))?;
        Ok(top
            .filter_map(Result::ok)
            .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .flat_map(subdirs)
            .flat_map(subdirs)
            .filter_map(|path| path.file_name()?.to_str()?.parse().ok()))
    }

    pub fn read_info(&self, id: &AccessionId) -> Result<ValidationInfo, RepoError> {
        if !self.exists(id) {
            return Err(RepoError::not_found(id.as_str(), Missing::Entry));
        }
        let path = self.sidecar_path(id);
        if !path.as_std_path().is_file() {
            return Err(RepoError::not_found(id.as_str(), Missing::Sidecar));
        }
        ValidationInfo::load(path.as_std_path())
    }

    pub fn write_info(&self, id: &AccessionId, info: &ValidationInfo) -> Result<(), RepoError> {
        let dir = self.resolve_path(id).into_std_path_buf();
        if !dir.is_dir() {
            return Err(RepoError::not_found(id.as_str(), Missing::Entry));
        }
        let _guard = self.lock_entry(id, &dir)?;
        replace_sidecar(&dir, info)?;
        debug!(id = %id, "validation info stored");
        Ok(())
    }

    /// Places `files` into the entry and writes `info` as its sidecar.
    ///
    /// Names and sizes are checked before the lock is taken. Files placed
    /// before a later failure are kept.
    pub fn commit(
        &self,
        id: &AccessionId,
        files: &[PathBuf],
        info: &ValidationInfo,
        placement: Placement,
    ) -> Result<Vec<PathBuf>, RepoError> {
        validate_payload(files, info)?;

        let dir = self.resolve_path(id).into_std_path_buf();
        if !dir.is_dir() {
            fs::create_dir_all(&dir).map_err(|err| fs_err(&dir, err))?;
            set_mode(&dir, DIR_SECURE_MODE)?;
        }
        let _guard = self.lock_entry(id, &dir)?;

        let mut placed = Vec::with_capacity(files.len());
        for source in files {
            let dest = dir.join(fs_util::file_name_str(source)?);
            unlink_if_exists(&dest)?;
            match placement {
                Placement::Move => fs_util::move_file(source, &dest)?,
                Placement::Copy => {
                    fs::copy(source, &dest).map_err(|err| fs_err(&dest, err))?;
                }
            }
            set_mode(&dest, FILE_READONLY_MODE)?;
            placed.push(dest);
        }
        replace_sidecar(&dir, info)?;
        info!(id = %id, files = placed.len(), "entry committed");
        Ok(placed)
    }

    /// Links every payload file of the entry into `target_dir`. Names that
    /// already exist there are reported as conflicts and skipped.
    pub fn link_out(
        &self,
        id: &AccessionId,
        target_dir: &Path,
        kind: LinkKind,
        dryrun: bool,
    ) -> Result<LinkReport, RepoError> {
        let files = self.read_files(id)?;
        let mut report = LinkReport::default();
        for source in files {
            let name = fs_util::file_name_str(&source)?.to_string();
            let target = target_dir.join(&name);
            if fs::symlink_metadata(&target).is_ok() {
                warn!(id = %id, target = %target.display(), "link target already exists");
                report.conflicts.push(name);
                continue;
            }
            if dryrun {
                info!("{} -> {}", target.display(), source.display());
                report.linked.push(name);
                continue;
            }
            match make_link(&source, &target, kind) {
                Ok(()) => report.linked.push(name),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => report.conflicts.push(name),
                Err(err) => return Err(fs_err(&target, err)),
            }
        }
        Ok(report)
    }

    /// Payload files of an entry, sorted by name.
    pub fn read_files(&self, id: &AccessionId) -> Result<Vec<PathBuf>, RepoError> {
        let dir = self.resolve_path(id).into_std_path_buf();
        if !dir.is_dir() {
            return Err(RepoError::not_found(id.as_str(), Missing::Entry));
        }
        let mut files = fs::read_dir(&dir)
            .map_err(|err| fs_err(&dir, err))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(PAYLOAD_SUFFIX))
            })
            .collect::<Vec<_>>();
        files.sort();
        Ok(files)
    }

    /// Entry exists and holds payload; with `verify`, every payload file
    /// also passes the archive integrity check.
    pub fn check(
        &self,
        id: &AccessionId,
        verify: bool,
        toolkit: &dyn Toolkit,
    ) -> Result<(), RepoError> {
        let files = self.read_files(id)?;
        if files.is_empty() {
            return Err(RepoError::ValidationMismatch(format!(
                "{id} does not have any read files"
            )));
        }
        if verify {
            for path in &files {
                debug!(file = %path.display(), "verifying archive");
                if !toolkit.check_archive(path)? {
                    return Err(RepoError::ValidationMismatch(format!(
                        "{id} file {} failed the integrity check",
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Re-applies read-only modes to the payload and sidecar of an entry.
    pub fn fix_permissions(&self, id: &AccessionId) -> Result<usize, RepoError> {
        let dir = self.resolve_path(id).into_std_path_buf();
        let mut files = self.read_files(id)?;
        let sidecar = dir.join(SIDECAR_NAME);
        if sidecar.is_file() {
            files.push(sidecar);
        }
        let _guard = self.lock_entry(id, &dir)?;
        for path in &files {
            set_mode(path, FILE_READONLY_MODE)?;
        }
        Ok(files.len())
    }

    fn lock_entry(&self, id: &AccessionId, dir: &Path) -> Result<EntryGuard, RepoError> {
        let lock_dir = self.root.join(LOCK_DIR).into_std_path_buf();
        fs::create_dir_all(&lock_dir).map_err(|err| fs_err(&lock_dir, err))?;
        let lock_path = lock_dir.join(id.as_str());
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|err| fs_err(&lock_path, err))?;

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(RepoError::Timeout(id.to_string()));
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(err) => return Err(fs_err(&lock_path, err)),
            }
        }

        let guard = EntryGuard {
            dir: dir.to_path_buf(),
            _lock: file,
        };
        set_mode(dir, DIR_EDIT_MODE)?;
        Ok(guard)
    }
}

fn subdirs(path: PathBuf) -> impl Iterator<Item = PathBuf> {
    fs::read_dir(path)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
}

fn validate_payload(files: &[PathBuf], info: &ValidationInfo) -> Result<(), RepoError> {
    for path in files {
        let name = fs_util::file_name_str(path)?;
        if !name.to_lowercase().ends_with(PAYLOAD_SUFFIX) {
            return Err(RepoError::ValidationMismatch(format!(
                "{name} does not have {PAYLOAD_SUFFIX} extension"
            )));
        }
        if !name.contains('_') {
            return Err(RepoError::ValidationMismatch(format!(
                "{name} is not a paired read file name"
            )));
        }
        let size = fs::metadata(path).map_err(|err| fs_err(path, err))?.len();
        match info.size_of(name) {
            Some(expected) if expected == size => {}
            Some(expected) => {
                return Err(RepoError::ValidationMismatch(format!(
                    "{name} has size {size}, validation info declares {expected}"
                )));
            }
            None => {
                return Err(RepoError::ValidationMismatch(format!(
                    "{name} has no declared size in validation info"
                )));
            }
        }
    }
    Ok(())
}

fn replace_sidecar(dir: &Path, info: &ValidationInfo) -> Result<(), RepoError> {
    let content =
        serde_json::to_vec_pretty(info).map_err(|err| RepoError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".info")
        .tempfile_in(dir)
        .map_err(|err| fs_err(dir, err))?;
    temp.write_all(&content)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|err| fs_err(temp.path(), err))?;
    set_mode(temp.path(), FILE_READONLY_MODE)?;

    let path = dir.join(SIDECAR_NAME);
    unlink_if_exists(&path)?;
    temp.persist(&path)
        .map_err(|err| fs_err(&path, err.error))?;
    Ok(())
}

#[cfg(unix)]
fn make_link(source: &Path, target: &Path, kind: LinkKind) -> io::Result<()> {
    match kind {
        LinkKind::Symbolic => std::os::unix::fs::symlink(source, target),
        LinkKind::Hard => fs::hard_link(source, target),
    }
}

#[cfg(windows)]
fn make_link(source: &Path, target: &Path, kind: LinkKind) -> io::Result<()> {
    match kind {
        LinkKind::Symbolic => std::os::windows::fs::symlink_file(source, target),
        LinkKind::Hard => fs::hard_link(source, target),
    }
}
