use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::AccessionId;
use crate::error::{Missing, RepoError};
use crate::fs_util::{self, fs_err};
use crate::info::ValidationInfo;
use crate::pool::WorkerPool;
use crate::providers::{PayloadKind, Provider};
use crate::store::ContentStore;
use crate::toolkit::Toolkit;

pub const DEFAULT_VALIDATE_DELAY: Duration = Duration::from_millis(750);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryState {
    Unchecked,
    Missing,
    /// Exists with payload; contents were not checked.
    Present,
    PresentNoInfo,
    PresentVerified,
    Mismatched,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationError {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub generated_at: String,
    pub total: usize,
    pub finished: usize,
    pub outcomes: BTreeMap<String, EntryState>,
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    fn new(total: usize) -> Self {
        Self {
            generated_at: chrono::Utc::now().to_rfc3339(),
            total,
            finished: 0,
            outcomes: BTreeMap::new(),
            errors: Vec::new(),
        }
    }
}

/// Checks stored entries against their validation info, rebuilding missing
/// sidecars from the providers.
pub struct Validator<'a> {
    store: &'a ContentStore,
    providers: &'a [Box<dyn Provider>],
    toolkit: &'a dyn Toolkit,
    pool: WorkerPool,
    full: bool,
}

impl<'a> Validator<'a> {
    pub fn new(
        store: &'a ContentStore,
        providers: &'a [Box<dyn Provider>],
        toolkit: &'a dyn Toolkit,
        workers: usize,
    ) -> Self {
        Self {
            store,
            providers,
            toolkit,
            pool: WorkerPool::new(workers, DEFAULT_VALIDATE_DELAY),
            full: false,
        }
    }

    /// Compare sizes and checksums instead of checking existence only.
    pub fn with_full_validation(mut self, full: bool) -> Self {
        self.full = full;
        self
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.pool = WorkerPool::new(self.pool.workers(), delay);
        self
    }

    pub fn validate(&self, ids: &[AccessionId]) -> ValidationReport {
        let total = ids.len();
        let mut initial = ValidationReport::new(total);
        for id in ids {
            initial.outcomes.insert(id.to_string(), EntryState::Unchecked);
        }
        let report = Mutex::new(initial);
        self.pool.run(
            ids.iter().enumerate(),
            || false,
            |(idx, id)| {
                debug!("[{}/{total}] validating {id}", idx + 1);
                let (state, error) = self.check_entry(id);
                if let Ok(mut report) = report.lock() {
                    report.finished += 1;
                    report.outcomes.insert(id.to_string(), state);
                    if let Some(err) = error {
                        warn!(id = %id, "{err}");
                        report.errors.push(ValidationError {
                            id: id.to_string(),
                            reason: err.to_string(),
                        });
                    }
                    info!("[{}/{total}] finished validating", report.finished);
                }
            },
        );
        report
            .into_inner()
            .unwrap_or_else(|_| ValidationReport::new(total))
    }

    /// Validates one entry; the error, if any, explains the returned state.
    pub fn check_entry(&self, id: &AccessionId) -> (EntryState, Option<RepoError>) {
        if let Err(err) = self.store.check(id, false, self.toolkit) {
            let state = match &err {
                RepoError::NotFound { .. } => EntryState::Missing,
                _ => EntryState::Mismatched,
            };
            return (state, Some(err));
        }
        if !self.full {
            return (EntryState::Present, None);
        }

        let files = match self.store.read_files(id) {
            Ok(files) => files,
            Err(err) => return (EntryState::Missing, Some(err)),
        };
        match self.store.read_info(id) {
            Ok(info) => match self.compare(id, &files, &info) {
                Ok(()) => {
                    info!(id = %id, "md5sum matched");
                    (EntryState::PresentVerified, None)
                }
                Err(err) => (EntryState::Mismatched, Some(err)),
            },
            Err(RepoError::NotFound {
                missing: Missing::Sidecar,
                ..
            }) => {
                info!(id = %id, "validation info missing, revalidating");
                match self
                    .revalidate(id, &files)
                    .and_then(|info| self.store.write_info(id, &info))
                {
                    Ok(()) => {
                        info!(id = %id, "validation info stored");
                        (EntryState::PresentVerified, None)
                    }
                    Err(err) => (EntryState::PresentNoInfo, Some(err)),
                }
            }
            Err(err) => (EntryState::Mismatched, Some(err)),
        }
    }

    /// Asks each provider in turn; the first whose description matches the
    /// stored files wins.
    pub fn revalidate(
        &self,
        id: &AccessionId,
        files: &[PathBuf],
    ) -> Result<ValidationInfo, RepoError> {
        let mut reasons = Vec::new();
        for provider in self.providers {
            match self.accept(provider.as_ref(), id, files) {
                Ok(info) => return Ok(info),
                Err(err) => {
                    debug!(id = %id, source = provider.label(), "{err}");
                    reasons.push(format!("{}: {err}", provider.label()));
                }
            }
        }
        Err(RepoError::ValidationMismatch(format!(
            "revalidation of {id} failed ({})",
            reasons.join("; ")
        )))
    }

    fn accept(
        &self,
        provider: &dyn Provider,
        id: &AccessionId,
        files: &[PathBuf],
    ) -> Result<ValidationInfo, RepoError> {
        let mut info = provider.resolve_metadata(id)?;
        match provider.payload() {
            PayloadKind::DirectPayload => {
                self.compare(id, files, &info)?;
            }
            PayloadKind::ArchivePayload => {
                self.toolkit
                    .recount(files, info.read_count, info.base_count)?;
                info.refresh_from_files(files, |path| self.toolkit.md5sum(path))?;
            }
        }
        Ok(info)
    }

    /// Sizes of every file first, then checksums.
    fn compare(
        &self,
        id: &AccessionId,
        files: &[PathBuf],
        info: &ValidationInfo,
    ) -> Result<(), RepoError> {
        for path in files {
            let name = fs_util::file_name_str(path)?;
            let size = fs::metadata(path).map_err(|err| fs_err(path, err))?.len();
            if info.size_of(name) != Some(size) {
                return Err(RepoError::ValidationMismatch(format!(
                    "{id} - mismatched file size for {name}"
                )));
            }
        }
        for path in files {
            let name = fs_util::file_name_str(path)?;
            let md5sum = self.toolkit.md5sum(path)?;
            if info.md5_of(name) != Some(md5sum.as_str()) {
                return Err(RepoError::ValidationMismatch(format!(
                    "{id} - mismatched md5sum for {name}"
                )));
            }
        }
        Ok(())
    }
}
