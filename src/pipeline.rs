use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::domain::AccessionId;
use crate::error::RepoError;
use crate::fs_util::{self, fs_err};
use crate::info::ValidationInfo;
use crate::providers::Provider;
use crate::store::{ContentStore, Placement};
use crate::toolkit::Toolkit;
use crate::transfer::{TransferClient, TransferEngine, TransferHooks, TransferTask};

/// Bound of the producer to engine queue.
pub const QUEUE_CAPACITY: usize = 3;

/// Bookkeeping for one accession while its files are in flight.
#[derive(Debug, Clone)]
pub struct DownloadUnit {
    pub id: AccessionId,
    /// Index of the resolving provider in the pipeline's provider list.
    pub provider: usize,
    pub info: ValidationInfo,
    pub paths: Vec<PathBuf>,
    pub pending: usize,
    pub error: usize,
    pub failures: Vec<String>,
}

impl DownloadUnit {
    pub fn new(id: AccessionId, provider: usize, info: ValidationInfo, paths: Vec<PathBuf>) -> Self {
        Self {
            id,
            provider,
            pending: paths.len(),
            info,
            paths,
            error: 0,
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, reason: String) {
        self.error += 1;
        self.failures.push(reason);
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Download accessions that are already in the store.
    pub force: bool,
    /// Only fetch the first `count` accessions left after planning.
    pub count: Option<usize>,
    pub reverse: bool,
    /// Move finished files here instead of committing them to the store.
    pub target_dir: Option<PathBuf>,
    /// Log every download URL at info level.
    pub show_urls: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchError {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub generated_at: String,
    pub total: usize,
    pub existed: usize,
    pub skipped: usize,
    pub queued: usize,
    pub completed: usize,
    pub errors: Vec<FetchError>,
    pub unfinished: Vec<String>,
    pub fatal: Option<String>,
}

impl FetchReport {
    fn new(total: usize) -> Self {
        Self {
            generated_at: chrono::Utc::now().to_rfc3339(),
            total,
            existed: 0,
            skipped: 0,
            queued: 0,
            completed: 0,
            errors: Vec::new(),
            unfinished: Vec::new(),
            fatal: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.unfinished.is_empty() && self.fatal.is_none()
    }
}

type SharedUnit = Arc<Mutex<DownloadUnit>>;

#[derive(Default)]
struct FetchState {
    units: Mutex<HashMap<PathBuf, SharedUnit>>,
    completed: AtomicUsize,
    errors: Mutex<Vec<FetchError>>,
}

impl FetchState {
    /// Refuses a unit whose paths are already owned by another one.
    fn register(&self, unit: &SharedUnit, paths: &[PathBuf]) -> bool {
        let Ok(mut units) = self.units.lock() else {
            return false;
        };
        if paths.iter().any(|path| units.contains_key(path)) {
            return false;
        }
        for path in paths {
            units.insert(path.clone(), Arc::clone(unit));
        }
        true
    }

    fn unit_for(&self, path: &Path) -> Option<SharedUnit> {
        self.units.lock().ok()?.get(path).cloned()
    }

    fn forget(&self, unit: &SharedUnit) {
        if let Ok(mut units) = self.units.lock() {
            units.retain(|_, candidate| !Arc::ptr_eq(candidate, unit));
        }
    }

    fn record_error(&self, id: &str, reason: String) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(FetchError {
                id: id.to_string(),
                reason,
            });
        }
    }

    fn unfinished(&self) -> Vec<String> {
        let mut ids = match self.units.lock() {
            Ok(units) => units
                .values()
                .filter_map(|unit| unit.lock().ok().map(|unit| unit.id.to_string()))
                .collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Resolves accessions through providers, downloads their files with the
/// transfer engine and commits each finished accession.
pub struct FetchPipeline<'a, C> {
    store: &'a ContentStore,
    providers: &'a [Box<dyn Provider>],
    toolkit: &'a dyn Toolkit,
    engine: TransferEngine<C>,
    tmpdir: PathBuf,
}

impl<'a, C: TransferClient> FetchPipeline<'a, C> {
    pub fn new(
        store: &'a ContentStore,
        providers: &'a [Box<dyn Provider>],
        toolkit: &'a dyn Toolkit,
        engine: TransferEngine<C>,
        tmpdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            providers,
            toolkit,
            engine,
            tmpdir: tmpdir.into(),
        }
    }

    /// Filters the requested ids down to the accessions that need fetching.
    pub fn plan(&self, ids: &[String], options: &FetchOptions) -> (Vec<AccessionId>, FetchReport) {
        let mut report = FetchReport::new(ids.len());
        let mut queue = Vec::new();
        let mut seen = HashSet::new();
        for (idx, raw) in ids.iter().enumerate() {
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') {
                warn!("({}/{}) skipping {raw}", idx + 1, ids.len());
                report.skipped += 1;
                continue;
            }
            let id = match raw.parse::<AccessionId>() {
                Ok(id) => id,
                Err(err) => {
                    warn!("({}/{}) {err}", idx + 1, ids.len());
                    report.skipped += 1;
                    report.errors.push(FetchError {
                        id: raw.to_string(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            if !seen.insert(id.clone()) {
                warn!("({}/{}) {id} is listed more than once", idx + 1, ids.len());
                report.skipped += 1;
                continue;
            }
            if !options.force && self.store.exists(&id) {
                debug!(id = %id, "already in store");
                report.existed += 1;
                continue;
            }
            queue.push(id);
        }
        if options.reverse {
            queue.reverse();
        }
        if let Some(count) = options.count {
            queue.truncate(count);
        }
        info!(
            total = report.total,
            existed = report.existed,
            skipped = report.skipped,
            "fetch planned"
        );
        (queue, report)
    }

    pub fn fetch(&self, ids: &[String], options: &FetchOptions) -> Result<FetchReport, RepoError> {
        fs::create_dir_all(&self.tmpdir).map_err(|err| fs_err(&self.tmpdir, err))?;
        if let Some(target) = &options.target_dir {
            fs::create_dir_all(target).map_err(|err| fs_err(target, err))?;
        }
        let (queue, mut report) = self.plan(ids, options);
        let state = FetchState::default();
        let hooks = PipelineHooks {
            pipeline: self,
            state: &state,
            target_dir: options.target_dir.as_deref(),
            planned: queue.len(),
            show_urls: options.show_urls,
        };

        let (tx, rx) = mpsc::sync_channel::<Option<TransferTask>>(QUEUE_CAPACITY);
        let (queued, transfers) = thread::scope(|scope| {
            let producer = scope.spawn(|| self.produce(&queue, tx, &state));
            // The receiver is dropped with the task source once the engine
            // stops pulling, which unblocks a producer stuck on a full queue.
            let tasks = std::iter::from_fn(move || rx.recv().ok().flatten());
            let transfers = self.engine.run(tasks, &hooks);
            let queued = producer.join().unwrap_or_default();
            (queued, transfers)
        });

        report.queued = queued;
        report.completed = state.completed.load(Ordering::SeqCst);
        report.unfinished = state.unfinished();
        report.fatal = transfers.fatal;
        if let Ok(errors) = state.errors.into_inner() {
            report.errors.extend(errors);
        }
        if report.is_clean() {
            info!(completed = report.completed, "all accessions fetched");
        } else {
            warn!(
                completed = report.completed,
                queued = report.queued,
                errors = report.errors.len(),
                unfinished = report.unfinished.len(),
                "fetch finished with unsuccessful accessions"
            );
        }
        Ok(report)
    }

    /// Producer side: resolves each accession in turn and queues its files.
    /// Returns the number of accessions fully queued.
    fn produce(
        &self,
        queue: &[AccessionId],
        tx: SyncSender<Option<TransferTask>>,
        state: &FetchState,
    ) -> usize {
        let token = self.engine.token();
        let mut queued = 0;
        for (idx, id) in queue.iter().enumerate() {
            if token.is_cancelled() {
                break;
            }
            let indicator = format!("[{}/{}]", idx + 1, queue.len());
            let Some((provider, info)) = self.resolve(&indicator, id, state) else {
                continue;
            };

            let paths = info
                .files
                .iter()
                .map(|name| self.tmpdir.join(name))
                .collect::<Vec<_>>();
            let tasks = info
                .urls
                .iter()
                .zip(&paths)
                .map(|(url, path)| TransferTask {
                    url: url.clone(),
                    destination: path.clone(),
                })
                .collect::<Vec<_>>();
            let unit = Arc::new(Mutex::new(DownloadUnit::new(
                id.clone(),
                provider,
                info,
                paths.clone(),
            )));
            if !state.register(&unit, &paths) {
                warn!(id = %id, "download paths are in use by another accession");
                state.record_error(
                    id.as_str(),
                    "download paths are in use by another accession".to_string(),
                );
                continue;
            }

            info!("{indicator} queueing {} file(s) for {id}", tasks.len());
            for task in tasks {
                if tx.send(Some(task)).is_err() {
                    return queued;
                }
            }
            queued += 1;
        }
        let _ = tx.send(None);
        queued
    }

    fn resolve(
        &self,
        indicator: &str,
        id: &AccessionId,
        state: &FetchState,
    ) -> Option<(usize, ValidationInfo)> {
        let mut reasons = Vec::new();
        for (idx, provider) in self.providers.iter().enumerate() {
            info!("{indicator} requesting information from {} for {id}", provider.label());
            match provider.resolve_metadata(id) {
                Ok(info) if info.urls.is_empty() || info.urls.len() != info.files.len() => {
                    warn!(id = %id, source = provider.label(), "no downloadable files");
                    reasons.push(format!("{}: no downloadable files", provider.label()));
                }
                Ok(info) => return Some((idx, info)),
                Err(err) => {
                    warn!(id = %id, source = provider.label(), "{err}");
                    reasons.push(format!("{}: {err}", provider.label()));
                }
            }
        }
        if reasons.is_empty() {
            reasons.push("no providers configured".to_string());
        }
        state.record_error(id.as_str(), reasons.join("; "));
        None
    }

    fn store_unit(&self, unit: &DownloadUnit, target_dir: Option<&Path>) -> Result<(), RepoError> {
        match target_dir {
            Some(dir) => {
                for path in &unit.paths {
                    fs_util::move_into(path, dir)?;
                }
                Ok(())
            }
            None => self
                .store
                .commit(&unit.id, &unit.paths, &unit.info, Placement::Move)
                .map(|_| ()),
        }
    }
}

struct PipelineHooks<'p, 'a, C> {
    pipeline: &'p FetchPipeline<'a, C>,
    state: &'p FetchState,
    target_dir: Option<&'p Path>,
    planned: usize,
    show_urls: bool,
}

impl<C: TransferClient> PipelineHooks<'_, '_, C> {
    /// Marks one file of the unit as done and commits the unit when it was
    /// the last one.
    fn settle(&self, shared: &SharedUnit, unit: &mut DownloadUnit) {
        unit.pending = unit.pending.saturating_sub(1);
        if unit.pending > 0 {
            return;
        }
        self.state.forget(shared);
        if unit.error > 0 {
            error!(id = %unit.id, errors = unit.error, "errors found after download, not storing");
            self.state
                .record_error(unit.id.as_str(), unit.failures.join("; "));
            return;
        }
        match self.pipeline.store_unit(unit, self.target_dir) {
            Ok(()) => {
                let completed = self.state.completed.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    "({completed}/{}) stored {} file(s) for {}",
                    self.planned,
                    unit.paths.len(),
                    unit.id
                );
            }
            Err(err) => {
                error!(id = %unit.id, "{err}");
                self.state.record_error(unit.id.as_str(), err.to_string());
            }
        }
    }
}

impl<C: TransferClient> TransferHooks for PipelineHooks<'_, '_, C> {
    fn before_start(&self, url: &str, path: &Path) {
        if self.show_urls {
            info!(url, file = %path.display(), "start downloading");
        } else {
            debug!(url, "start downloading");
        }
    }

    fn after_finish(&self, _url: &str, path: &Path) {
        let Some(shared) = self.state.unit_for(path) else {
            warn!(path = %path.display(), "finished transfer has no owning accession");
            return;
        };
        let Ok(mut unit) = shared.lock() else {
            return;
        };
        let provider = &self.pipeline.providers[unit.provider];
        if let Err(err) = provider.post_process(path, &mut unit, self.pipeline.toolkit) {
            warn!(id = %unit.id, file = %path.display(), "{err}");
            unit.fail(err.to_string());
        }
        self.settle(&shared, &mut unit);
    }

    fn after_failure(&self, _url: &str, path: &Path, err: &RepoError) {
        let Some(shared) = self.state.unit_for(path) else {
            return;
        };
        let Ok(mut unit) = shared.lock() else {
            return;
        };
        unit.fail(format!("{}: {err}", path.display()));
        self.settle(&shared, &mut unit);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::providers::PayloadKind;
    use crate::transfer::{TransferBody, TransferResponse};

    struct MemoryClient {
        files: HashMap<String, Vec<u8>>,
    }

    impl TransferClient for MemoryClient {
        fn open(&self, url: &str, _offset: u64) -> Result<TransferResponse, RepoError> {
            let body = self
                .files
                .get(url)
                .cloned()
                .ok_or_else(|| RepoError::Transfer(format!("{url} returned status 404")))?;
            Ok(TransferResponse::Body(TransferBody {
                total: Some(body.len() as u64),
                resumed: false,
                reader: Box::new(Cursor::new(body)),
            }))
        }
    }

    struct StubProvider {
        label: &'static str,
        known: Option<ValidationInfo>,
    }

    impl Provider for StubProvider {
        fn label(&self) -> &str {
            self.label
        }

        fn payload(&self) -> PayloadKind {
            PayloadKind::DirectPayload
        }

        fn resolve_metadata(&self, id: &AccessionId) -> Result<ValidationInfo, RepoError> {
            self.known.clone().ok_or_else(|| RepoError::RemoteNotFound {
                id: id.to_string(),
                source_label: self.label.to_string(),
                message: "unknown".to_string(),
            })
        }

        fn post_process(
            &self,
            _path: &Path,
            _unit: &mut DownloadUnit,
            _toolkit: &dyn Toolkit,
        ) -> Result<(), RepoError> {
            Ok(())
        }
    }

    struct NoTools;

    impl Toolkit for NoTools {
        fn md5sum(&self, path: &Path) -> Result<String, RepoError> {
            fs_util::md5_file(path)
        }

        fn check_archive(&self, _path: &Path) -> Result<bool, RepoError> {
            Ok(true)
        }

        fn decode_archive(&self, _archive: &Path) -> Result<Vec<PathBuf>, RepoError> {
            Err(RepoError::MissingTool("fasterq-dump".to_string()))
        }

        fn compress(&self, _path: &Path) -> Result<PathBuf, RepoError> {
            Err(RepoError::MissingTool("gzip".to_string()))
        }

        fn convert_cram(&self, _cram: &Path, _outputs: &[PathBuf]) -> Result<(), RepoError> {
            Err(RepoError::MissingTool("samtools".to_string()))
        }

        fn recount(&self, _files: &[PathBuf], _reads: i64, _bases: i64) -> Result<(), RepoError> {
            Ok(())
        }
    }

    fn paired_info(id: &str, sizes: [u64; 2]) -> ValidationInfo {
        ValidationInfo {
            id: id.to_string(),
            source: "stub".to_string(),
            urls: vec![
                format!("mem://{id}_1.fastq.gz"),
                format!("mem://{id}_2.fastq.gz"),
            ],
            read_count: 1,
            base_count: 2,
            files: vec![format!("{id}_1.fastq.gz"), format!("{id}_2.fastq.gz")],
            sizes: Some(sizes.iter().map(|size| Some(*size)).collect()),
            md5sums: None,
            metadata: None,
        }
    }

    fn client(id: &str) -> MemoryClient {
        MemoryClient {
            files: HashMap::from([
                (format!("mem://{id}_1.fastq.gz"), b"read-one".to_vec()),
                (format!("mem://{id}_2.fastq.gz"), b"read-two!".to_vec()),
            ]),
        }
    }

    fn stub(label: &'static str, known: Option<ValidationInfo>) -> Box<dyn Provider> {
        Box::new(StubProvider { label, known })
    }

    fn scratch() -> (tempfile::TempDir, ContentStore) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("repo")).unwrap();
        (temp, ContentStore::init(&root).unwrap())
    }

    #[test]
    fn falls_back_to_next_provider_and_commits_once() {
        let (temp, store) = scratch();
        let providers = vec![
            stub("A", None),
            stub("B", Some(paired_info("ERR1000", [8, 9]))),
        ];
        let engine = TransferEngine::new(client("ERR1000"), 2).with_submit_delay(Duration::ZERO);
        let pipeline =
            FetchPipeline::new(&store, &providers, &NoTools, engine, temp.path().join("tmp"));

        let report = pipeline
            .fetch(&["ERR1000".to_string()], &FetchOptions::default())
            .unwrap();

        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.queued, 1);
        assert_eq!(report.completed, 1);
        let id: AccessionId = "ERR1000".parse().unwrap();
        assert_eq!(store.read_files(&id).unwrap().len(), 2);
        assert_eq!(store.read_info(&id).unwrap().source, "stub");
        assert!(!temp.path().join("tmp/ERR1000_1.fastq.gz").exists());
    }

    #[test]
    fn failed_transfer_discards_unit() {
        let (temp, store) = scratch();
        let providers = vec![stub("A", Some(paired_info("ERR1000", [8, 9])))];
        let mut partial = client("ERR1000");
        partial.files.remove("mem://ERR1000_2.fastq.gz");
        let engine = TransferEngine::new(partial, 1)
            .with_retries(1)
            .with_submit_delay(Duration::ZERO);
        let pipeline =
            FetchPipeline::new(&store, &providers, &NoTools, engine, temp.path().join("tmp"));

        let report = pipeline
            .fetch(&["ERR1000".to_string()], &FetchOptions::default())
            .unwrap();

        assert_eq!(report.completed, 0);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].id, "ERR1000");
        assert!(report.unfinished.is_empty());
        assert!(!store.exists(&"ERR1000".parse().unwrap()));
    }

    #[test]
    fn plan_skips_comments_and_existing_entries() {
        let (temp, store) = scratch();
        let existing: AccessionId = "SRR014966".parse().unwrap();
        fs::create_dir_all(store.resolve_path(&existing).as_std_path()).unwrap();
        let providers: Vec<Box<dyn Provider>> = Vec::new();
        let engine = TransferEngine::new(client("x"), 1);
        let pipeline =
            FetchPipeline::new(&store, &providers, &NoTools, engine, temp.path().join("tmp"));
        let ids = ["#ERR1", "SRR014966", "ERR1000", "ERR2000", "XYZ1"]
            .map(String::from)
            .to_vec();

        let (queue, report) = pipeline.plan(
            &ids,
            &FetchOptions {
                reverse: true,
                count: Some(1),
                ..FetchOptions::default()
            },
        );
        assert_eq!(report.total, 5);
        assert_eq!(report.existed, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(queue, vec!["ERR2000".parse::<AccessionId>().unwrap()]);

        let (queue, report) = pipeline.plan(
            &ids,
            &FetchOptions {
                force: true,
                ..FetchOptions::default()
            },
        );
        assert_eq!(report.existed, 0);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn duplicate_ids_are_fetched_once() {
        let (temp, store) = scratch();
        let providers = vec![stub("A", Some(paired_info("ERR1000", [8, 9])))];
        let engine = TransferEngine::new(client("ERR1000"), 1).with_submit_delay(Duration::ZERO);
        let pipeline =
            FetchPipeline::new(&store, &providers, &NoTools, engine, temp.path().join("tmp"));

        let report = pipeline
            .fetch(
                &["ERR1000".to_string(), "err1000".to_string()],
                &FetchOptions::default(),
            )
            .unwrap();

        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.skipped, 1);
        assert_eq!(report.queued, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(
            store.read_files(&"ERR1000".parse().unwrap()).unwrap().len(),
            2
        );
    }

    struct RejectingProvider;

    impl Provider for RejectingProvider {
        fn label(&self) -> &str {
            "rejecting"
        }

        fn payload(&self) -> PayloadKind {
            PayloadKind::DirectPayload
        }

        fn resolve_metadata(&self, _id: &AccessionId) -> Result<ValidationInfo, RepoError> {
            Ok(paired_info("ERR1000", [8, 9]))
        }

        fn post_process(
            &self,
            path: &Path,
            _unit: &mut DownloadUnit,
            _toolkit: &dyn Toolkit,
        ) -> Result<(), RepoError> {
            Err(RepoError::ValidationMismatch(format!(
                "{} checksum does not match",
                path.display()
            )))
        }
    }

    #[test]
    fn post_process_failure_blocks_commit() {
        let (temp, store) = scratch();
        let providers: Vec<Box<dyn Provider>> = vec![Box::new(RejectingProvider)];
        let engine = TransferEngine::new(client("ERR1000"), 2).with_submit_delay(Duration::ZERO);
        let pipeline =
            FetchPipeline::new(&store, &providers, &NoTools, engine, temp.path().join("tmp"));

        let report = pipeline
            .fetch(&["ERR1000".to_string()], &FetchOptions::default())
            .unwrap();

        assert_eq!(report.queued, 1);
        assert_eq!(report.completed, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].reason.contains("checksum does not match"));
        assert!(report.unfinished.is_empty());
        assert!(!store.exists(&"ERR1000".parse().unwrap()));
        assert!(temp.path().join("tmp/ERR1000_1.fastq.gz").exists());
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLog {
        type Writer = CapturedLog;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn fetch_logged(show_urls: bool) -> String {
        let (temp, store) = scratch();
        let providers = vec![stub("A", Some(paired_info("ERR1000", [8, 9])))];
        let engine = TransferEngine::new(client("ERR1000"), 1).with_submit_delay(Duration::ZERO);
        let pipeline =
            FetchPipeline::new(&store, &providers, &NoTools, engine, temp.path().join("tmp"));
        let log = CapturedLog::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(log.clone())
            .finish();

        let options = FetchOptions {
            show_urls,
            ..FetchOptions::default()
        };
        let report = tracing::subscriber::with_default(subscriber, || {
            pipeline.fetch(&["ERR1000".to_string()], &options).unwrap()
        });
        assert!(report.is_clean(), "{report:?}");
        let bytes = log.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn show_urls_logs_downloads_at_info() {
        let shown = fetch_logged(true);
        assert!(shown.contains("mem://ERR1000_1.fastq.gz"), "{shown}");
        assert!(shown.contains("mem://ERR1000_2.fastq.gz"), "{shown}");

        let quiet = fetch_logged(false);
        assert!(!quiet.contains("mem://"), "{quiet}");
    }
}
