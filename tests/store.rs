use std::fs;
use std::path::{Path, PathBuf};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use sra_repo::domain::AccessionId;
use sra_repo::error::{Missing, RepoError};
use sra_repo::info::ValidationInfo;
use sra_repo::store::{ContentStore, LinkKind, Placement, SIDECAR_NAME};

fn temp_store() -> (tempfile::TempDir, ContentStore) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("repo")).unwrap();
    let store = ContentStore::init(&root).unwrap();
    (temp, store)
}

fn write_reads(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn info_for(id: &str, files: &[(&str, u64)]) -> ValidationInfo {
    ValidationInfo {
        id: id.to_string(),
        source: "EBI/ENA".to_string(),
        urls: files
            .iter()
            .map(|(name, _)| format!("ftp://ftp.sra.ebi.ac.uk/vol1/fastq/{id}/{name}"))
            .collect(),
        read_count: 10,
        base_count: 1000,
        files: files.iter().map(|(name, _)| name.to_string()).collect(),
        sizes: Some(files.iter().map(|(_, size)| Some(*size)).collect()),
        md5sums: Some(vec![None; files.len()]),
        metadata: None,
    }
}

#[test]
fn commit_then_link_out_reports_conflicts_on_second_run() {
    let (temp, store) = temp_store();
    let staging = temp.path().join("staging");
    fs::create_dir_all(&staging).unwrap();
    let id: AccessionId = "ERR1000".parse().unwrap();

    let files = vec![
        write_reads(&staging, "ERR1000_1.fastq.gz", b"first mate"),
        write_reads(&staging, "ERR1000_2.fastq.gz", b"second mate!"),
    ];
    let info = info_for(
        "ERR1000",
        &[("ERR1000_1.fastq.gz", 10), ("ERR1000_2.fastq.gz", 12)],
    );

    let placed = store.commit(&id, &files, &info, Placement::Move).unwrap();
    assert_eq!(placed.len(), 2);
    assert!(placed[0].ends_with("10/00/ERR1000/ERR1000_1.fastq.gz"));
    assert!(!files[0].exists());
    assert_eq!(store.read_info(&id).unwrap(), info);
    assert_eq!(store.read_files(&id).unwrap(), placed);

    let outdir = temp.path().join("out");
    fs::create_dir_all(&outdir).unwrap();
    let first = store
        .link_out(&id, &outdir, LinkKind::Symbolic, false)
        .unwrap();
    assert_eq!(
        first.linked,
        vec!["ERR1000_1.fastq.gz", "ERR1000_2.fastq.gz"]
    );
    assert!(first.conflicts.is_empty());
    assert_eq!(
        fs::read(outdir.join("ERR1000_2.fastq.gz")).unwrap(),
        b"second mate!"
    );

    let second = store
        .link_out(&id, &outdir, LinkKind::Symbolic, false)
        .unwrap();
    assert!(second.linked.is_empty());
    assert_eq!(
        second.conflicts,
        vec!["ERR1000_1.fastq.gz", "ERR1000_2.fastq.gz"]
    );
}

#[test]
fn dryrun_link_creates_nothing() {
    let (temp, store) = temp_store();
    let staging = temp.path().join("staging");
    fs::create_dir_all(&staging).unwrap();
    let id: AccessionId = "SRR014966".parse().unwrap();
    let files = vec![write_reads(&staging, "SRR014966_1.fastq.gz", b"reads")];
    let info = info_for("SRR014966", &[("SRR014966_1.fastq.gz", 5)]);
    store.commit(&id, &files, &info, Placement::Copy).unwrap();

    let outdir = temp.path().join("out");
    fs::create_dir_all(&outdir).unwrap();
    let report = store.link_out(&id, &outdir, LinkKind::Hard, true).unwrap();
    assert_eq!(report.linked, vec!["SRR014966_1.fastq.gz"]);
    assert!(!outdir.join("SRR014966_1.fastq.gz").exists());
}

#[test]
fn sidecar_round_trip_keeps_unknown_slots() {
    let (temp, store) = temp_store();
    let staging = temp.path().join("staging");
    fs::create_dir_all(&staging).unwrap();
    let id: AccessionId = "SRR014966".parse().unwrap();
    let files = vec![write_reads(&staging, "SRR014966_1.fastq.gz", b"reads")];
    store
        .commit(
            &id,
            &files,
            &info_for("SRR014966", &[("SRR014966_1.fastq.gz", 5)]),
            Placement::Copy,
        )
        .unwrap();

    let mut info = info_for("SRR014966", &[("SRR014966_1.fastq.gz", 5)]);
    info.files.push("SRR014966_2.fastq.gz".to_string());
    info.sizes.as_mut().unwrap().push(None);
    info.md5sums = None;
    store.write_info(&id, &info).unwrap();

    let raw = fs::read_to_string(store.sidecar_path(&id).as_std_path()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["sizes"], serde_json::json!([5, null]));
    assert!(json["md5sums"].is_null());
    assert_eq!(store.read_info(&id).unwrap(), info);
}

#[test]
fn recommitting_replaces_stale_files() {
    let (temp, store) = temp_store();
    let staging = temp.path().join("staging");
    fs::create_dir_all(&staging).unwrap();
    let id: AccessionId = "ERR1000".parse().unwrap();
    let info = info_for("ERR1000", &[("ERR1000_1.fastq.gz", 4)]);

    let files = vec![write_reads(&staging, "ERR1000_1.fastq.gz", b"old!")];
    store.commit(&id, &files, &info, Placement::Copy).unwrap();
    fs::write(&files[0], b"new!").unwrap();
    let placed = store.commit(&id, &files, &info, Placement::Copy).unwrap();

    assert_eq!(fs::read(&placed[0]).unwrap(), b"new!");
    assert_eq!(store.read_files(&id).unwrap().len(), 1);
}

#[test]
fn commit_rejects_mismatched_payload_before_touching_store() {
    let (temp, store) = temp_store();
    let staging = temp.path().join("staging");
    fs::create_dir_all(&staging).unwrap();
    let id: AccessionId = "ERR1000".parse().unwrap();

    let wrong_size = vec![write_reads(&staging, "ERR1000_1.fastq.gz", b"12345")];
    let info = info_for("ERR1000", &[("ERR1000_1.fastq.gz", 99)]);
    assert_matches!(
        store.commit(&id, &wrong_size, &info, Placement::Move),
        Err(RepoError::ValidationMismatch(_))
    );
    assert!(wrong_size[0].exists());

    let unpaired = vec![write_reads(&staging, "ERR1000.fastq.gz", b"12345")];
    let info = info_for("ERR1000", &[("ERR1000.fastq.gz", 5)]);
    assert_matches!(
        store.commit(&id, &unpaired, &info, Placement::Move),
        Err(RepoError::ValidationMismatch(_))
    );
    assert!(!store.exists(&id));
}

#[test]
fn check_requires_payload_files() {
    let (_temp, store) = temp_store();
    let toolkit = sra_repo::toolkit::SystemToolkit::new(Vec::new());
    let id: AccessionId = "SRR123456".parse().unwrap();
    assert_matches!(
        store.check(&id, false, &toolkit),
        Err(RepoError::NotFound {
            missing: Missing::Entry,
            ..
        })
    );

    fs::create_dir_all(store.resolve_path(&id).as_std_path()).unwrap();
    assert_matches!(
        store.check(&id, false, &toolkit),
        Err(RepoError::ValidationMismatch(_))
    );
}

#[cfg(unix)]
#[test]
fn entries_return_to_secure_mode() {
    use sra_repo::fs_util::mode_of;

    let (temp, store) = temp_store();
    let staging = temp.path().join("staging");
    fs::create_dir_all(&staging).unwrap();
    let id: AccessionId = "ERR1000".parse().unwrap();
    let files = vec![write_reads(&staging, "ERR1000_1.fastq.gz", b"reads")];
    let info = info_for("ERR1000", &[("ERR1000_1.fastq.gz", 5)]);

    let placed = store.commit(&id, &files, &info, Placement::Copy).unwrap();
    let dir = store.resolve_path(&id).into_std_path_buf();
    assert_eq!(mode_of(&dir).unwrap(), 0o555);
    assert_eq!(mode_of(&placed[0]).unwrap(), 0o444);
    assert_eq!(mode_of(&dir.join(SIDECAR_NAME)).unwrap(), 0o444);

    let bad = info_for("ERR1000", &[("ERR1000_1.fastq.gz", 7)]);
    assert!(store.commit(&id, &files, &bad, Placement::Copy).is_err());
    assert_eq!(mode_of(&dir).unwrap(), 0o555);

    store.write_info(&id, &info).unwrap();
    assert_eq!(mode_of(&dir).unwrap(), 0o555);
    assert_eq!(store.fix_permissions(&id).unwrap(), 2);
    assert_eq!(mode_of(&dir).unwrap(), 0o555);
}
