use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RepoError;

/// Validation metadata persisted next to the payload files of an entry.
///
/// `files`, `sizes` and `md5sums` are index-aligned. `sizes`/`md5sums` are
/// `None` when the source archive does not publish them, and individual
/// slots are `None` while the value is not yet known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationInfo {
    #[serde(alias = "sra_id")]
    pub id: String,
    pub source: String,
    pub urls: Vec<String>,
    pub read_count: i64,
    pub base_count: i64,
    pub files: Vec<String>,
    pub sizes: Option<Vec<Option<u64>>>,
    pub md5sums: Option<Vec<Option<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl ValidationInfo {
    fn index_of(&self, filename: &str) -> Option<usize> {
        self.files.iter().position(|name| name == filename)
    }

    pub fn size_of(&self, filename: &str) -> Option<u64> {
        let idx = self.index_of(filename)?;
        self.sizes.as_ref()?.get(idx).copied().flatten()
    }

    pub fn md5_of(&self, filename: &str) -> Option<&str> {
        let idx = self.index_of(filename)?;
        self.md5sums.as_ref()?.get(idx)?.as_deref()
    }

    pub fn set_size(&mut self, filename: &str, size: u64) -> Result<(), RepoError> {
        let idx = self.require_index(filename)?;
        let len = self.files.len();
        let sizes = self.sizes.get_or_insert_with(|| vec![None; len]);
        sizes[idx] = Some(size);
        Ok(())
    }

    pub fn set_md5(&mut self, filename: &str, md5sum: &str) -> Result<(), RepoError> {
        let idx = self.require_index(filename)?;
        let len = self.files.len();
        let md5sums = self.md5sums.get_or_insert_with(|| vec![None; len]);
        md5sums[idx] = Some(md5sum.to_string());
        Ok(())
    }

    /// Replaces the file list, marking every size and checksum as unknown.
    pub fn set_files(&mut self, files: Vec<String>) {
        let len = files.len();
        self.files = files;
        self.sizes = Some(vec![None; len]);
        self.md5sums = Some(vec![None; len]);
    }

    pub fn remove_file(&mut self, filename: &str) -> Result<(), RepoError> {
        let idx = self.require_index(filename)?;
        self.files.remove(idx);
        if let Some(sizes) = self.sizes.as_mut().filter(|sizes| idx < sizes.len()) {
            sizes.remove(idx);
        }
        if let Some(md5sums) = self.md5sums.as_mut().filter(|sums| idx < sums.len()) {
            md5sums.remove(idx);
        }
        Ok(())
    }

    /// Recomputes files, sizes and checksums from local files.
    pub fn refresh_from_files<P, F>(&mut self, paths: &[P], mut digest: F) -> Result<(), RepoError>
    where
        P: AsRef<Path>,
        F: FnMut(&Path) -> Result<String, RepoError>,
    {
        let mut files = Vec::with_capacity(paths.len());
        let mut sizes = Vec::with_capacity(paths.len());
        let mut md5sums = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let name = path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| RepoError::Filesystem(format!("invalid file name {}", path.display())))?;
            let size = fs::metadata(path)
                .map_err(|err| RepoError::Filesystem(format!("{}: {err}", path.display())))?
                .len();
            files.push(name.to_string());
            sizes.push(Some(size));
            md5sums.push(Some(digest(path)?));
        }
        self.files = files;
        self.sizes = Some(sizes);
        self.md5sums = Some(md5sums);
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, RepoError> {
        let content = fs::read_to_string(path)
            .map_err(|err| RepoError::Filesystem(format!("{}: {err}", path.display())))?;
        serde_json::from_str(&content).map_err(|err| RepoError::Filesystem(err.to_string()))
    }

    fn require_index(&self, filename: &str) -> Result<usize, RepoError> {
        self.index_of(filename).ok_or_else(|| {
            RepoError::ValidationMismatch(format!("{filename} is not listed for {}", self.id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ValidationInfo {
        ValidationInfo {
            id: "ERR1000".to_string(),
            source: "EBI/ENA".to_string(),
            urls: vec![
                "ftp.sra.ebi.ac.uk/ERR1000_1.fastq.gz".to_string(),
                "ftp.sra.ebi.ac.uk/ERR1000_2.fastq.gz".to_string(),
            ],
            read_count: 10,
            base_count: 1500,
            files: vec![
                "ERR1000_1.fastq.gz".to_string(),
                "ERR1000_2.fastq.gz".to_string(),
            ],
            sizes: Some(vec![Some(500), Some(600)]),
            md5sums: Some(vec![Some("aa".to_string()), Some("bb".to_string())]),
            metadata: None,
        }
    }

    #[test]
    fn lookup_by_filename() {
        let info = sample();
        assert_eq!(info.size_of("ERR1000_2.fastq.gz"), Some(600));
        assert_eq!(info.md5_of("ERR1000_1.fastq.gz"), Some("aa"));
        assert_eq!(info.size_of("ERR1000.fastq.gz"), None);
    }

    #[test]
    fn remove_file_keeps_columns_aligned() {
        let mut info = sample();
        info.remove_file("ERR1000_1.fastq.gz").unwrap();
        assert_eq!(info.files, vec!["ERR1000_2.fastq.gz".to_string()]);
        assert_eq!(info.sizes, Some(vec![Some(600)]));
        assert_eq!(info.md5_of("ERR1000_2.fastq.gz"), Some("bb"));
    }

    #[test]
    fn set_files_resets_sentinels() {
        let mut info = sample();
        info.sizes = None;
        info.md5sums = None;
        info.set_files(vec!["SRR1_1.fastq.gz".to_string()]);
        assert_eq!(info.sizes, Some(vec![None]));
        info.set_size("SRR1_1.fastq.gz", 42).unwrap();
        assert_eq!(info.size_of("SRR1_1.fastq.gz"), Some(42));
        assert!(info.set_md5("missing.fastq.gz", "cc").is_err());
    }

    #[test]
    fn accepts_legacy_sra_id_key() {
        let raw = r#"{"sra_id":"SRR1234","source":"NCBI/Entrez","urls":[],"read_count":1,
            "base_count":2,"files":[],"sizes":null,"md5sums":null}"#;
        let info: ValidationInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.id, "SRR1234");
        assert!(info.sizes.is_none());
    }
}
