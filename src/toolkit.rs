use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::Command;

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use tracing::debug;

use crate::error::RepoError;
use crate::fs_util::{self, fs_err};

/// External tools used to verify and convert read files.
pub trait Toolkit: Send + Sync {
    fn md5sum(&self, path: &Path) -> Result<String, RepoError>;

    fn check_archive(&self, path: &Path) -> Result<bool, RepoError>;

    /// Decodes an SRA archive into `<archive>_1.fastq` / `<archive>_2.fastq`.
    fn decode_archive(&self, archive: &Path) -> Result<Vec<PathBuf>, RepoError>;

    /// Gzips `path` into `<path>.gz` and removes the original.
    fn compress(&self, path: &Path) -> Result<PathBuf, RepoError>;

    fn convert_cram(&self, cram: &Path, outputs: &[PathBuf]) -> Result<(), RepoError>;

    /// Fails with `ValidationMismatch` unless the files hold the expected
    /// read and base totals.
    fn recount(&self, files: &[PathBuf], read_count: i64, base_count: i64)
    -> Result<(), RepoError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileCounts {
    pub reads: u64,
    pub bases: u64,
}

#[derive(Debug, Clone)]
pub struct SystemToolkit {
    fasterq_dump: Option<PathBuf>,
    samtools: Option<PathBuf>,
    command_prefix: Vec<String>,
}

impl SystemToolkit {
    pub fn new(command_prefix: Vec<String>) -> Self {
        Self {
            fasterq_dump: find_in_path("fasterq-dump"),
            samtools: find_in_path("samtools"),
            command_prefix,
        }
    }

    fn run_cmd(&self, program: &Path, args: &[String]) -> Result<(), RepoError> {
        let mut cmd = match self.command_prefix.split_first() {
            Some((launcher, launcher_args)) => {
                let mut cmd = Command::new(launcher);
                cmd.args(launcher_args).arg(program);
                cmd
            }
            None => Command::new(program),
        };
        cmd.args(args);
        debug!(command = ?cmd, "running external tool");
        let output = cmd
            .output()
            .map_err(|err| RepoError::Tool(format!("{}: {err}", program.display())))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("command failed: {}", program.display())
        } else {
            stderr
        };
        Err(RepoError::Tool(message))
    }
}

impl Toolkit for SystemToolkit {
    fn md5sum(&self, path: &Path) -> Result<String, RepoError> {
        fs_util::md5_file(path)
    }

    fn check_archive(&self, path: &Path) -> Result<bool, RepoError> {
        fs_util::check_gzip(path)
    }

    fn decode_archive(&self, archive: &Path) -> Result<Vec<PathBuf>, RepoError> {
        let fasterq = self
            .fasterq_dump
            .as_ref()
            .ok_or_else(|| RepoError::MissingTool("fasterq-dump".to_string()))?;
        let work_dir = archive
            .parent()
            .ok_or_else(|| RepoError::Filesystem(format!("no parent for {}", archive.display())))?;
        let args = vec![
            "-O".to_string(),
            work_dir.to_string_lossy().to_string(),
            "-t".to_string(),
            work_dir.to_string_lossy().to_string(),
            archive.to_string_lossy().to_string(),
        ];
        self.run_cmd(fasterq, &args)?;

        let outputs = paired_outputs(archive, "fastq");
        for path in &outputs {
            if !path.exists() {
                return Err(RepoError::Tool(format!(
                    "fasterq-dump did not produce {}",
                    path.display()
                )));
            }
        }
        Ok(outputs)
    }

    fn compress(&self, path: &Path) -> Result<PathBuf, RepoError> {
        let mut target = path.as_os_str().to_owned();
        target.push(".gz");
        let target = PathBuf::from(target);

        let mut input = File::open(path).map_err(|err| fs_err(path, err))?;
        let output = File::create(&target).map_err(|err| fs_err(&target, err))?;
        let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
        io::copy(&mut input, &mut encoder).map_err(|err| fs_err(&target, err))?;
        encoder.finish().map_err(|err| fs_err(&target, err))?;
        fs::remove_file(path).map_err(|err| fs_err(path, err))?;
        Ok(target)
    }

    fn convert_cram(&self, cram: &Path, outputs: &[PathBuf]) -> Result<(), RepoError> {
        let samtools = self
            .samtools
            .as_ref()
            .ok_or_else(|| RepoError::MissingTool("samtools".to_string()))?;
        let [read1, read2] = outputs else {
            return Err(RepoError::Tool(
                "cram conversion needs exactly two outputs".to_string(),
            ));
        };
        let script = format!(
            "{tool} collate -u -f -O {cram} | {tool} fastq -1 {read1} -2 {read2} -0 /dev/null -s /dev/null -n",
            tool = samtools.display(),
            cram = cram.display(),
            read1 = read1.display(),
            read2 = read2.display(),
        );
        self.run_cmd(Path::new("bash"), &["-c".to_string(), script])
    }

    fn recount(
        &self,
        files: &[PathBuf],
        read_count: i64,
        base_count: i64,
    ) -> Result<(), RepoError> {
        let counts = files
            .iter()
            .map(|path| count_fastq(path))
            .collect::<Result<Vec<_>, _>>()?;
        for (path, counts) in files.iter().zip(&counts) {
            debug!(file = %path.display(), reads = counts.reads, bases = counts.bases, "recounted");
        }
        verify_counts(&counts, read_count, base_count)
    }
}

/// Counts records and bases of a gzipped four-line FASTQ file.
pub fn count_fastq(path: &Path) -> Result<FileCounts, RepoError> {
    let file = File::open(path).map_err(|err| fs_err(path, err))?;
    let reader = BufReader::new(MultiGzDecoder::new(file));
    let mut counts = FileCounts { reads: 0, bases: 0 };
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| fs_err(path, err))?;
        match idx % 4 {
            0 => counts.reads += 1,
            1 => counts.bases += line.trim_end().len() as u64,
            _ => {}
        }
    }
    Ok(counts)
}

/// Paired files must agree on read count; bases are summed over all files.
pub fn verify_counts(
    counts: &[FileCounts],
    read_count: i64,
    base_count: i64,
) -> Result<(), RepoError> {
    let Some(first) = counts.first() else {
        return Err(RepoError::ValidationMismatch(
            "no read files to count".to_string(),
        ));
    };
    let total_bases: u64 = counts.iter().map(|c| c.bases).sum();
    if i64::try_from(total_bases).ok() != Some(base_count) {
        return Err(RepoError::ValidationMismatch(format!(
            "total bases {total_bases} does not match {base_count}"
        )));
    }
    if counts.iter().any(|c| c.reads != first.reads) {
        return Err(RepoError::ValidationMismatch(
            "read counts are not identical for all fastq files".to_string(),
        ));
    }
    let reads = i64::try_from(first.reads).unwrap_or(i64::MAX);
    if reads != read_count && reads.saturating_mul(2) != read_count {
        return Err(RepoError::ValidationMismatch(format!(
            "read count {reads} does not match {read_count}"
        )));
    }
    Ok(())
}

/// `<base>_1.<ext>` and `<base>_2.<ext>` next to `base`.
pub fn paired_outputs(base: &Path, ext: &str) -> Vec<PathBuf> {
    [1, 2]
        .iter()
        .map(|idx| {
            let mut name = base.as_os_str().to_owned();
            name.push(format!("_{idx}.{ext}"));
            PathBuf::from(name)
        })
        .collect()
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::*;

    fn write_fastq_gz(path: &Path, records: &[&str]) {
        let file = File::create(path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::fast());
        for (idx, seq) in records.iter().enumerate() {
            write!(encoder, "@r{idx}\n{seq}\n+\n{}\n", "I".repeat(seq.len())).unwrap();
        }
        encoder.finish().unwrap();
    }

    #[test]
    fn recount_accepts_pairs() {
        let temp = tempfile::tempdir().unwrap();
        let r1 = temp.path().join("SRR1_1.fastq.gz");
        let r2 = temp.path().join("SRR1_2.fastq.gz");
        write_fastq_gz(&r1, &["ACGT", "ACG"]);
        write_fastq_gz(&r2, &["TTTT", "GG"]);

        let toolkit = SystemToolkit::new(Vec::new());
        toolkit.recount(&[r1.clone(), r2.clone()], 2, 13).unwrap();
        toolkit.recount(&[r1.clone(), r2.clone()], 4, 13).unwrap();
        let err = toolkit.recount(&[r1, r2], 2, 14).unwrap_err();
        assert_matches!(err, RepoError::ValidationMismatch(_));
    }

    #[test]
    fn verify_counts_rejects_unbalanced_pairs() {
        let counts = [
            FileCounts { reads: 2, bases: 10 },
            FileCounts { reads: 3, bases: 10 },
        ];
        assert_matches!(
            verify_counts(&counts, 2, 20),
            Err(RepoError::ValidationMismatch(_))
        );
    }

    #[test]
    fn compress_replaces_source() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("SRR1_1.fastq");
        fs::write(&path, b"@r\nAC\n+\nII\n").unwrap();

        let toolkit = SystemToolkit::new(Vec::new());
        let gz = toolkit.compress(&path).unwrap();

        assert_eq!(gz, temp.path().join("SRR1_1.fastq.gz"));
        assert!(!path.exists());
        assert_eq!(count_fastq(&gz).unwrap(), FileCounts { reads: 1, bases: 2 });
    }

    #[test]
    fn paired_output_names() {
        let outputs = paired_outputs(Path::new("/tmp/SRR1"), "fastq.gz");
        assert_eq!(
            outputs,
            vec![
                PathBuf::from("/tmp/SRR1_1.fastq.gz"),
                PathBuf::from("/tmp/SRR1_2.fastq.gz")
            ]
        );
    }
}
