use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

use crate::error::RepoError;

/// Read and traverse only; entries stay in this mode outside a held lock.
pub const DIR_SECURE_MODE: u32 = 0o555;
pub const DIR_EDIT_MODE: u32 = 0o755;
pub const FILE_READONLY_MODE: u32 = 0o444;
const FILE_WRITABLE_MODE: u32 = 0o644;

const BLOCK_SIZE: usize = 128 * 1024;

pub fn fs_err(path: &Path, err: io::Error) -> RepoError {
    RepoError::Filesystem(format!("{}: {err}", path.display()))
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<(), RepoError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|err| fs_err(path, err))
}

#[cfg(not(unix))]
pub fn set_mode(path: &Path, mode: u32) -> Result<(), RepoError> {
    let mut perms = fs::metadata(path).map_err(|err| fs_err(path, err))?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms).map_err(|err| fs_err(path, err))
}

#[cfg(unix)]
pub fn mode_of(path: &Path) -> Result<u32, RepoError> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path).map_err(|err| fs_err(path, err))?;
    Ok(meta.permissions().mode() & 0o777)
}

/// Removes a (possibly read-only) file if present.
pub fn unlink_if_exists(path: &Path) -> Result<(), RepoError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() => {
            set_mode(path, FILE_WRITABLE_MODE)?;
            fs::remove_file(path).map_err(|err| fs_err(path, err))
        }
        Ok(_) => Err(RepoError::Filesystem(format!(
            "{} exists and is not a regular file",
            path.display()
        ))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(fs_err(path, err)),
    }
}

/// Renames `source` into `dest`, copying across filesystems when needed.
pub fn move_file(source: &Path, dest: &Path) -> Result<(), RepoError> {
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(source, dest).map_err(|err| fs_err(dest, err))?;
            fs::remove_file(source).map_err(|err| fs_err(source, err))
        }
        Err(err) => Err(fs_err(source, err)),
    }
}

/// Moves a file into `dir`, keeping its file name.
pub fn move_into(source: &Path, dir: &Path) -> Result<PathBuf, RepoError> {
    let name = source
        .file_name()
        .ok_or_else(|| RepoError::Filesystem(format!("invalid file name {}", source.display())))?;
    let dest = dir.join(name);
    move_file(source, &dest)?;
    Ok(dest)
}

pub fn md5_file(path: &Path) -> Result<String, RepoError> {
    let mut file = fs::File::open(path).map_err(|err| fs_err(path, err))?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let read = file.read(&mut buf).map_err(|err| fs_err(path, err))?;
        if read == 0 {
            break;
        }
        context.consume(&buf[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// Decompresses the whole stream; any framing or CRC error fails the check.
pub fn check_gzip(path: &Path) -> Result<bool, RepoError> {
    let file = fs::File::open(path).map_err(|err| fs_err(path, err))?;
    let mut decoder = MultiGzDecoder::new(file);
    match io::copy(&mut decoder, &mut io::sink()) {
        Ok(_) => Ok(true),
        Err(err) if matches!(err.kind(), io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof) => {
            Ok(false)
        }
        Err(err) => Err(fs_err(path, err)),
    }
}

pub fn file_name_str(path: &Path) -> Result<&str, RepoError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| RepoError::Filesystem(format!("invalid file name {}", path.display())))
}

pub fn is_storage_full(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded
    )
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    #[test]
    fn md5_of_known_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("hello.txt");
        fs::write(&path, b"hello").unwrap();
        assert_eq!(md5_file(&path).unwrap(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn gzip_check_detects_truncation() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("reads.fastq.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"@r1\nACGT\n+\nIIII\n").unwrap();
        let bytes = encoder.finish().unwrap();
        fs::write(&path, &bytes).unwrap();
        assert!(check_gzip(&path).unwrap());

        fs::write(&path, &bytes[..bytes.len() - 6]).unwrap();
        assert!(!check_gzip(&path).unwrap());
    }

    #[test]
    fn unlink_readonly_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("stale.fastq.gz");
        fs::write(&path, b"x").unwrap();
        set_mode(&path, FILE_READONLY_MODE).unwrap();
        unlink_if_exists(&path).unwrap();
        assert!(!path.exists());
        unlink_if_exists(&path).unwrap();
    }
}
