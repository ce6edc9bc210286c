use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::NamedTempFile;
use tracing::debug;

/// Compression reads the raw spool in chunks of this size.
const GZIP_CHUNK: usize = 1024 * 1024;

/// Per-task scratch files under the process output directory: the raw
/// response body and its gzip sibling. Both are deleted when the spool is
/// dropped, whatever path execution took.
pub struct TaskSpool {
    raw: NamedTempFile,
    gz: NamedTempFile,
    root: PathBuf,
}

impl TaskSpool {
    pub fn create(output_dir: &Path, task_id: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(output_dir)?;
        let raw = tempfile::Builder::new()
            .prefix(&format!("output_file{task_id}"))
            .suffix(".txt")
            .tempfile_in(output_dir)?;
        let gz = tempfile::Builder::new()
            .prefix(&format!("output_file_zip{task_id}"))
            .suffix(".zip")
            .tempfile_in(output_dir)?;
        Ok(Self {
            raw,
            gz,
            root: output_dir.canonicalize()?,
        })
    }

    pub fn raw_path(&self) -> &Path {
        self.raw.path()
    }

    pub fn gz_path(&self) -> &Path {
        self.gz.path()
    }

    pub fn raw_size(&self) -> std::io::Result<u64> {
        std::fs::metadata(self.raw.path()).map(|m| m.len())
    }

    pub fn read_raw(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.raw.path())
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    /// Gzip the raw file into the sibling, chunk by chunk. Blocking; run it
    /// on the blocking pool.
    pub fn compress(&self) -> std::io::Result<()> {
        gzip_file(self.raw.path(), self.gz.path(), &self.root)
    }
}

/// Gzip `src` into `dest` in fixed-size chunks. Both paths must resolve
/// inside `root`; anything else is rejected before a byte is read.
pub(crate) fn gzip_file(src: &Path, dest: &Path, root: &Path) -> std::io::Result<()> {
    for path in [src, dest] {
        let resolved = path.canonicalize()?;
        if !resolved.starts_with(root) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} escapes the spool root", path.display()),
            ));
        }
    }

    let mut input = std::fs::File::open(src)?;
    let mut encoder = GzEncoder::new(std::fs::File::create(dest)?, Compression::default());
    let mut buf = vec![0u8; GZIP_CHUNK];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n])?;
    }
    encoder.finish()?.sync_all()?;
    debug!(src = %src.display(), dest = %dest.display(), "compressed response body");
    Ok(())
}

/// Bundle a directory into a `.tar.gz` at `dest`. Used for fetch-logs tasks
/// to ship the whole log directory.
pub fn archive_dir_gz(src_dir: &Path, dest: &Path) -> std::io::Result<()> {
    let encoder = GzEncoder::new(std::fs::File::create(dest)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", src_dir)?;
    builder.into_inner()?.finish()?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    #[test]
    fn files_are_deleted_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let (raw, gz) = {
            let spool = TaskSpool::create(dir.path(), "t1").unwrap();
            assert!(spool.raw_path().exists());
            assert!(spool.gz_path().exists());
            (
                spool.raw_path().to_path_buf(),
                spool.gz_path().to_path_buf(),
            )
        };
        assert!(!raw.exists());
        assert!(!gz.exists());
    }

    #[test]
    fn compress_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let spool = TaskSpool::create(dir.path(), "t1").unwrap();
        let body = vec![0x41u8; 1024 * 1024];
        std::fs::write(spool.raw_path(), &body).unwrap();

        spool.compress().unwrap();

        // A megabyte of 'A' compresses far below the inline threshold.
        assert!(std::fs::metadata(spool.gz_path()).unwrap().len() < 10 * 1024);

        let mut decoded = Vec::new();
        GzDecoder::new(std::fs::File::open(spool.gz_path()).unwrap())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn gzip_rejects_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let src = other.path().join("input.txt");
        std::fs::write(&src, b"data").unwrap();
        let dest = other.path().join("out.gz");
        std::fs::write(&dest, b"").unwrap();

        let err = gzip_file(&src, &dest, &dir.path().canonicalize().unwrap()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn archives_a_directory() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("app.log"), b"line\n").unwrap();
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("logs.tar.gz");

        archive_dir_gz(src.path(), &dest).unwrap();
        assert!(std::fs::metadata(&dest).unwrap().len() > 0);
    }
}
