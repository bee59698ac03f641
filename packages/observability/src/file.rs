//! Append-only log file output.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

/// `~/.ledgerflow/logs/engine.jsonl`, or `None` without a home directory.
pub fn default_log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ledgerflow").join("logs").join("engine.jsonl"))
}

/// Shared handle to an append-mode log file, flushed after every write.
#[derive(Clone)]
pub struct LogFileWriter {
    inner: Arc<Mutex<BufWriter<File>>>,
}

impl LogFileWriter {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(BufWriter::with_capacity(8192, file))),
        })
    }
}

impl io::Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock();
        let written = guard.write(buf)?;
        // One record per write; other processes tailing the file see whole lines.
        guard.flush()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// `MakeWriter` handing out clones of one [`LogFileWriter`].
#[derive(Clone)]
pub struct WriterFactory {
    writer: LogFileWriter,
}

impl WriterFactory {
    pub fn new(writer: LogFileWriter) -> Self {
        Self { writer }
    }
}

impl<'a> MakeWriter<'a> for WriterFactory {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_writer_appends_to_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.jsonl");
        std::fs::write(&path, "first\n").unwrap();

        let mut writer = LogFileWriter::open(&path).unwrap();
        writer.write_all(b"second\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_writer_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deeply").join("nested").join("engine.jsonl");

        assert!(LogFileWriter::open(&path).is_ok());
        assert!(path.exists());
    }

    #[test]
    fn test_factory_writers_share_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.jsonl");
        let factory = WriterFactory::new(LogFileWriter::open(&path).unwrap());

        factory.make_writer().write_all(b"a\n").unwrap();
        factory.make_writer().write_all(b"b\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
    }
}
