//! A write-through file log. Before every write it checks whether the
//! current target has been rotated out from under it (inode change or
//! the file vanishing) and reopens if so. Writing also always goes
//! through the `log` facade crate so an embedding binary's own
//! subscriber (`env_logger` or otherwise) sees the same line.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::DaemonError;

pub struct FileLog {
    path: Option<PathBuf>,
    file: Option<std::fs::File>,
    inode: Option<u64>,
}

impl FileLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        FileLog {
            path,
            file: None,
            inode: None,
        }
    }

    fn needs_reopen(&self) -> bool {
        let Some(path) = &self.path else { return false };
        match (std::fs::metadata(path), self.inode) {
            (Ok(meta), Some(known)) => meta.ino() != known,
            (Ok(_), None) => self.file.is_none(),
            (Err(_), _) => true,
        }
    }

    fn reopen(&mut self) -> Result<(), DaemonError> {
        let Some(path) = self.path.clone() else { return Ok(()) };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DaemonError::Clean(format!("cannot open log file {}: {}", path.display(), e)))?;
        self.inode = Some(
            file.metadata()
                .map_err(|e| DaemonError::Clean(format!("cannot stat log file: {}", e)))?
                .ino(),
        );
        self.file = Some(file);
        Ok(())
    }

    /// Writes `message` at `level`, reopening the target file first if it
    /// was rotated or removed underneath us. Always also forwards to the
    /// `log` facade so console/aggregator subscribers see the line too.
    pub fn write_line(&mut self, level: log::Level, message: &str) -> Result<(), DaemonError> {
        if self.needs_reopen() {
            self.reopen()?;
        }
        if let Some(file) = self.file.as_mut() {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            writeln!(file, "[{}] {} {}", now, level, message)
                .map_err(|e| DaemonError::Transient(format!("log write failed: {}", e)))?;
        }
        log::log!(level, "{}", message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopens_after_the_target_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        let mut log = FileLog::new(Some(path.clone()));
        log.write_line(log::Level::Info, "first").unwrap();
        assert!(log.inode.is_some());

        std::fs::remove_file(&path).unwrap();
        log.write_line(log::Level::Info, "second").unwrap();
        assert!(path.exists());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("second"));
        assert!(!contents.contains("first"));
    }

    #[test]
    fn no_path_configured_is_a_silent_no_op() {
        let mut log = FileLog::new(None);
        assert!(log.write_line(log::Level::Debug, "ignored").is_ok());
    }
}
