// src/checkpoint.rs - Power-loss checkpoint record
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Single-record store of "lines consumed so far" for the active job.
///
/// The record lives at one fixed path and is rewritten in place, never
/// appended. It is deleted and recreated at the start of every job so the
/// filesystem does not reuse the same blocks indefinitely (eMMC wear).
#[derive(Debug, Clone)]
pub struct CheckpointJournal {
    path: PathBuf,
}

impl CheckpointJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete any stale record and open a fresh one. The returned guard
    /// closes the handle on every exit path, including abnormal breaks out
    /// of the streaming loop.
    pub fn open_for_job(&self) -> io::Result<JournalGuard> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.path)?;
        Ok(JournalGuard {
            file: Some(file),
            path: self.path.clone(),
        })
    }

    /// Remove the record entirely. Called on completion and cancel so the
    /// record is absent between jobs.
    pub fn remove(&self) -> io::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Read back the last persisted line count, if a record exists.
    pub fn read(&self) -> io::Result<Option<u64>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut contents = String::new();
        File::open(&self.path)?.read_to_string(&mut contents)?;
        match contents.trim().parse() {
            Ok(lines) => Ok(Some(lines)),
            Err(_) => Ok(None),
        }
    }
}

/// Open handle on the active job's record. Dropping it closes the file;
/// the record itself stays on disk for recovery unless explicitly removed.
#[derive(Debug)]
pub struct JournalGuard {
    file: Option<File>,
    path: PathBuf,
}

impl JournalGuard {
    /// Rewrite the record with the current line count, truncated to exactly
    /// the new content length.
    pub fn write(&mut self, lines_consumed: u64) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            let text = lines_consumed.to_string();
            file.seek(SeekFrom::Start(0))?;
            file.write_all(text.as_bytes())?;
            file.set_len(text.len() as u64)?;
            file.flush()?;
        }
        Ok(())
    }

    pub fn close(mut self) {
        self.file.take();
    }
}

impl Drop for JournalGuard {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            tracing::debug!("checkpoint record closed: {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_recreates_record() {
        let dir = tempfile::tempdir().unwrap();
        let journal = CheckpointJournal::new(dir.path().join("plr_record"));

        let mut guard = journal.open_for_job().unwrap();
        guard.write(120).unwrap();
        guard.close();
        assert_eq!(journal.read().unwrap(), Some(120));

        // A new job starts from an empty record, not the old contents.
        let guard = journal.open_for_job().unwrap();
        assert_eq!(journal.read().unwrap(), None);
        drop(guard);
    }

    #[test]
    fn write_truncates_to_new_length() {
        let dir = tempfile::tempdir().unwrap();
        let journal = CheckpointJournal::new(dir.path().join("plr_record"));

        let mut guard = journal.open_for_job().unwrap();
        guard.write(1000).unwrap();
        guard.write(5).unwrap();
        drop(guard);

        let contents = std::fs::read_to_string(journal.path()).unwrap();
        assert_eq!(contents, "5");
        assert_eq!(journal.read().unwrap(), Some(5));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let journal = CheckpointJournal::new(dir.path().join("plr_record"));

        journal.remove().unwrap();
        let mut guard = journal.open_for_job().unwrap();
        guard.write(50).unwrap();
        drop(guard);
        journal.remove().unwrap();
        journal.remove().unwrap();
        assert_eq!(journal.read().unwrap(), None);
    }
}
