// src/stager.rs - Staging and plate extraction for uploaded job files
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::task;

use crate::config::PathsConfig;
use crate::events::{EventBus, HostEvent};

/// Chunk size for streaming a plate entry out of the archive.
const EXTRACT_CHUNK_SIZE: usize = 10 * 1024 * 1024;

const ARCHIVE_EXT: &str = "3mf";
const GCODE_EXT: &str = "gcode";

#[derive(Debug, Error)]
pub enum StageError {
    #[error("insufficient disk space: {needed} bytes needed, {free} free")]
    InsufficientSpace { needed: u64, free: u64 },
    #[error("plate {0} not found in archive")]
    PlateMissing(u32),
    #[error("no staged file to resume")]
    NothingStaged,
    #[error("source file not found: {0}")]
    SourceMissing(PathBuf),
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("extraction task failed: {0}")]
    Join(#[from] task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Plain,
    MultiPlateArchive,
}

/// Canonical, execution-ready copy of a source file. At most one is active;
/// staging a new one evicts the previous staging area entirely.
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub path: PathBuf,
    pub size: u64,
    pub source: SourceKind,
    pub plate_index: u32,
}

/// Produces the staged `.gcode` file the job executor streams from.
///
/// Plain sources are copied verbatim into both the durable cache slot and the
/// volatile staging slot. Multi-plate archives are first cached, then the
/// requested plate entry is streamed out of the zip in bounded chunks.
pub struct FileStager {
    staging_dir: PathBuf,
    cache_dir: PathBuf,
    events: EventBus,
}

impl FileStager {
    pub fn new(paths: &PathsConfig, events: EventBus) -> Self {
        Self {
            staging_dir: paths.staging_dir.clone(),
            cache_dir: paths.cache_dir.clone(),
            events,
        }
    }

    /// Stage `source` for execution. With `extract` unset, no copying
    /// happens; the previously staged file is looked up instead (power-loss
    /// recovery re-attaches to it).
    pub async fn stage(
        &self,
        source: &Path,
        plate_index: u32,
        extract: bool,
    ) -> Result<StagedFile, StageError> {
        if !extract {
            return self.find_staged(plate_index).await;
        }
        if !source.is_file() {
            return Err(StageError::SourceMissing(source.to_path_buf()));
        }

        self.clean_slate().await?;

        let is_archive = source
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(ARCHIVE_EXT));

        let staged = if is_archive {
            self.stage_archive(source, plate_index).await?
        } else {
            self.stage_plain(source, plate_index).await?
        };

        tracing::info!(
            "staged {} ({} bytes, plate {})",
            staged.path.display(),
            staged.size,
            staged.plate_index
        );
        self.events.emit(HostEvent::FileStaged {
            path: staged.path.clone(),
            size: staged.size,
            plate_index: staged.plate_index,
        });
        Ok(staged)
    }

    /// Remove every entry in the staging and cache slots. Staging is always
    /// a clean slate, never additive.
    async fn clean_slate(&self) -> Result<(), StageError> {
        for dir in [&self.staging_dir, &self.cache_dir] {
            tokio::fs::create_dir_all(dir).await?;
            let mut entries = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    tokio::fs::remove_dir_all(&path).await?;
                } else {
                    tokio::fs::remove_file(&path).await?;
                }
            }
        }
        Ok(())
    }

    async fn stage_plain(
        &self,
        source: &Path,
        plate_index: u32,
    ) -> Result<StagedFile, StageError> {
        let name = source
            .file_name()
            .ok_or_else(|| StageError::SourceMissing(source.to_path_buf()))?;
        let size = tokio::fs::metadata(source).await?.len();

        let cache_target = self.cache_dir.join(name);
        ensure_free_space(&self.cache_dir, size)?;
        tokio::fs::copy(source, &cache_target).await?;

        let staging_target = self.staging_dir.join(name);
        ensure_free_space(&self.staging_dir, size)?;
        tokio::fs::copy(source, &staging_target).await?;

        Ok(StagedFile {
            path: staging_target,
            size,
            source: SourceKind::Plain,
            plate_index,
        })
    }

    async fn stage_archive(
        &self,
        source: &Path,
        plate_index: u32,
    ) -> Result<StagedFile, StageError> {
        let archive_size = tokio::fs::metadata(source).await?.len();

        // Audit copy of the whole archive into the cache slot first.
        let archive_name = source
            .file_name()
            .ok_or_else(|| StageError::SourceMissing(source.to_path_buf()))?;
        let cached_archive = self.cache_dir.join(archive_name);
        ensure_free_space(&self.cache_dir, archive_size)?;
        tokio::fs::copy(source, &cached_archive).await?;

        let staged_path = self.staging_dir.join(staged_name(source));
        ensure_free_space(&self.staging_dir, archive_size)?;

        // The zip reader is synchronous; stream the entry out on a blocking
        // thread in bounded chunks rather than loading it into memory.
        let dest = staged_path.clone();
        let size = task::spawn_blocking(move || {
            extract_plate(&cached_archive, plate_index, &dest)
        })
        .await??;

        Ok(StagedFile {
            path: staged_path,
            size,
            source: SourceKind::MultiPlateArchive,
            plate_index,
        })
    }

    /// Look up the already-staged `.gcode` file in the staging slot.
    async fn find_staged(&self, plate_index: u32) -> Result<StagedFile, StageError> {
        let mut entries = match tokio::fs::read_dir(&self.staging_dir).await {
            Ok(entries) => entries,
            Err(_) => return Err(StageError::NothingStaged),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_gcode = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(GCODE_EXT));
            if is_gcode && entry.file_type().await?.is_file() {
                let size = entry.metadata().await?.len();
                return Ok(StagedFile {
                    path,
                    size,
                    source: SourceKind::Plain,
                    plate_index,
                });
            }
        }
        Err(StageError::NothingStaged)
    }
}

/// Staged filename for an archive source: the `.3mf` suffix is stripped and
/// exactly one `.gcode` suffix guaranteed ("model.gcode.3mf" is not
/// double-suffixed).
fn staged_name(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(Path::new)
        .unwrap_or_else(|| Path::new("job"));
    let already_gcode = stem
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(GCODE_EXT));
    if already_gcode {
        stem.to_path_buf()
    } else {
        let mut name = stem.as_os_str().to_os_string();
        name.push(".");
        name.push(GCODE_EXT);
        PathBuf::from(name)
    }
}

/// Checked free-space validation before any copy begins.
fn ensure_free_space(dir: &Path, needed: u64) -> Result<(), StageError> {
    let free = fs2::available_space(dir)?;
    if needed >= free {
        return Err(StageError::InsufficientSpace { needed, free });
    }
    Ok(())
}

/// Stream `Metadata/plate_<N>.gcode` out of the archive into `dest`.
/// Returns the number of bytes written.
fn extract_plate(archive_path: &Path, plate_index: u32, dest: &Path) -> Result<u64, StageError> {
    let entry_name = format!("Metadata/plate_{plate_index}.gcode");
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut entry = match archive.by_name(&entry_name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(StageError::PlateMissing(plate_index));
        }
        Err(err) => return Err(err.into()),
    };

    let mut out = File::create(dest)?;
    let mut buf = vec![0u8; EXTRACT_CHUNK_SIZE];
    let mut written: u64 = 0;
    loop {
        let n = entry.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        written += n as u64;
    }
    out.flush()?;
    tracing::debug!(
        "extracted {entry_name} ({written} bytes) to {}",
        dest.display()
    );
    Ok(written)
}
