// src/executor.rs - Background streaming dispatcher for the active job
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::checkpoint::CheckpointJournal;
use crate::config::Config;
use crate::events::{EventBus, HostEvent};
use crate::interpreter::{CommandInterpreter, DispatchLock, HeaterWaits, PositionHandle};
use crate::stager::StagedFile;

/// Safety shutdown dispatched on error when the host has heaters and no
/// explicit on-error sequence is configured.
const DEFAULT_ERROR_GCODE: &str = "TURN_OFF_HEATERS";

/// How long the pause drain sleeps between polls of the worker task.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum JobError {
    #[error("SD busy")]
    Busy,
    #[error("no file loaded")]
    NoFile,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Staging,
    Running,
    Paused,
    Completed,
    Errored,
}

/// Snapshot for external observers.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job_id: Option<Uuid>,
    pub state: JobState,
    pub staged_path: Option<PathBuf>,
    pub byte_offset: u64,
    pub total_size: u64,
    pub progress: f64,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
struct JobMeta {
    id: Uuid,
    path: PathBuf,
}

struct Settings {
    chunk_size: usize,
    checkpoint_every_lines: u64,
    contention_backoff: Duration,
    pre_check_gcode: Option<String>,
    on_error_gcode: Option<String>,
}

/// Owner of the single active streaming job.
///
/// The streaming loop runs as one background tokio task per job. It reads the
/// staged file in chunks, splits it into lines and dispatches each line to
/// the interpreter under the shared dispatch mutex, committing the byte
/// cursor only after a line is accepted. A pause request is a flag observed
/// between lines, never a preemption.
pub struct JobExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Settings,
    interpreter: Arc<dyn CommandInterpreter>,
    heaters: Arc<dyn HeaterWaits>,
    lock: DispatchLock,
    journal: CheckpointJournal,
    events: EventBus,

    state: RwLock<JobState>,
    meta: RwLock<Option<JobMeta>>,
    file: Mutex<Option<tokio::fs::File>>,
    worker: StdMutex<Option<JoinHandle<()>>>,

    /// Last committed position: a line fully dispatched without error.
    position: AtomicU64,
    /// Pending dispatch offset, shared with the interpreter so a dispatched
    /// command can reposition the stream.
    next_position: PositionHandle,
    file_size: AtomicU64,
    lines_consumed: AtomicU64,

    /// Request-to-stop flag observed by the loop between lines.
    must_pause: AtomicBool,
    /// The pre-check routine runs at most once per staged file.
    pre_check_done: AtomicBool,
}

impl JobExecutor {
    pub fn new(
        config: &Config,
        interpreter: Arc<dyn CommandInterpreter>,
        heaters: Arc<dyn HeaterWaits>,
        lock: DispatchLock,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings: Settings {
                    chunk_size: config.job.chunk_size,
                    checkpoint_every_lines: config.job.checkpoint_every_lines,
                    contention_backoff: Duration::from_millis(config.job.contention_backoff_ms),
                    pre_check_gcode: config.job.pre_check_gcode.clone(),
                    on_error_gcode: config.job.on_error_gcode.clone(),
                },
                interpreter,
                heaters,
                lock,
                journal: CheckpointJournal::new(&config.paths.checkpoint_file),
                events,
                state: RwLock::new(JobState::Idle),
                meta: RwLock::new(None),
                file: Mutex::new(None),
                worker: StdMutex::new(None),
                position: AtomicU64::new(0),
                next_position: PositionHandle::new(),
                file_size: AtomicU64::new(0),
                lines_consumed: AtomicU64::new(0),
                must_pause: AtomicBool::new(false),
                pre_check_done: AtomicBool::new(false),
            }),
        }
    }

    /// Handle by which interpreter command handlers reposition the stream
    /// mid-dispatch (M26-style seeks).
    pub fn position_handle(&self) -> PositionHandle {
        self.inner.next_position.clone()
    }

    pub fn is_active(&self) -> bool {
        let worker = self.inner.worker.lock().unwrap_or_else(|e| e.into_inner());
        worker.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Take ownership of a freshly staged file. Any previous job state is
    /// discarded first.
    pub async fn load(&self, staged: StagedFile) -> Result<(), JobError> {
        if self.is_active() {
            return Err(JobError::Busy);
        }
        self.reset().await?;

        let file = tokio::fs::File::open(&staged.path).await?;
        let id = Uuid::new_v4();
        self.inner.file_size.store(staged.size, Ordering::SeqCst);
        *self.inner.file.lock().await = Some(file);
        *self.inner.meta.write().unwrap_or_else(|e| e.into_inner()) = Some(JobMeta {
            id,
            path: staged.path.clone(),
        });
        self.set_state(JobState::Staging);

        tracing::info!(
            "loaded {} ({} bytes) as job {id}",
            staged.path.display(),
            staged.size
        );
        self.inner.events.emit(HostEvent::Response(format!(
            "File opened:{} Size:{}",
            staged.path.display(),
            staged.size
        )));
        Ok(())
    }

    /// Begin (or continue) streaming. With `verify` set, the configured
    /// pre-check routine runs once before the stream is entered.
    pub async fn start(&self, verify: bool) -> Result<(), JobError> {
        if !verify {
            self.inner.pre_check_done.store(true, Ordering::SeqCst);
        }
        self.spawn_worker().await
    }

    /// Continue a paused job from the exact committed byte offset.
    pub async fn resume(&self) -> Result<(), JobError> {
        self.spawn_worker().await
    }

    /// Request the loop to stop between lines and wait until it actually
    /// has. Skips the wait when invoked from inside the worker task itself
    /// (a dispatched pause command), which would otherwise deadlock on its
    /// own loop.
    pub async fn pause(&self) {
        if !self.is_active() {
            return;
        }
        self.inner.must_pause.store(true, Ordering::SeqCst);
        let worker_id = {
            let worker = self.inner.worker.lock().unwrap_or_else(|e| e.into_inner());
            worker.as_ref().map(|handle| handle.id())
        };
        if worker_id.is_some() && tokio::task::try_id() == worker_id {
            return;
        }
        while self.is_active() {
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
        }
    }

    /// Abort the job entirely: interrupt collaborator waits, drain the loop,
    /// close the staged file and return to Idle.
    pub async fn cancel(&self) -> Result<(), JobError> {
        self.inner.interpreter.abort_waits();
        self.inner.heaters.abort_waits();
        self.pause().await;
        self.reset().await
    }

    /// Move the committed cursor while no job is streaming (M26).
    pub async fn reposition(&self, byte_offset: u64) -> Result<(), JobError> {
        if self.is_active() {
            return Err(JobError::Busy);
        }
        if self.inner.file.lock().await.is_none() {
            return Err(JobError::NoFile);
        }
        self.inner.position.store(byte_offset, Ordering::SeqCst);
        self.inner.next_position.set(byte_offset);
        Ok(())
    }

    pub fn status(&self) -> JobStatus {
        let meta = self
            .inner
            .meta
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let byte_offset = self.inner.position.load(Ordering::SeqCst);
        let total_size = self.inner.file_size.load(Ordering::SeqCst);
        let progress = if total_size > 0 {
            byte_offset as f64 / total_size as f64
        } else {
            0.0
        };
        JobStatus {
            job_id: meta.as_ref().map(|m| m.id),
            state: *self.inner.state.read().unwrap_or_else(|e| e.into_inner()),
            staged_path: meta.map(|m| m.path),
            byte_offset,
            total_size,
            progress,
            is_active: self.is_active(),
        }
    }

    /// Close the staged file, clear the cursor and drop back to Idle. Must
    /// not be called while the worker is active; `cancel` drains it first.
    async fn reset(&self) -> Result<(), JobError> {
        self.inner.file.lock().await.take();
        *self.inner.meta.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.inner.position.store(0, Ordering::SeqCst);
        self.inner.next_position.set(0);
        self.inner.file_size.store(0, Ordering::SeqCst);
        self.inner.lines_consumed.store(0, Ordering::SeqCst);
        self.inner.must_pause.store(false, Ordering::SeqCst);
        self.inner.pre_check_done.store(false, Ordering::SeqCst);
        if let Err(err) = self.inner.journal.remove() {
            tracing::warn!("failed to remove checkpoint record: {err}");
        }
        self.set_state(JobState::Idle);
        Ok(())
    }

    async fn spawn_worker(&self) -> Result<(), JobError> {
        if self.is_active() {
            return Err(JobError::Busy);
        }
        if self.inner.file.lock().await.is_none() {
            return Err(JobError::NoFile);
        }
        self.inner.must_pause.store(false, Ordering::SeqCst);
        self.set_state(JobState::Running);

        let job_id = self
            .inner
            .meta
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|m| m.id);
        if let Some(id) = job_id {
            self.inner.events.emit(HostEvent::JobStarted { job_id: id });
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            work_loop(inner).await;
        });
        *self.inner.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    fn set_state(&self, state: JobState) {
        *self.inner.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

enum ExitReason {
    Completed,
    Errored(String),
    Suspended, // pause request or IO fault; job stays recoverable
}

/// The streaming loop. Runs as a background task until EOF, dispatch error,
/// IO fault or a pause request.
async fn work_loop(inner: Arc<Inner>) {
    let job_id = inner
        .meta
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
        .map(|m| m.id);
    let start_position = inner.position.load(Ordering::SeqCst);
    tracing::info!("starting stream at byte {start_position}");

    let mut file_slot = inner.file.lock().await;
    let reason = stream_lines(&inner, &mut file_slot, start_position).await;
    // The state below is finalized while the file mutex is still held, so a
    // concurrent reset cannot interleave with a winding-down loop.

    match reason {
        ExitReason::Completed => {
            file_slot.take();
            inner.lines_consumed.store(0, Ordering::SeqCst);
            if let Err(err) = inner.journal.remove() {
                tracing::warn!("failed to remove checkpoint record: {err}");
            }
            tracing::info!("finished stream");
            inner.events.emit(HostEvent::Response("Done printing file".into()));
            if let Some(id) = job_id {
                inner.events.emit(HostEvent::JobCompleted { job_id: id });
            }
            *inner.state.write().unwrap_or_else(|e| e.into_inner()) = JobState::Completed;
        }
        ExitReason::Errored(message) => {
            // The staged file stays open for diagnostics.
            tracing::error!("stream errored: {message}");
            inner
                .events
                .emit(HostEvent::Response(format!("!! {message}")));
            if let Some(id) = job_id {
                inner
                    .events
                    .emit(HostEvent::JobErrored { job_id: id, message });
            }
            *inner.state.write().unwrap_or_else(|e| e.into_inner()) = JobState::Errored;
        }
        ExitReason::Suspended => {
            tracing::info!(
                "exiting stream at byte {}",
                inner.position.load(Ordering::SeqCst)
            );
            *inner.state.write().unwrap_or_else(|e| e.into_inner()) = JobState::Paused;
        }
    }
}

async fn stream_lines(
    inner: &Arc<Inner>,
    file_slot: &mut Option<tokio::fs::File>,
    start_position: u64,
) -> ExitReason {
    let file_size = inner.file_size.load(Ordering::SeqCst);
    if start_position > file_size {
        inner.events.emit(HostEvent::Response(
            "!! stream position beyond end of file".into(),
        ));
        return ExitReason::Suspended;
    }
    let Some(file) = file_slot.as_mut() else {
        return ExitReason::Suspended;
    };
    if let Err(err) = file.seek(SeekFrom::Start(start_position)).await {
        tracing::error!("seek failed: {err}");
        return ExitReason::Suspended;
    }

    // Verification routine, once per staged file, before the stream.
    if let Some(script) = inner.settings.pre_check_gcode.clone() {
        if !inner.pre_check_done.load(Ordering::SeqCst) {
            if let Err(err) = dispatch_script(inner, &script).await {
                let message = format!("pre-check failed: {err}");
                run_on_error_sequence(inner).await;
                return ExitReason::Errored(message);
            }
            inner.pre_check_done.store(true, Ordering::SeqCst);
        }
    }

    // Recreate the checkpoint record for this run. A journal fault degrades
    // to streaming without power-loss protection rather than refusing to
    // print.
    let mut journal = match inner.journal.open_for_job() {
        Ok(guard) => Some(guard),
        Err(err) => {
            tracing::warn!("checkpoint journal unavailable: {err}");
            None
        }
    };

    let mut partial: Vec<u8> = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    let mut buf = vec![0u8; inner.settings.chunk_size];

    while !inner.must_pause.load(Ordering::SeqCst) {
        if lines.is_empty() {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    tracing::error!("stream read failed: {err}");
                    inner
                        .events
                        .emit(HostEvent::Response(format!("!! stream read fault: {err}")));
                    return ExitReason::Suspended;
                }
            };
            if n == 0 {
                if partial.is_empty() {
                    return ExitReason::Completed;
                }
                // Final unterminated line.
                lines.push(String::from_utf8_lossy(&partial).into_owned());
                partial.clear();
            } else {
                let mut chunk = std::mem::take(&mut partial);
                chunk.extend_from_slice(&buf[..n]);
                let mut parts: Vec<Vec<u8>> =
                    chunk.split(|&b| b == b'\n').map(|part| part.to_vec()).collect();
                partial = parts.pop().unwrap_or_default();
                lines = parts
                    .into_iter()
                    .rev()
                    .map(|part| String::from_utf8_lossy(&part).into_owned())
                    .collect();
                tokio::task::yield_now().await;
                continue;
            }
        }

        // Another producer holds the interpreter: back off without
        // consuming the line.
        let Some(guard) = inner.lock.try_acquire() else {
            tokio::time::sleep(inner.settings.contention_backoff).await;
            continue;
        };
        let Some(line) = lines.pop() else {
            continue;
        };

        let position = inner.position.load(Ordering::SeqCst);
        let naive_next = (position + line.len() as u64 + 1).min(file_size);
        inner.next_position.set(naive_next);

        let result = inner.interpreter.run(&line).await;
        drop(guard);

        if let Err(err) = result {
            run_on_error_sequence(inner).await;
            return ExitReason::Errored(err.to_string());
        }

        let committed = inner.next_position.get();
        inner.position.store(committed, Ordering::SeqCst);

        let consumed = inner.lines_consumed.fetch_add(1, Ordering::SeqCst) + 1;
        if consumed % inner.settings.checkpoint_every_lines == 0 {
            if let Some(journal) = journal.as_mut() {
                if let Err(err) = journal.write(consumed) {
                    tracing::warn!("checkpoint write failed: {err}");
                }
            }
        }

        // Did the dispatched command reposition the stream?
        if committed != naive_next {
            if committed > file_size {
                tracing::error!("reposition to byte {committed} is beyond end of file");
                inner.events.emit(HostEvent::Response(
                    "!! reposition beyond end of file".into(),
                ));
                return ExitReason::Suspended;
            }
            if let Err(err) = file.seek(SeekFrom::Start(committed)).await {
                tracing::error!("seek after reposition failed: {err}");
                return ExitReason::Suspended;
            }
            // Buffered read-ahead is stale once the cursor moved.
            lines.clear();
            partial.clear();
        }
    }
    ExitReason::Suspended
}

/// Dispatch a multi-line script under the shared mutex, stopping at the
/// first rejected line.
async fn dispatch_script(
    inner: &Arc<Inner>,
    script: &str,
) -> Result<(), crate::interpreter::DispatchError> {
    let _guard = inner.lock.acquire().await;
    for line in script.lines().map(str::trim).filter(|l| !l.is_empty()) {
        inner.interpreter.run(line).await?;
    }
    Ok(())
}

/// Best-effort fallback sequence after a dispatch failure. Its own failure
/// is logged, never re-raised.
async fn run_on_error_sequence(inner: &Arc<Inner>) {
    let script = match &inner.settings.on_error_gcode {
        Some(script) => script.clone(),
        None if inner.heaters.has_heaters() => DEFAULT_ERROR_GCODE.to_string(),
        None => return,
    };
    if let Err(err) = dispatch_script(inner, &script).await {
        tracing::warn!("on-error sequence failed: {err}");
    }
}
