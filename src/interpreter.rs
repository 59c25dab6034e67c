// src/interpreter.rs - Seams between the streamer and the live G-code interpreter
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Structured error raised by the interpreter when it rejects a line.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DispatchError {
    pub message: String,
}

impl DispatchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One newline-terminated command string at a time. Implementations may block
/// internally (heating waits, motion drain); `abort_waits` must interrupt any
/// such wait so a cancel request cannot be held hostage.
#[async_trait]
pub trait CommandInterpreter: Send + Sync {
    async fn run(&self, line: &str) -> Result<(), DispatchError>;

    /// Interrupt any in-progress blocking wait. Default: nothing to abort.
    fn abort_waits(&self) {}
}

/// Heating subsystem collaborator. Only the parts the streamer needs: whether
/// heaters exist (picks the default on-error sequence) and wait interruption.
pub trait HeaterWaits: Send + Sync {
    fn has_heaters(&self) -> bool;
    fn abort_waits(&self);
}

/// Heater collaborator for hosts with no heaters configured.
pub struct NoHeaters;

impl HeaterWaits for NoHeaters {
    fn has_heaters(&self) -> bool {
        false
    }
    fn abort_waits(&self) {}
}

/// Mutex serializing interpreter dispatch between the streaming job and any
/// foreground producer (API callers, timers, sensors). The job loop only ever
/// try-locks and backs off; foreground producers acquire normally.
#[derive(Clone, Default)]
pub struct DispatchLock {
    mutex: Arc<Mutex<()>>,
}

impl DispatchLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking probe used by the job loop. `None` means another
    /// producer holds the interpreter right now.
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        self.mutex.clone().try_lock_owned().ok()
    }

    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.mutex.clone().lock_owned().await
    }
}

/// Shared pending-dispatch offset. The executor publishes the naive next
/// position here before each dispatch; a command handler that repositions the
/// stream (an M26-style seek) overwrites it, and the executor commits whatever
/// value is present after the interpreter accepts the line.
#[derive(Clone, Default)]
pub struct PositionHandle {
    offset: Arc<AtomicU64>,
}

impl PositionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    pub fn set(&self, offset: u64) {
        self.offset.store(offset, Ordering::SeqCst);
    }
}
