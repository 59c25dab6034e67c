// Shared test doubles for the integration tests.
#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sdstream::config::Config;
use sdstream::interpreter::{CommandInterpreter, DispatchError, PositionHandle};

/// Interpreter double that records every dispatched line. Optionally fails
/// on an exact line, sleeps per line, and honors a `JUMP <offset>` command
/// (once) by repositioning the stream through the shared position handle.
#[derive(Default)]
pub struct RecordingInterpreter {
    pub lines: Mutex<Vec<String>>,
    pub fail_on: Option<String>,
    pub delay: Option<Duration>,
    pub position: Mutex<Option<PositionHandle>>,
    pub jumped: AtomicBool,
}

impl RecordingInterpreter {
    pub fn recorded(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn attach_position_handle(&self, handle: PositionHandle) {
        *self.position.lock().unwrap() = Some(handle);
    }
}

#[async_trait]
impl CommandInterpreter for RecordingInterpreter {
    async fn run(&self, line: &str) -> Result<(), DispatchError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.lines.lock().unwrap().push(line.to_string());
        if self.fail_on.as_deref() == Some(line) {
            return Err(DispatchError::new(format!("rejected: {line}")));
        }
        if let Some(offset) = line.strip_prefix("JUMP ") {
            if !self.jumped.swap(true, Ordering::SeqCst) {
                if let Some(handle) = self.position.lock().unwrap().as_ref() {
                    handle.set(offset.trim().parse().unwrap());
                }
            }
        }
        Ok(())
    }
}

/// Config rooted in a temp dir so tests never touch real printer data.
pub fn test_config(root: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.paths.gcodes_dir = root.join("gcodes");
    config.paths.staging_dir = root.join(".temp");
    config.paths.cache_dir = root.join(".cache");
    config.paths.checkpoint_file = root.join("plr_record");
    config
}
