// src/main.rs - CLI host: stage a file and stream it to a console interpreter
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sdstream::{
    CommandInterpreter, Config, DispatchError, DispatchLock, EventBus, HostEvent, JobExecutor,
    JobState, NoHeaters,
};
use sdstream::stager::FileStager;

#[derive(Parser)]
#[command(name = "sdstream-host", about = "Stage and stream a G-code job file")]
struct Args {
    /// Path to the host configuration file.
    #[arg(short, long, default_value = "sdstream.toml")]
    config: String,

    /// Source file: a plain .gcode file or a multi-plate .3mf archive.
    file: PathBuf,

    /// Plate to extract from a multi-plate archive.
    #[arg(long, default_value_t = 1)]
    plate: u32,

    /// Skip the configured pre-check routine.
    #[arg(long)]
    no_verify: bool,
}

/// Interpreter stand-in for running without a machine attached: accepts
/// every line and logs it.
struct ConsoleInterpreter;

#[async_trait::async_trait]
impl CommandInterpreter for ConsoleInterpreter {
    async fn run(&self, line: &str) -> Result<(), DispatchError> {
        tracing::info!("> {line}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let config = match sdstream::load_config(&args.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("could not load '{}' ({err}), using defaults", args.config);
            Config::default()
        }
    };

    let events = EventBus::default();
    let mut notifications = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = notifications.recv().await {
            match event {
                HostEvent::Response(line) => tracing::info!("{line}"),
                HostEvent::FileStaged {
                    path,
                    size,
                    plate_index,
                } => tracing::info!(
                    "staged {} ({size} bytes, plate {plate_index})",
                    path.display()
                ),
                other => tracing::debug!("{other:?}"),
            }
        }
    });

    let lock = DispatchLock::new();
    let interpreter = Arc::new(ConsoleInterpreter);
    let executor = JobExecutor::new(&config, interpreter, Arc::new(NoHeaters), lock, events.clone());
    let stager = FileStager::new(&config.paths, events);

    let staged = stager.stage(&args.file, args.plate, true).await?;
    executor.load(staged).await?;
    executor.start(!args.no_verify).await?;

    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let status = executor.status();
        match status.state {
            JobState::Completed => {
                tracing::info!("job complete ({} bytes)", status.total_size);
                return Ok(());
            }
            JobState::Errored => {
                tracing::error!("job failed at byte {}", status.byte_offset);
                std::process::exit(1);
            }
            JobState::Paused => {
                tracing::warn!("job suspended at byte {}", status.byte_offset);
                std::process::exit(1);
            }
            _ => {
                tracing::info!(
                    "progress {:.1}% ({}/{} bytes)",
                    status.progress * 100.0,
                    status.byte_offset,
                    status.total_size
                );
            }
        }
    }
}
