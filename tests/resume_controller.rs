mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{RecordingInterpreter, test_config};
use sdstream::events::EventBus;
use sdstream::executor::{JobExecutor, JobState};
use sdstream::interpreter::{DispatchLock, NoHeaters};
use sdstream::resume::{ResumeContext, ResumeController};
use sdstream::stager::{SourceKind, StagedFile};

const THREE_LINES: &str = "G1 X10\nG1 X20\nG1 X30\n";

fn staged_file(dir: &Path, contents: &str) -> StagedFile {
    let path = dir.join("job.gcode");
    std::fs::write(&path, contents).unwrap();
    StagedFile {
        path,
        size: contents.len() as u64,
        source: SourceKind::Plain,
        plate_index: 1,
    }
}

fn build(
    dir: &Path,
    interpreter: Arc<RecordingInterpreter>,
) -> (JobExecutor, ResumeController) {
    let config = test_config(dir);
    let lock = DispatchLock::new();
    let events = EventBus::default();
    let executor = JobExecutor::new(
        &config,
        interpreter.clone(),
        Arc::new(NoHeaters),
        lock.clone(),
        events.clone(),
    );
    let controller = ResumeController::new(interpreter, lock, events);
    (executor, controller)
}

async fn wait_for(executor: &JobExecutor, state: JobState) {
    for _ in 0..2000 {
        if executor.status().state == state && !executor.is_active() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "timed out waiting for {state:?}, still {:?}",
        executor.status().state
    );
}

#[tokio::test]
async fn recovery_replays_setup_then_streams_from_offset() {
    let dir = tempfile::tempdir().unwrap();
    let interpreter = Arc::new(RecordingInterpreter::default());
    let (executor, controller) = build(dir.path(), interpreter.clone());

    let mut context = ResumeContext::default();
    context.tool_temp = 215.0;
    context.bed_temp = 65.0;
    context.last_position = [50.0, 60.0, 10.0, 120.0];
    context
        .fan_speeds
        .push(("cooling_fan".to_string(), 0.5));

    let staged = staged_file(dir.path(), THREE_LINES);
    let size = staged.size;
    // Resume just past line 1.
    let outcomes = controller
        .resume_from(&executor, &context, staged, 7)
        .await
        .unwrap();
    wait_for(&executor, JobState::Completed).await;

    assert_eq!(outcomes.len(), 10);
    assert!(outcomes.iter().all(|o| o.result.is_ok()));

    let recorded = interpreter.recorded();
    assert_eq!(recorded[0], "M109 S215");
    assert!(recorded.contains(&"SET_FAN_SPEED FAN=cooling_fan SPEED=0.5".to_string()));
    assert!(recorded.contains(&"SET_KINEMATIC_POSITION X=50 Y=60 Z=10".to_string()));
    assert!(recorded.contains(&"G28 X Y".to_string()));
    assert!(recorded.contains(&"RESUME_1 EXTRUDER=215".to_string()));

    // Step order: temperatures before the kinematic overwrite, which comes
    // before the homing cycle, which comes before the resume prime.
    let temp = recorded.iter().position(|l| l == "M109 S215").unwrap();
    let kin = recorded
        .iter()
        .position(|l| l.starts_with("SET_KINEMATIC_POSITION"))
        .unwrap();
    let home = recorded.iter().position(|l| l == "G28 X Y").unwrap();
    let prime = recorded
        .iter()
        .position(|l| l.starts_with("RESUME_1"))
        .unwrap();
    let offsets = recorded
        .iter()
        .position(|l| l.starts_with("SET_HOMING_POSITION"))
        .unwrap();
    assert!(temp < kin && kin < home && home < prime && prime < offsets);

    // Only lines 2 and 3 were streamed; line 1 was already printed.
    let streamed: Vec<_> = recorded[offsets + 1..].to_vec();
    assert_eq!(streamed, vec!["G1 X20", "G1 X30"]);
    assert_eq!(executor.status().byte_offset, size);
}

#[tokio::test]
async fn failed_step_is_reported_but_recovery_continues() {
    let dir = tempfile::tempdir().unwrap();
    let interpreter = Arc::new(RecordingInterpreter {
        fail_on: Some("BED_MESH_PROFILE LOAD=default".to_string()),
        ..Default::default()
    });
    let (executor, controller) = build(dir.path(), interpreter.clone());

    let context = ResumeContext::default();
    let staged = staged_file(dir.path(), THREE_LINES);
    let outcomes = controller
        .resume_from(&executor, &context, staged, 0)
        .await
        .unwrap();
    wait_for(&executor, JobState::Completed).await;

    let failed: Vec<_> = outcomes
        .iter()
        .filter(|o| o.result.is_err())
        .map(|o| o.name)
        .collect();
    assert_eq!(failed, vec!["calibration_profile"]);

    // The steps after the failed one were still attempted.
    let recorded = interpreter.recorded();
    assert!(recorded.iter().any(|l| l.starts_with("RESUME_1")));
    assert!(recorded.iter().any(|l| l.starts_with("M220")));
    assert!(recorded.iter().any(|l| l.starts_with("SET_BASE_POSITION")));
}

#[tokio::test]
async fn recovery_suppresses_the_pre_check() {
    let dir = tempfile::tempdir().unwrap();
    let interpreter = Arc::new(RecordingInterpreter::default());
    let config = {
        let mut config = test_config(dir.path());
        config.job.pre_check_gcode = Some("M4050".to_string());
        config
    };
    let lock = DispatchLock::new();
    let events = EventBus::default();
    let executor = JobExecutor::new(
        &config,
        interpreter.clone(),
        Arc::new(NoHeaters),
        lock.clone(),
        events.clone(),
    );
    let controller = ResumeController::new(interpreter.clone(), lock, events);

    let staged = staged_file(dir.path(), THREE_LINES);
    controller
        .resume_from(&executor, &ResumeContext::default(), staged, 0)
        .await
        .unwrap();
    wait_for(&executor, JobState::Completed).await;

    assert!(!interpreter.recorded().contains(&"M4050".to_string()));
}
