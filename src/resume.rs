// src/resume.rs - Power-loss recovery: rebuild machine state, then re-attach
use std::sync::Arc;

use thiserror::Error;

use crate::events::{EventBus, HostEvent};
use crate::executor::{JobError, JobExecutor};
use crate::interpreter::{CommandInterpreter, DispatchError, DispatchLock};
use crate::stager::StagedFile;

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Everything needed to reconstruct machine execution context before
/// re-attaching to a partially completed job. Constructed by the caller from
/// whatever it persisted; consumed once.
#[derive(Debug, Clone)]
pub struct ResumeContext {
    pub tool_temp: f64,
    pub bed_temp: f64,
    pub chamber_temp: f64,
    /// (fan name, speed) pairs.
    pub fan_speeds: Vec<(String, f64)>,
    pub absolute_coord: bool,
    pub absolute_extrude: bool,
    /// X/Y/Z/E.
    pub base_position: [f64; 4],
    pub homing_position: [f64; 4],
    pub last_position: [f64; 4],
    pub feed_rate: f64,
    pub speed_factor: f64,
    pub extrude_factor: f64,
    /// Calibration (bed mesh) profile to load.
    pub profile_name: String,
}

impl Default for ResumeContext {
    fn default() -> Self {
        Self {
            tool_temp: 210.0,
            bed_temp: 60.0,
            chamber_temp: 0.0,
            fan_speeds: Vec::new(),
            absolute_coord: true,
            absolute_extrude: true,
            base_position: [0.0; 4],
            homing_position: [0.0; 4],
            last_position: [0.0; 4],
            feed_rate: 1500.0,
            speed_factor: 1.0,
            extrude_factor: 1.0,
            profile_name: "default".to_string(),
        }
    }
}

/// Result of one recovery step. Failures are collected, not fatal: aborting
/// halfway leaves the machine in a worse, undiagnosed state than attempting
/// the remaining corrective steps.
#[derive(Debug)]
pub struct StepOutcome {
    pub name: &'static str,
    pub result: Result<(), DispatchError>,
}

/// Re-issues the bounded setup sequence and hands the byte offset back to
/// the job executor.
pub struct ResumeController {
    interpreter: Arc<dyn CommandInterpreter>,
    lock: DispatchLock,
    events: EventBus,
}

impl ResumeController {
    pub fn new(
        interpreter: Arc<dyn CommandInterpreter>,
        lock: DispatchLock,
        events: EventBus,
    ) -> Self {
        Self {
            interpreter,
            lock,
            events,
        }
    }

    /// Run the ten recovery steps in strict order, then continue streaming
    /// the previously staged file from `byte_offset`. The pre-check routine
    /// is suppressed on recovery runs.
    pub async fn resume_from(
        &self,
        executor: &JobExecutor,
        context: &ResumeContext,
        staged: StagedFile,
        byte_offset: u64,
    ) -> Result<Vec<StepOutcome>, ResumeError> {
        if executor.is_active() {
            return Err(JobError::Busy.into());
        }

        let mut outcomes = Vec::new();
        for (name, script) in recovery_steps(context) {
            let result = self.dispatch(&script).await;
            if let Err(err) = &result {
                tracing::warn!("resume step '{name}' failed: {err}");
                self.events
                    .emit(HostEvent::Response(format!("!! resume step {name}: {err}")));
            }
            outcomes.push(StepOutcome { name, result });
        }

        executor.load(staged).await?;
        executor.reposition(byte_offset).await?;
        executor.start(false).await?;
        Ok(outcomes)
    }

    async fn dispatch(&self, script: &str) -> Result<(), DispatchError> {
        let _guard = self.lock.acquire().await;
        for line in script.lines().map(str::trim).filter(|l| !l.is_empty()) {
            self.interpreter.run(line).await?;
        }
        Ok(())
    }
}

/// The ordered recovery sequence. Each entry is a named script; order is
/// load-bearing: the homing cycle in step 6 zeroes the position that step 4
/// forced, which is why it lifts first and moves back afterwards, and step 7
/// restores the coordinate mode step 6 forced absolute.
fn recovery_steps(ctx: &ResumeContext) -> Vec<(&'static str, String)> {
    let [x, y, z, _e] = ctx.last_position;
    let coord_mode = if ctx.absolute_coord { "G90" } else { "G91" };
    let extrude_mode = if ctx.absolute_extrude { "M82" } else { "M83" };
    let [bx, by, bz, be] = ctx.base_position;
    let [hx, hy, hz, he] = ctx.homing_position;

    vec![
        (
            "temperatures",
            format!(
                "M109 S{}\nM140 S{}\nM141 S{}",
                ctx.tool_temp, ctx.bed_temp, ctx.chamber_temp
            ),
        ),
        (
            "fan_speeds",
            ctx.fan_speeds
                .iter()
                .map(|(fan, speed)| format!("SET_FAN_SPEED FAN={fan} SPEED={speed}"))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        (
            "coordinate_modes",
            format!("{coord_mode}\n{extrude_mode}"),
        ),
        (
            "kinematic_position",
            format!("SET_KINEMATIC_POSITION X={x} Y={y} Z={z}"),
        ),
        (
            "calibration_profile",
            format!("BED_MESH_PROFILE LOAD={}", ctx.profile_name),
        ),
        (
            "rehome",
            format!(
                "G90\nG1 Z{:.3} F300\nG28 X Y\nG1 X{x:.3} Y{y:.3} F3000\nG1 Z{z:.3} F300",
                z + 1.0
            ),
        ),
        ("restore_coord_mode", coord_mode.to_string()),
        (
            "resume_prime",
            format!("RESUME_1 EXTRUDER={}", ctx.tool_temp),
        ),
        (
            "speed_and_extrude_factors",
            format!(
                "M220 S{}\nM221 S{}\nG1 F{}",
                ctx.speed_factor * 100.0,
                ctx.extrude_factor * 100.0,
                ctx.feed_rate
            ),
        ),
        (
            "position_offsets",
            format!(
                "SET_BASE_POSITION X={bx} Y={by} Z={bz} E={be}\n\
                 SET_HOMING_POSITION X={hx} Y={hy} Z={hz} E={he}"
            ),
        ),
    ]
}
