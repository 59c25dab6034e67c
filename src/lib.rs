//! sdstream - streams staged G-code files into a live interpreter, one line
//! at a time, with pause/resume/cancel and power-loss checkpointing.

pub mod checkpoint;
pub mod config;
pub mod events;
pub mod executor;
pub mod interpreter;
pub mod resume;
pub mod stager;

pub use config::{Config, load_config};
pub use events::{EventBus, HostEvent};
pub use executor::{JobError, JobExecutor, JobState, JobStatus};
pub use interpreter::{
    CommandInterpreter, DispatchError, DispatchLock, HeaterWaits, NoHeaters, PositionHandle,
};
pub use resume::{ResumeContext, ResumeController, StepOutcome};
pub use stager::{FileStager, SourceKind, StageError, StagedFile};
