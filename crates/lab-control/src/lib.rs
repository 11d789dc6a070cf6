//! Trial control plane: schedules trials of an experiment, runs them as
//! harness processes, and lets callers pause, resume, fork, replay and cancel
//! them while every override is checked against a knob manifest.

pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod fork;
pub mod inbox;
pub mod knobs;
pub mod ledger;
pub mod model;
pub mod pause;
pub mod replay;

#[cfg(test)]
mod test_support;

pub use checkpoint::{Checkpoint, CheckpointState, CheckpointStore};
pub use config::{find_project_root, load_experiment, ExperimentPlan};
pub use controller::{CancelOutcome, RunController, RunSummary, TrialSummary};
pub use error::{ControlError, ControlResult, ErrorEnvelope, FieldDiff};
pub use executor::{TrialExecutor, TrialOutcome};
pub use fork::{ForkOutcome, ForkRequest, ForkSelector};
pub use inbox::{execute_command, serve_control, submit_control, ControlCommand, ControlResponse};
pub use knobs::{apply_overrides_file, KnobEngine, KnobManifest, KnobOverrides, Violation};
pub use ledger::{acquire_run_operation_lock, operation_lock_path, RunLedger};
pub use model::{Run, RunStatus, Trial, TrialResult, TrialStatus};
pub use pause::{PauseCoordinator, PauseOutcome, ResumeOutcome};
pub use replay::{list_replays, ReplayEngine, ReplayReport};
