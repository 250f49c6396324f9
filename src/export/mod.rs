//! Export Orchestrator: run state machine, progress, cancellation and history.

pub mod cancel;
pub mod engine;
pub mod history;
pub mod orchestrator;
pub mod progress;
pub mod state;

pub use cancel::CancellationToken;
pub use engine::{ExportEngine, ExportRun};
pub use history::{ExportHistory, HistoryEntry};
pub use orchestrator::{ExportContext, ExportOutcome, ExportOutput, Orchestrator, RunSetup};
pub use progress::{ExportProgress, ProgressCallback, ProgressHub, ProgressTracker};
pub use state::{ExportState, StateCell};
