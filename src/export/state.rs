use std::sync::Arc;

use parking_lot::Mutex;

/// Lifecycle of one export run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportState {
    Idle,
    Preflight,
    Rendering,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl ExportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use ExportState::*;
        matches!(
            (self, next),
            (Idle, Preflight)
                | (Preflight, Rendering | Cancelled | Failed)
                | (Rendering, Finalizing | Cancelled | Failed)
                | (Finalizing, Completed | Cancelled | Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preflight => "preflight",
            Self::Rendering => "rendering",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable run state. Only legal transitions are applied.
#[derive(Clone, Debug)]
pub struct StateCell(Arc<Mutex<ExportState>>);

impl Default for StateCell {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(ExportState::Idle)))
    }
}

impl StateCell {
    pub fn get(&self) -> ExportState {
        *self.0.lock()
    }

    /// Move to `next`; returns `false` (and leaves the state alone) for an illegal transition.
    pub fn transition(&self, next: ExportState) -> bool {
        let mut cur = self.0.lock();
        if !cur.can_transition_to(next) {
            tracing::warn!(from = %*cur, to = %next, "ignored illegal export state transition");
            return false;
        }
        tracing::debug!(from = %*cur, to = %next, "export state");
        *cur = next;
        true
    }
}
