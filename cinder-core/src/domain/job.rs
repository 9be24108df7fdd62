//! Job domain types

use serde::{Deserialize, Serialize};

/// Job execution record
///
/// Structure shared between the store (persists) and the scheduler (updates).
/// Records are created by an external submitter and mutated exclusively by
/// the dispatch loop; they are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Assigned by the store on insert.
    pub id: i64,
    /// Working directory the worker runs in.
    pub path: String,
    pub status: JobStatus,
    pub submitted_at: chrono::DateTime<chrono::Utc>,
    /// Set when the job transitions to Running.
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Set when the job reaches a terminal status.
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Worker exit code, available once the job is terminal.
    pub exit_code: Option<i32>,
    /// Which dispatcher instance claimed the job.
    pub dispatcher_id: Option<String>,
}

/// Job lifecycle status
///
/// A job moves Submitted -> Running -> (Finished | Failed) exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Submitted,
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    /// Returns the stable string form used for persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "Submitted",
            Self::Running => "Running",
            Self::Finished => "Finished",
            Self::Failed => "Failed",
        }
    }

    /// Parses the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Submitted" => Some(Self::Submitted),
            "Running" => Some(Self::Running),
            "Finished" => Some(Self::Finished),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns true when the job cannot transition any further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}
