use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Placeholder reported while a job has not finished. Progress is not
/// measured; only 50 and 100 are ever reported.
pub const PROCESSING_PROGRESS: u8 = 50;
pub const FINISHED_PROGRESS: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed { error: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed { .. } => "failed",
        }
    }

    /// Coarse status exposed by the progress endpoint.
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Pending | JobState::Running => JobStatus::Processing,
            JobState::Completed => JobStatus::Completed,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn progress(&self) -> u8 {
        if self.is_terminal() {
            FINISHED_PROGRESS
        } else {
            PROCESSING_PROGRESS
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub output_extension: String,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: Uuid, input_path: PathBuf, output_path: PathBuf, output_extension: &str) -> Self {
        Self {
            id,
            input_path,
            output_path,
            output_extension: output_extension.to_string(),
            state: JobState::Pending,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub file_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
}

impl JobProgress {
    /// What an id with no record and no artifact reports.
    pub fn processing(file_id: &str) -> Self {
        Self {
            file_id: file_id.to_string(),
            status: JobStatus::Processing,
            progress: PROCESSING_PROGRESS,
            state: JobState::Pending.label(),
            error: None,
            output_url: None,
        }
    }

    pub fn completed(file_id: &str, output_url: String) -> Self {
        Self {
            file_id: file_id.to_string(),
            status: JobStatus::Completed,
            progress: FINISHED_PROGRESS,
            state: JobState::Completed.label(),
            error: None,
            output_url: Some(output_url),
        }
    }

    pub fn from_state(file_id: &str, state: &JobState, output_url: String) -> Self {
        Self {
            file_id: file_id.to_string(),
            status: state.status(),
            progress: state.progress(),
            state: state.label(),
            error: match state {
                JobState::Failed { error } => Some(error.clone()),
                _ => None,
            },
            output_url: (*state == JobState::Completed).then_some(output_url),
        }
    }
}
