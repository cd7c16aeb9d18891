pub mod layout;
mod orchestrator;
mod record;
mod registry;

pub use layout::ArtifactLayout;
pub use orchestrator::{JobArtifact, JobOrchestrator, SubmittedJob, Upload};
pub use record::{JobProgress, JobRecord, JobState, JobStatus};
pub use registry::JobRegistry;
