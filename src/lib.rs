pub mod codec;
pub mod config;
pub mod error;
pub mod governor;
pub mod jobs;
pub mod model;
pub mod postprocess;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use config::AppConfig;
pub use error::ServiceError;
pub use jobs::{JobOrchestrator, JobState};
pub use model::ModelRegistry;
pub use server::{AppState, build_router};
