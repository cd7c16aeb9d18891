use std::sync::Arc;

use axum::body::Bytes;
use image::ImageFormat;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    codec::{self, OUTPUT_EXTENSION},
    config::AppConfig,
    error::ServiceError,
    jobs::{
        ArtifactLayout, JobProgress, JobRecord, JobRegistry, JobState, JobStatus,
        layout::{content_type_for, input_extension},
    },
    model::ModelRegistry,
};

#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmittedJob {
    pub message: &'static str,
    pub file_id: String,
    pub status: JobStatus,
    pub input_url: String,
    pub output_url: String,
    pub progress_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobArtifact {
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Accepts uploads, runs colorization off the request path and answers
/// status and result queries.
pub struct JobOrchestrator {
    models: Arc<ModelRegistry>,
    jobs: Arc<JobRegistry>,
    layout: ArtifactLayout,
    workers: Arc<Semaphore>,
    max_pending_jobs: usize,
    max_file_size: usize,
    create_comparison: bool,
}

impl JobOrchestrator {
    pub fn new(config: &AppConfig, models: Arc<ModelRegistry>) -> Self {
        Self {
            models,
            jobs: Arc::new(JobRegistry::new(config.max_finished_jobs)),
            layout: ArtifactLayout::from_config(config),
            workers: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            max_pending_jobs: config.max_pending_jobs.max(1),
            max_file_size: config.max_file_size,
            create_comparison: config.create_comparison,
        }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    pub fn jobs_in_flight(&self) -> usize {
        self.jobs.in_flight()
    }

    pub fn record(&self, id: Uuid) -> Option<JobRecord> {
        self.jobs.get(id)
    }

    /// Check an upload against the content-type, size and format rules.
    pub fn validate(&self, upload: &Upload) -> Result<ImageFormat, ServiceError> {
        let is_image = upload
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("image/"));
        if !is_image {
            return Err(ServiceError::Validation("File must be an image".into()));
        }
        if upload.bytes.len() > self.max_file_size {
            return Err(ServiceError::Validation(format!(
                "File size too large (max {}MB)",
                self.max_file_size / (1024 * 1024)
            )));
        }
        if upload.bytes.is_empty() {
            return Err(ServiceError::Validation("File is empty".into()));
        }
        codec::sniff_format(&upload.bytes)
            .ok_or_else(|| ServiceError::Validation("Unrecognized image format".into()))
    }

    /// Persist the upload, register the job and schedule its colorization.
    /// Returns as soon as the work is scheduled.
    pub async fn submit(&self, upload: Upload) -> Result<SubmittedJob, ServiceError> {
        if !self.models.is_loaded() {
            return Err(ServiceError::EngineUnavailable);
        }
        let format = self.validate(&upload)?;

        let id = Uuid::new_v4();
        let input_ext = input_extension(upload.file_name.as_deref(), format);
        let input_path = self.layout.input_path(id, &input_ext);
        let output_path = self.layout.output_path(id, OUTPUT_EXTENSION);
        let record = JobRecord::new(id, input_path.clone(), output_path, OUTPUT_EXTENSION);
        self.jobs.try_admit(record.clone(), self.max_pending_jobs)?;

        if let Err(err) = write_input(&input_path, &upload.bytes).await {
            self.jobs.remove(id);
            return Err(err);
        }

        info!(
            job_id = %id,
            bytes = upload.bytes.len(),
            format = ?format,
            "job submitted"
        );
        self.schedule(&record);

        Ok(SubmittedJob {
            message: "Image uploaded successfully",
            file_id: id.to_string(),
            status: JobStatus::Processing,
            input_url: self.layout.input_url(id, &input_ext),
            output_url: self.layout.output_url(id, OUTPUT_EXTENSION),
            progress_url: format!("/api/progress/{id}"),
            comparison_url: self
                .create_comparison
                .then(|| self.layout.comparison_url(id)),
        })
    }

    fn schedule(&self, record: &JobRecord) {
        let models = self.models.clone();
        let jobs = self.jobs.clone();
        let workers = self.workers.clone();
        let id = record.id;
        let input = record.input_path.clone();
        let output = record.output_path.clone();
        let comparison = self
            .create_comparison
            .then(|| self.layout.comparison_path(id));

        tokio::spawn(async move {
            let outcome = async {
                let _permit = workers
                    .acquire_owned()
                    .await
                    .map_err(|_| ServiceError::Other("worker pool closed".into()))?;
                jobs.mark_running(id);
                info!(job_id = %id, "colorization started");
                models.colorize_to_file(input, output, comparison).await
            }
            .await;

            match outcome {
                Ok(()) => {
                    info!(job_id = %id, "colorization completed");
                    jobs.complete(id);
                }
                Err(err) => {
                    error!(job_id = %id, error = %err, "colorization failed");
                    jobs.fail(id, err.to_string());
                }
            }
        });
    }

    /// Never fails: ids without a record or an artifact read as processing.
    pub async fn status(&self, file_id: &str) -> JobProgress {
        let Ok(id) = Uuid::parse_str(file_id) else {
            return JobProgress::processing(file_id);
        };

        if let Some(record) = self.jobs.get(id) {
            let output_url = self.layout.output_url(id, &record.output_extension);
            return JobProgress::from_state(file_id, &record.state, output_url);
        }

        // Results written by an earlier process have no record.
        let fallback = self.layout.output_path(id, OUTPUT_EXTENSION);
        if tokio::fs::try_exists(&fallback).await.unwrap_or(false) {
            return JobProgress::completed(file_id, self.layout.output_url(id, OUTPUT_EXTENSION));
        }
        JobProgress::processing(file_id)
    }

    pub async fn fetch(&self, file_id: &str) -> Result<JobArtifact, ServiceError> {
        let not_found = || ServiceError::NotFound("Result".into());
        let id = Uuid::parse_str(file_id).map_err(|_| not_found())?;

        let (path, extension) = match self.jobs.get(id) {
            Some(record) if record.state == JobState::Completed => {
                (record.output_path, record.output_extension)
            }
            Some(_) => return Err(not_found()),
            None => (
                self.layout.output_path(id, OUTPUT_EXTENSION),
                OUTPUT_EXTENSION.to_string(),
            ),
        };

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(err) => return Err(err.into()),
        };

        Ok(JobArtifact {
            file_name: format!("colorized_{id}.{extension}"),
            content_type: content_type_for(&extension),
            bytes,
        })
    }

    /// Wait until the job reaches a terminal state. `None` for unknown ids.
    pub async fn wait(&self, id: Uuid) -> Option<JobState> {
        let mut updates = self.jobs.subscribe(id)?;
        let state = updates.wait_for(JobState::is_terminal).await.ok()?.clone();
        Some(state)
    }
}

async fn write_input(path: &std::path::Path, bytes: &[u8]) -> Result<(), ServiceError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn upload(bytes: Vec<u8>, content_type: &str) -> Upload {
        Upload {
            file_name: Some("test.jpg".into()),
            content_type: Some(content_type.into()),
            bytes: Bytes::from(bytes),
        }
    }

    #[tokio::test]
    async fn unknown_ids_read_as_processing_but_cannot_be_fetched() {
        let env = testing::TestEnv::unloaded();
        let orchestrator = env.orchestrator();

        let progress = orchestrator.status("nonexistent-id").await;
        assert_eq!(progress.status, JobStatus::Processing);
        assert_eq!(progress.progress, 50);

        let progress = orchestrator.status(&Uuid::new_v4().to_string()).await;
        assert_eq!(progress.status, JobStatus::Processing);

        assert!(matches!(
            orchestrator.fetch("nonexistent-id").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            orchestrator.fetch(&Uuid::new_v4().to_string()).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unavailable_engine_rejects_even_invalid_uploads() {
        let env = testing::TestEnv::unloaded();
        let orchestrator = env.orchestrator();

        let err = orchestrator
            .submit(upload(b"not an image".to_vec(), "text/plain"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::EngineUnavailable));
    }

    #[tokio::test]
    async fn validation_rejects_type_size_and_format() {
        let env = testing::TestEnv::loaded();
        let orchestrator = env.orchestrator();

        let err = orchestrator
            .submit(upload(testing::gray_jpeg(10, 10, 128), "text/plain"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let oversized = vec![0u8; orchestrator.max_file_size() + 1];
        let err = orchestrator
            .submit(upload(oversized, "image/jpeg"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = orchestrator
            .submit(upload(b"plain text".to_vec(), "image/png"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(orchestrator.jobs_in_flight(), 0);
    }

    #[tokio::test]
    async fn submitted_job_completes_and_can_be_fetched() {
        let env = testing::TestEnv::loaded();
        let orchestrator = env.orchestrator();

        let submitted = orchestrator
            .submit(upload(testing::gray_jpeg(100, 100, 128), "image/jpeg"))
            .await
            .unwrap();
        assert_eq!(submitted.status, JobStatus::Processing);
        assert!(submitted.output_url.ends_with("_output.jpg"));
        assert_eq!(
            submitted.progress_url,
            format!("/api/progress/{}", submitted.file_id)
        );

        let id = Uuid::parse_str(&submitted.file_id).unwrap();
        let input = orchestrator.record(id).unwrap().input_path;
        assert!(input.exists());
        assert!(input.to_string_lossy().ends_with("_input.jpg"));

        let state = orchestrator.wait(id).await.unwrap();
        assert_eq!(state, JobState::Completed);

        let progress = orchestrator.status(&submitted.file_id).await;
        assert_eq!(progress.status, JobStatus::Completed);
        assert_eq!(progress.progress, 100);

        let artifact = orchestrator.fetch(&submitted.file_id).await.unwrap();
        assert_eq!(artifact.content_type, "image/jpeg");
        assert_eq!(artifact.file_name, format!("colorized_{id}.jpg"));
        let decoded = image::load_from_memory(&artifact.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (256, 256));
        assert_eq!(decoded.color(), image::ColorType::Rgb8);
    }

    #[tokio::test]
    async fn failed_jobs_are_observable() {
        let env = testing::TestEnv::loaded();
        let orchestrator = env.orchestrator();

        // Valid PNG signature, undecodable body.
        let truncated = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDRtruncated".to_vec();
        let submitted = orchestrator
            .submit(upload(truncated, "image/png"))
            .await
            .unwrap();
        let id = Uuid::parse_str(&submitted.file_id).unwrap();

        let state = orchestrator.wait(id).await.unwrap();
        assert!(matches!(state, JobState::Failed { .. }));

        let progress = orchestrator.status(&submitted.file_id).await;
        assert_eq!(progress.status, JobStatus::Failed);
        assert!(progress.error.is_some());
        assert!(matches!(
            orchestrator.fetch(&submitted.file_id).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn artifacts_from_previous_runs_are_served() {
        let env = testing::TestEnv::unloaded();
        let orchestrator = env.orchestrator();
        let id = Uuid::new_v4();

        let image = image::RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
        codec::save_jpeg(&image, &orchestrator.layout().output_path(id, "jpg"), 90).unwrap();

        let progress = orchestrator.status(&id.to_string()).await;
        assert_eq!(progress.status, JobStatus::Completed);
        assert!(orchestrator.fetch(&id.to_string()).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_jobs_all_complete() {
        let env = testing::TestEnv::loaded_with(|config| {
            config.max_concurrent_jobs = 2;
            config.max_pending_jobs = 8;
        });
        let orchestrator = env.orchestrator();

        let mut ids = Vec::new();
        for shade in [30, 90, 150, 210] {
            let submitted = orchestrator
                .submit(upload(testing::gray_jpeg(48, 40, shade), "image/jpeg"))
                .await
                .unwrap();
            ids.push(Uuid::parse_str(&submitted.file_id).unwrap());
        }

        let states = wait_all(&orchestrator, &ids).await;
        assert!(states.iter().all(|state| *state == JobState::Completed));
        assert_eq!(orchestrator.jobs_in_flight(), 0);

        for id in ids {
            let artifact = orchestrator.fetch(&id.to_string()).await.unwrap();
            let decoded = image::load_from_memory(&artifact.bytes).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (256, 256));
        }
    }

    async fn wait_all(orchestrator: &JobOrchestrator, ids: &[Uuid]) -> Vec<JobState> {
        let mut states = Vec::new();
        for id in ids {
            let state = tokio::time::timeout(
                std::time::Duration::from_secs(120),
                orchestrator.wait(*id),
            )
            .await
            .expect("job did not finish in time")
            .unwrap();
            states.push(state);
        }
        states
    }

    #[tokio::test]
    async fn enhancement_and_comparison_artifacts() {
        let env = testing::TestEnv::loaded_with(|config| {
            config.enable_enhancement = true;
            config.create_comparison = true;
        });
        let orchestrator = env.orchestrator();

        let submitted = orchestrator
            .submit(upload(testing::gray_jpeg(120, 80, 100), "image/jpeg"))
            .await
            .unwrap();
        let id = Uuid::parse_str(&submitted.file_id).unwrap();
        assert_eq!(
            submitted.comparison_url.as_deref(),
            Some(format!("/outputs/{id}_comparison.jpg").as_str())
        );
        assert_eq!(orchestrator.wait(id).await.unwrap(), JobState::Completed);

        let sheet = image::open(orchestrator.layout().comparison_path(id)).unwrap();
        assert_eq!((sheet.width(), sheet.height()), (240, 80));
        assert!(orchestrator.fetch(&submitted.file_id).await.is_ok());
    }

    #[tokio::test]
    async fn admission_control_refuses_bursts() {
        let env = testing::TestEnv::loaded_with(|config| {
            config.max_pending_jobs = 1;
            config.max_concurrent_jobs = 1;
        });
        let orchestrator = env.orchestrator();

        let first = orchestrator
            .submit(upload(testing::gray_jpeg(32, 32, 90), "image/jpeg"))
            .await
            .unwrap();
        let err = orchestrator
            .submit(upload(testing::gray_jpeg(32, 32, 90), "image/jpeg"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Busy(1)));

        let id = Uuid::parse_str(&first.file_id).unwrap();
        orchestrator.wait(id).await.unwrap();
        orchestrator
            .submit(upload(testing::gray_jpeg(32, 32, 90), "image/jpeg"))
            .await
            .unwrap();
    }
}
