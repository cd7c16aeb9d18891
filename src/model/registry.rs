use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use image::RgbImage;
use tokio::task;
use tracing::warn;

use crate::{
    codec,
    config::AppConfig,
    error::ServiceError,
    governor::{MemoryInfo, ResourceGovernor},
    model::{Colorizer, ModelDescriptor},
    postprocess,
};

/// Engine context shared by every request handler: one colorizer, one set of
/// frozen parameters, one device context.
pub struct ModelRegistry {
    colorizer: Arc<Colorizer>,
    jpeg_quality: u8,
    enhance: bool,
}

impl ModelRegistry {
    pub fn initialize(config: &AppConfig) -> Self {
        let governor = Arc::new(ResourceGovernor::configure(
            config.device,
            config.cpu_threads,
        ));
        Self::with_colorizer(Colorizer::new(config, governor), config)
    }

    pub fn with_colorizer(colorizer: Colorizer, config: &AppConfig) -> Self {
        Self {
            colorizer: Arc::new(colorizer),
            jpeg_quality: config.jpeg_quality,
            enhance: config.enable_enhancement,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.colorizer.is_available()
    }

    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        vec![self.colorizer.descriptor()]
    }

    pub fn device(&self) -> String {
        self.colorizer.governor().context().device.clone()
    }

    pub fn memory_info(&self) -> MemoryInfo {
        self.colorizer.governor().memory_info()
    }

    /// Colorize `input` and write the JPEG result to `output` on the blocking
    /// pool, plus a side-by-side sheet at `comparison` when given. Errors,
    /// including a panicked worker, come back through the returned future.
    /// A failed comparison sheet is logged and does not fail the job.
    pub async fn colorize_to_file(
        &self,
        input: PathBuf,
        output: PathBuf,
        comparison: Option<PathBuf>,
    ) -> Result<(), ServiceError> {
        if !self.colorizer.is_available() {
            return Err(ServiceError::EngineUnavailable);
        }
        let colorizer = self.colorizer.clone();
        let quality = self.jpeg_quality;
        let enhance = self.enhance;

        task::spawn_blocking(move || -> Result<(), ServiceError> {
            let mut image = colorizer.colorize(&input)?;
            if enhance {
                image = postprocess::enhance(&image);
            }
            codec::save_jpeg(&image, &output, quality)?;

            if let Some(path) = comparison {
                if let Err(err) = write_comparison(&input, &image, &path, quality) {
                    warn!(path = %path.display(), error = %err, "comparison sheet not written");
                }
            }
            Ok(())
        })
        .await
        .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }
}

fn write_comparison(
    input: &Path,
    colorized: &RgbImage,
    path: &Path,
    quality: u8,
) -> Result<(), ServiceError> {
    let original = codec::open(input)?;
    codec::save_jpeg(&postprocess::side_by_side(&original, colorized), path, quality)
}
