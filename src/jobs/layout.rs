use std::path::{Path, PathBuf};

use image::ImageFormat;
use uuid::Uuid;

use crate::config::AppConfig;

pub const UPLOADS_ROUTE: &str = "/uploads";
pub const OUTPUTS_ROUTE: &str = "/outputs";

const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp"];

/// Where job artifacts live: `{upload_dir}/{id}_input.{ext}`,
/// `{output_dir}/{id}_output.{ext}` and the optional
/// `{output_dir}/{id}_comparison.jpg`.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl ArtifactLayout {
    pub fn new(upload_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.upload_dir, &config.output_dir)
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.upload_dir)?;
        std::fs::create_dir_all(&self.output_dir)
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn input_path(&self, id: Uuid, extension: &str) -> PathBuf {
        self.upload_dir.join(format!("{id}_input.{extension}"))
    }

    pub fn output_path(&self, id: Uuid, extension: &str) -> PathBuf {
        self.output_dir.join(format!("{id}_output.{extension}"))
    }

    pub fn input_url(&self, id: Uuid, extension: &str) -> String {
        format!("{UPLOADS_ROUTE}/{id}_input.{extension}")
    }

    pub fn output_url(&self, id: Uuid, extension: &str) -> String {
        format!("{OUTPUTS_ROUTE}/{id}_output.{extension}")
    }

    /// Side-by-side sheet written next to the output when enabled.
    pub fn comparison_path(&self, id: Uuid) -> PathBuf {
        self.output_dir.join(format!("{id}_comparison.jpg"))
    }

    pub fn comparison_url(&self, id: Uuid) -> String {
        format!("{OUTPUTS_ROUTE}/{id}_comparison.jpg")
    }
}

/// Keep the upload's own extension when it is a known raster suffix,
/// otherwise name the file after the sniffed format.
pub fn input_extension(file_name: Option<&str>, format: ImageFormat) -> String {
    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or_else(|| {
            format
                .extensions_str()
                .first()
                .copied()
                .unwrap_or("img")
                .to_string()
        })
}

pub fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}
