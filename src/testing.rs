//! Fixtures shared by unit tests.

use std::{
    io::Cursor,
    path::{Path, PathBuf},
    sync::Arc,
};

use image::{GrayImage, ImageFormat, Luma};
use tch::{Device, nn};
use tempfile::TempDir;

use crate::{
    config::AppConfig,
    jobs::JobOrchestrator,
    model::{
        ModelRegistry,
        unet::{UNet, UNetConfig},
    },
};

pub const TEST_BASE_CHANNELS: i64 = 8;

/// Initialise a narrow network and save its parameters as safetensors.
pub fn export_weights(dir: &Path, base_channels: i64) -> PathBuf {
    let vs = nn::VarStore::new(Device::Cpu);
    let _net = UNet::new(
        &vs.root(),
        UNetConfig {
            base_channels,
            ..Default::default()
        },
    );
    let path = dir.join(format!("colorizer-{base_channels}.safetensors"));
    vs.save(&path).unwrap();
    path
}

pub fn gray_jpeg(width: u32, height: u32, value: u8) -> Vec<u8> {
    let mut bytes = Vec::new();
    GrayImage::from_pixel(width, height, Luma([value]))
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .unwrap();
    bytes
}

pub struct TestEnv {
    pub config: AppConfig,
    _dir: TempDir,
}

impl TestEnv {
    pub fn unloaded() -> Self {
        Self::build(false, |_| {})
    }

    pub fn loaded() -> Self {
        Self::build(true, |_| {})
    }

    pub fn loaded_with(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        Self::build(true, adjust)
    }

    fn build(with_weights: bool, adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let model_path = with_weights.then(|| export_weights(dir.path(), TEST_BASE_CHANNELS));
        let mut config = AppConfig {
            model_path,
            base_channels: TEST_BASE_CHANNELS,
            upload_dir: dir.path().join("uploads"),
            output_dir: dir.path().join("outputs"),
            cpu_threads: 2,
            ..AppConfig::default()
        };
        adjust(&mut config);
        Self { config, _dir: dir }
    }

    pub fn orchestrator(&self) -> JobOrchestrator {
        let models = Arc::new(ModelRegistry::initialize(&self.config));
        JobOrchestrator::new(&self.config, models)
    }
}
