use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use image::RgbImage;
use tch::{Device, nn, nn::ModuleT, no_grad};
use tracing::{debug, info, warn};

use crate::{
    codec,
    config::AppConfig,
    error::ServiceError,
    governor::ResourceGovernor,
    model::{
        ModelDescriptor, ModelStatus,
        unet::{UNet, UNetConfig, parameter_count},
    },
};

pub const MODEL_NAME: &str = "U-Net Colorizer";

/// Frozen network plus the device context it runs on.
///
/// Construction never fails: without usable weights the colorizer comes up
/// unavailable and every `colorize` call reports [`ServiceError::EngineUnavailable`].
pub struct Colorizer {
    governor: Arc<ResourceGovernor>,
    input_size: i64,
    weights_path: Option<PathBuf>,
    state: ColorizerState,
}

enum ColorizerState {
    Ready(LoadedNetwork),
    Unavailable { reason: String },
}

struct LoadedNetwork {
    network: UNet,
    size_bytes: u64,
    parameters: u64,
    _vs: nn::VarStore,
}

impl Colorizer {
    pub fn new(config: &AppConfig, governor: Arc<ResourceGovernor>) -> Self {
        let unet_config = UNetConfig {
            base_channels: config.base_channels,
            bilinear: config.bilinear,
            ..Default::default()
        };

        let state = match config.model_path.as_deref() {
            None => {
                warn!("MODEL_PATH not set, colorization disabled");
                ColorizerState::Unavailable {
                    reason: "no weights configured".to_string(),
                }
            }
            Some(path) => match load_network(path, unet_config, governor.device()) {
                Ok(loaded) => {
                    info!(
                        path = %path.display(),
                        parameters = loaded.parameters,
                        device = %governor.context().device,
                        "colorization network loaded"
                    );
                    ColorizerState::Ready(loaded)
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to load colorization network");
                    ColorizerState::Unavailable {
                        reason: err.to_string(),
                    }
                }
            },
        };

        Self {
            governor,
            input_size: config.input_size,
            weights_path: config.model_path.clone(),
            state,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.state, ColorizerState::Ready(_))
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        match &self.state {
            ColorizerState::Ready(_) => None,
            ColorizerState::Unavailable { reason } => Some(reason),
        }
    }

    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.governor
    }

    pub fn descriptor(&self) -> ModelDescriptor {
        let (status, size_bytes, parameters) = match &self.state {
            ColorizerState::Ready(loaded) => (
                ModelStatus::Loaded,
                Some(loaded.size_bytes),
                Some(loaded.parameters),
            ),
            ColorizerState::Unavailable { .. } => (ModelStatus::NotLoaded, None, None),
        };

        ModelDescriptor {
            name: MODEL_NAME.to_string(),
            description: "Deep learning model for image colorization".to_string(),
            architecture: "U-Net".to_string(),
            input_format: "Grayscale images".to_string(),
            output_format: "Color images".to_string(),
            status,
            weights_path: self
                .weights_path
                .as_ref()
                .map(|p| p.display().to_string()),
            size_bytes,
            parameters,
            device: self.governor.context().device.clone(),
            error: self.unavailable_reason().map(str::to_string),
        }
    }

    /// Colorize the image at `path`. Identical weights and input give
    /// bit-identical output.
    pub fn colorize(&self, path: &Path) -> Result<RgbImage, ServiceError> {
        let loaded = match &self.state {
            ColorizerState::Ready(loaded) => loaded,
            ColorizerState::Unavailable { .. } => return Err(ServiceError::EngineUnavailable),
        };
        let device = self.governor.device();
        let start = Instant::now();

        let image = self.governor.run_scoped(|| {
            no_grad(|| {
                let input = codec::decode(path, self.input_size)?.to_device(device);
                let output = loaded.network.forward_t(&input, false);
                codec::encode(&output)
            })
        })?;

        debug!(
            path = %path.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "colorization pass finished"
        );
        Ok(image)
    }
}

fn load_network(
    path: &Path,
    config: UNetConfig,
    device: Device,
) -> Result<LoadedNetwork, ServiceError> {
    if !path.exists() {
        return Err(ServiceError::Other(format!(
            "model artifact missing: {}",
            path.display()
        )));
    }
    let size_bytes = fs::metadata(path)?.len();

    let mut vs = nn::VarStore::new(device);
    let network = UNet::new(&vs.root(), config);
    vs.load(path)?;
    vs.freeze();
    let parameters = parameter_count(&vs);

    Ok(LoadedNetwork {
        network,
        size_bytes,
        parameters,
        _vs: vs,
    })
}
