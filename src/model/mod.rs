mod colorizer;
mod registry;
mod types;
pub mod unet;

pub use colorizer::{Colorizer, MODEL_NAME};
pub use registry::ModelRegistry;
pub use types::{ModelDescriptor, ModelStatus};
