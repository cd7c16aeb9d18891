use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Loaded,
    NotLoaded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub description: String,
    pub architecture: String,
    pub input_format: String,
    pub output_format: String,
    pub status: ModelStatus,
    pub weights_path: Option<String>,
    pub size_bytes: Option<u64>,
    pub parameters: Option<u64>,
    pub device: String,
    pub error: Option<String>,
}
