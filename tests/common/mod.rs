#![allow(dead_code)]

use std::{io::Cursor, path::Path, sync::Arc};

use axum::{
    Router,
    body::{Body, Bytes},
    http::{Method, Request, Response, header::CONTENT_TYPE},
};
use http_body_util::BodyExt;
use image::{GrayImage, ImageFormat, Luma};
use tch::{Device, nn};
use tempfile::TempDir;
use tower::ServiceExt;

use image_colorization_service::{
    AppConfig, ModelRegistry, build_router,
    model::unet::{UNet, UNetConfig},
};

const BOUNDARY: &str = "colorizer-test-boundary";
const BASE_CHANNELS: i64 = 8;

pub struct TestApp {
    pub router: Router,
    pub config: Arc<AppConfig>,
    _dir: TempDir,
}

/// Build the production router over temporary artifact directories.
/// With `with_model`, a freshly initialised narrow network is saved and loaded
/// through the normal weights path.
pub fn build_test_app(with_model: bool) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let model_path = with_model.then(|| export_weights(dir.path()));

    let config = Arc::new(AppConfig {
        model_path,
        base_channels: BASE_CHANNELS,
        upload_dir: dir.path().join("uploads"),
        output_dir: dir.path().join("outputs"),
        cpu_threads: 2,
        ..AppConfig::default()
    });
    let registry = Arc::new(ModelRegistry::initialize(config.as_ref()));
    let router = build_router(config.clone(), registry);

    TestApp {
        router,
        config,
        _dir: dir,
    }
}

fn export_weights(dir: &Path) -> std::path::PathBuf {
    let vs = nn::VarStore::new(Device::Cpu);
    let _net = UNet::new(
        &vs.root(),
        UNetConfig {
            base_channels: BASE_CHANNELS,
            ..Default::default()
        },
    );
    let path = dir.join("colorizer.safetensors");
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

pub fn multipart_request(field: &str, file_name: &str, content_type: &str, data: &[u8]) -> Request<Body> {
    let mut body = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n\
         Content-Type: {content_type}\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri("/api/colorize")
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(app, request).await
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
