//! Conversion between image files and network tensors.
//!
//! Inputs become `[1, 1, size, size]` float tensors in `[0, 1]`; network
//! outputs (`[1, 3, H, W]`, roughly `[-1, 1]`) become 8-bit RGB buffers.
//! No color-space conversion is applied to the output channels.

use std::{
    ffi::OsString,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use image::{DynamicImage, ImageFormat, ImageReader, RgbImage, codecs::jpeg::JpegEncoder};
use tch::{Device, Kind, Tensor};
use tracing::warn;

use crate::error::ServiceError;

pub const OUTPUT_EXTENSION: &str = "jpg";

/// Read `path`, convert it to grayscale and resample it to `size`×`size`
/// with an area-averaging resample.
pub fn decode(path: &Path, size: i64) -> Result<Tensor, ServiceError> {
    Ok(luma_tensor(&open(path)?, size))
}

/// Read and decode the raster at `path`, whatever its extension says.
pub fn open(path: &Path) -> Result<DynamicImage, ServiceError> {
    ImageReader::open(path)
        .map_err(|err| ServiceError::Decode {
            path: path.to_path_buf(),
            source: image::ImageError::IoError(err),
        })?
        .with_guessed_format()
        .map_err(|err| ServiceError::Decode {
            path: path.to_path_buf(),
            source: image::ImageError::IoError(err),
        })?
        .decode()
        .map_err(|source| ServiceError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

fn luma_tensor(image: &DynamicImage, size: i64) -> Tensor {
    let gray = image.to_luma8();
    let (width, height) = gray.dimensions();
    let pixels: Vec<f32> = gray.as_raw().iter().map(|&v| f32::from(v)).collect();

    let tensor = Tensor::from_slice(&pixels).reshape([1, 1, height as i64, width as i64]);
    // Approximates area interpolation: each output cell is the mean of the
    // whole input pixels its window touches. Non-integer ratios give
    // overlapping windows with unit weights, where a true area filter would
    // weight the partially covered border pixels.
    let resized = tensor.adaptive_avg_pool2d([size, size]);

    resized / 255.0
}

/// Map a `[1, 3, H, W]` network output to an RGB buffer via `(v + 1) * 127.5`.
pub fn encode(output: &Tensor) -> Result<RgbImage, ServiceError> {
    let (batch, channels, height, width) = output.size4()?;
    if batch != 1 || channels != 3 {
        return Err(ServiceError::Encode(format!(
            "expected a [1, 3, H, W] tensor, got {:?}",
            output.size()
        )));
    }

    let hwc = output
        .squeeze_dim(0)
        .permute([1, 2, 0])
        .to_device(Device::Cpu)
        .to_kind(Kind::Float);
    let scaled = ((hwc + 1.0) * 127.5)
        .clamp(0.0, 255.0)
        .to_kind(Kind::Uint8)
        .contiguous()
        .flatten(0, -1);
    let bytes = Vec::<u8>::try_from(&scaled)?;

    RgbImage::from_raw(width as u32, height as u32, bytes)
        .ok_or_else(|| ServiceError::Encode("pixel buffer does not match dimensions".into()))
}

/// Encode `image` as JPEG into `writer`. Buffered bytes are flushed before
/// returning so write errors are reported rather than lost on drop.
pub fn write_jpeg<W: Write>(image: &RgbImage, writer: W, quality: u8) -> Result<(), ServiceError> {
    let mut writer = BufWriter::new(writer);
    image
        .write_with_encoder(JpegEncoder::new_with_quality(&mut writer, quality))
        .map_err(|err| ServiceError::Encode(err.to_string()))?;
    writer.flush()?;
    Ok(())
}

/// Persist an RGB buffer as JPEG, the fixed output artifact format.
///
/// The bytes land in a sibling `*.tmp` file which is synced and renamed over
/// `path`, so readers never see a partially written artifact.
pub fn save_jpeg(image: &RgbImage, path: &Path, quality: u8) -> Result<(), ServiceError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let staging = staging_path(path);
    let result = write_staged(image, &staging, quality)
        .and_then(|()| std::fs::rename(&staging, path).map_err(ServiceError::from));
    if result.is_err() {
        if let Err(err) = std::fs::remove_file(&staging) {
            warn!(path = %staging.display(), error = %err, "failed to remove staging file");
        }
    }
    result
}

fn write_staged(image: &RgbImage, staging: &Path, quality: u8) -> Result<(), ServiceError> {
    let mut file = File::create(staging)?;
    write_jpeg(image, &mut file, quality)?;
    file.sync_all()?;
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("artifact"));
    name.push(".tmp");
    path.with_file_name(name)
}

/// Sniff the raster format of an upload from its magic bytes.
pub fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes).ok()
}
