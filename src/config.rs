use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

use tch::Device;

pub const DEFAULT_INPUT_SIZE: i64 = 256;
pub const DEFAULT_MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_path: Option<PathBuf>,
    pub device: Device,
    pub input_size: i64,
    pub base_channels: i64,
    pub bilinear: bool,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub max_file_size: usize,
    pub jpeg_quality: u8,
    pub cpu_threads: i32,
    pub max_concurrent_jobs: usize,
    pub max_pending_jobs: usize,
    /// Finished job records kept in memory; older ones are evicted first.
    pub max_finished_jobs: usize,
    pub enable_enhancement: bool,
    pub create_comparison: bool,
    pub cors_origins: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8000),
            model_path: None,
            device: Device::Cpu,
            input_size: DEFAULT_INPUT_SIZE,
            base_channels: 64,
            bilinear: false,
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("outputs"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            jpeg_quality: 95,
            cpu_threads: default_cpu_threads(),
            max_concurrent_jobs: 2,
            max_pending_jobs: 32,
            max_finished_jobs: 1024,
            enable_enhancement: false,
            create_comparison: false,
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        // A missing .env file is the normal case outside development.
        let _ = dotenvy::dotenv();

        let defaults = Self::default();

        let listen_addr = env::var("SERVER_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.listen_addr);

        let model_path = env::var("MODEL_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let device = {
            let raw = env::var("DEVICE").unwrap_or_else(|_| "cpu".into());
            parse_device(&raw)
        };

        let input_size = env_or("INPUT_SIZE", defaults.input_size);
        if input_size % 16 != 0 {
            tracing::warn!(
                input_size,
                "input size is not a multiple of 16; skip connections will be padded"
            );
        }

        let upload_dir = env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.upload_dir);
        let output_dir = env::var("OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir);

        let cors_origins = env::var("CORS_ORIGINS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|origins| !origins.is_empty())
            .unwrap_or(defaults.cors_origins);

        Ok(Self {
            listen_addr,
            model_path,
            device,
            input_size,
            base_channels: env_or("MODEL_BASE_CHANNELS", defaults.base_channels),
            bilinear: env_or("MODEL_BILINEAR", defaults.bilinear),
            upload_dir,
            output_dir,
            max_file_size: env_or("MAX_FILE_SIZE", defaults.max_file_size),
            jpeg_quality: env_or("JPEG_QUALITY", defaults.jpeg_quality).clamp(1, 100),
            cpu_threads: env_or("CPU_THREADS", defaults.cpu_threads).max(1),
            max_concurrent_jobs: env_or("MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs)
                .max(1),
            max_pending_jobs: env_or("MAX_PENDING_JOBS", defaults.max_pending_jobs).max(1),
            max_finished_jobs: env_or("MAX_FINISHED_JOBS", defaults.max_finished_jobs),
            enable_enhancement: env_or("ENABLE_ENHANCEMENT", defaults.enable_enhancement),
            create_comparison: env_or("CREATE_COMPARISON", defaults.create_comparison),
            cors_origins,
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn default_cpu_threads() -> i32 {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    cpus.min(4) as i32
}

pub fn parse_device(raw: &str) -> Device {
    let lower = raw.trim().to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            tracing::warn!(requested = %raw, "CUDA not available, falling back to CPU");
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_contract() {
        let config = AppConfig::default();
        assert_eq!(config.input_size, 256);
        assert_eq!(config.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.base_channels, 64);
        assert!(!config.bilinear);
        assert!(config.model_path.is_none());
        assert!(config.cpu_threads >= 1 && config.cpu_threads <= 4);
        assert_eq!(config.max_finished_jobs, 1024);
        assert!(!config.enable_enhancement && !config.create_comparison);
    }

    #[test]
    fn unknown_device_strings_select_cpu() {
        assert_eq!(parse_device("cpu"), Device::Cpu);
        assert_eq!(parse_device("tpu"), Device::Cpu);
        if !tch::Cuda::is_available() {
            assert_eq!(parse_device("cuda:1"), Device::Cpu);
        }
    }
}
