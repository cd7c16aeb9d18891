//! Compute-device selection and memory housekeeping around inference.
//!
//! The governor owns the process's device context. Forward passes run while
//! holding the device lock shared; memory-release cycles take it exclusively,
//! so a release never overlaps an in-flight forward pass.

use parking_lot::RwLock;
use serde::Serialize;
use sysinfo::{Pid, System};
use tch::{Cuda, Device};
use tracing::{debug, info, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize)]
pub struct DeviceContext {
    pub device: String,
    pub cpu_threads: i32,
    pub cuda_devices: i64,
    pub cudnn_benchmark: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryInfo {
    #[serde(flatten)]
    pub context: DeviceContext,
    pub resident_memory_mb: Option<f64>,
    pub virtual_memory_mb: Option<f64>,
    /// Resident set as a share of physical memory.
    pub memory_percent: Option<f64>,
}

pub struct ResourceGovernor {
    device: Device,
    context: DeviceContext,
    device_lock: RwLock<()>,
}

impl ResourceGovernor {
    /// Resolve `requested` against what the host offers and apply the
    /// device's threading policy. Call once at startup.
    pub fn configure(requested: Device, cpu_threads: i32) -> Self {
        let device = match requested {
            Device::Cuda(idx) if !Cuda::is_available() || idx as i64 >= Cuda::device_count() => {
                warn!(index = idx, "requested CUDA device unavailable, using CPU");
                Device::Cpu
            }
            other => other,
        };

        // Deterministic kernels on CPU; autotuned kernels on the accelerator.
        let cudnn_benchmark = matches!(device, Device::Cuda(_));
        if Cuda::cudnn_is_available() {
            Cuda::cudnn_set_benchmark(cudnn_benchmark);
        }

        let cpu_threads = cpu_threads.max(1);
        tch::set_num_threads(cpu_threads);

        let context = DeviceContext {
            device: describe(device),
            cpu_threads: tch::get_num_threads(),
            cuda_devices: Cuda::device_count(),
            cudnn_benchmark,
        };
        info!(device = %context.device, threads = context.cpu_threads, "device configured");

        Self {
            device,
            context,
            device_lock: RwLock::new(()),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    /// Run `work` between two memory-release cycles.
    pub fn run_scoped<T>(&self, work: impl FnOnce() -> T) -> T {
        self.release();
        let result = {
            let _shared = self.device_lock.read();
            work()
        };
        self.release();
        result
    }

    /// Return cached allocations to the system. Failures are logged only.
    pub fn release(&self) {
        let _exclusive = self.device_lock.write();
        if let Device::Cuda(idx) = self.device {
            Cuda::synchronize(idx as i64);
        }
        let trimmed = trim_heap();
        debug!(trimmed, "memory release cycle");
    }

    pub fn memory_info(&self) -> MemoryInfo {
        let mut system = System::new();
        system.refresh_memory();
        let pid = Pid::from_u32(std::process::id());
        let process = if system.refresh_process(pid) {
            system.process(pid)
        } else {
            None
        };
        if process.is_none() {
            debug!("process memory stats unavailable");
        }

        let total = system.total_memory();
        MemoryInfo {
            context: self.context.clone(),
            resident_memory_mb: process.map(|p| p.memory() as f64 / BYTES_PER_MB),
            virtual_memory_mb: process.map(|p| p.virtual_memory() as f64 / BYTES_PER_MB),
            memory_percent: process
                .filter(|_| total > 0)
                .map(|p| p.memory() as f64 / total as f64 * 100.0),
        }
    }
}

fn describe(device: Device) -> String {
    match device {
        Device::Cpu => "cpu".to_string(),
        Device::Cuda(idx) => format!("cuda:{idx}"),
        other => format!("{other:?}").to_lowercase(),
    }
}

#[cfg(all(feature = "heap-trim", target_os = "linux", target_env = "gnu"))]
fn trim_heap() -> bool {
    // SAFETY: malloc_trim only walks glibc's own arenas.
    unsafe { libc::malloc_trim(0) == 1 }
}

#[cfg(not(all(feature = "heap-trim", target_os = "linux", target_env = "gnu")))]
fn trim_heap() -> bool {
    false
}
