//! Device discovery and the process-wide execution context.
//!
//! One [`DeviceContext`] is constructed per process (or per device) and
//! passed by `Arc` to every dependent component: the queue pool, the
//! program cache, the buffer factory, and the batch scheduler. There is no
//! hidden global; tearing everything down is dropping the last `Arc`, and
//! re-initialization is constructing a fresh context.

use crate::{RclError, RclResult};

use opencl3::context::Context;
use opencl3::device::{
    get_all_devices, Device, CL_DEVICE_SVM_COARSE_GRAIN_BUFFER, CL_DEVICE_SVM_FINE_GRAIN_BUFFER,
    CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU,
};
use opencl3::types::{cl_context, cl_device_id, cl_device_type};

/// Which kind of compute device to select at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// A GPU device (preferred for the radar pipeline).
    Gpu,
    /// A CPU OpenCL device (useful for machines without a usable GPU).
    Cpu,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gpu => write!(f, "GPU"),
            Self::Cpu => write!(f, "CPU"),
        }
    }
}

/// Shared virtual memory support advertised by a device, best mode first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SvmCapability {
    /// No shared-address support; all transfers are explicit copies.
    None,
    /// Host and device share allocations but need map/unmap fences.
    CoarseGrain,
    /// Fully coherent sharing; no fences required.
    FineGrain,
}

/// Information about a discovered OpenCL device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Human-readable device name (e.g. "NVIDIA GeForce RTX 3080").
    pub name: String,
    /// Device vendor string.
    pub vendor: String,
    /// Whether this is a GPU device (vs CPU or accelerator).
    pub is_gpu: bool,
    /// Maximum work-group size supported by the device.
    pub max_work_group_size: usize,
    /// Global memory size in bytes.
    pub global_mem_size: u64,
    /// Best shared-address mode the device advertises.
    pub svm: SvmCapability,
}

fn svm_capability_of(device: &Device) -> SvmCapability {
    let caps = device.svm_mem_capability();
    if caps & CL_DEVICE_SVM_FINE_GRAIN_BUFFER != 0 {
        SvmCapability::FineGrain
    } else if caps & CL_DEVICE_SVM_COARSE_GRAIN_BUFFER != 0 {
        SvmCapability::CoarseGrain
    } else {
        SvmCapability::None
    }
}

fn info_of(device: &Device) -> DeviceInfo {
    let dev_type: cl_device_type = device.dev_type().unwrap_or(0);
    DeviceInfo {
        name: device.name().unwrap_or_default().trim().to_string(),
        vendor: device.vendor().unwrap_or_default().trim().to_string(),
        is_gpu: (dev_type & CL_DEVICE_TYPE_GPU) != 0,
        max_work_group_size: device.max_work_group_size().unwrap_or(1),
        global_mem_size: device.global_mem_size().unwrap_or(0),
        svm: svm_capability_of(device),
    }
}

/// Probe all available OpenCL devices without creating a context.
///
/// Returns an empty vec if no OpenCL runtime is installed or no devices
/// are found (never errors).
pub fn probe_devices() -> Vec<DeviceInfo> {
    let device_ids = match get_all_devices(CL_DEVICE_TYPE_ALL) {
        Ok(ids) => ids,
        Err(_) => return Vec::new(),
    };
    device_ids
        .into_iter()
        .map(|id| info_of(&Device::new(id)))
        .collect()
}

/// Return the number of available OpenCL devices.
///
/// Lightweight: no contexts are created. Returns 0 if OpenCL is not
/// available.
pub fn device_count() -> usize {
    get_all_devices(CL_DEVICE_TYPE_ALL)
        .map(|ids| ids.len())
        .unwrap_or(0)
}

/// The selected compute device and its execution context.
///
/// All other components hold an `Arc<DeviceContext>`; the context outlives
/// every queue, program, and buffer created against it.
///
/// Note: `Debug` is implemented manually because the OpenCL handle types
/// from `opencl3` don't implement `Debug`.
pub struct DeviceContext {
    device: Device,
    context: Context,
    info: DeviceInfo,
    kind: DeviceKind,
}

// SAFETY: OpenCL 1.2+ guarantees thread safety for context and device
// objects. The raw pointers in opencl3 types are opaque handles to the
// OpenCL runtime, which serializes access internally.
unsafe impl Send for DeviceContext {}
unsafe impl Sync for DeviceContext {}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("kind", &self.kind)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl DeviceContext {
    /// Select a device of the given kind and create an execution context.
    ///
    /// GPU candidates are sorted by global memory descending (a reliable
    /// heuristic for discrete vs integrated — discrete GPUs have dedicated
    /// VRAM while integrated GPUs share system RAM and report less). Each
    /// candidate is tried in order, since some drivers accept device
    /// enumeration but fail context creation.
    pub fn new(kind: DeviceKind) -> RclResult<Self> {
        let cl_type = match kind {
            DeviceKind::Gpu => CL_DEVICE_TYPE_GPU,
            DeviceKind::Cpu => CL_DEVICE_TYPE_CPU,
        };
        let mut ids: Vec<cl_device_id> = get_all_devices(cl_type).unwrap_or_default();
        if ids.is_empty() {
            return Err(RclError::DeviceNotFound { kind });
        }
        if kind == DeviceKind::Gpu {
            ids.sort_by(|a, b| {
                let mem_a = Device::new(*a).global_mem_size().unwrap_or(0);
                let mem_b = Device::new(*b).global_mem_size().unwrap_or(0);
                mem_b.cmp(&mem_a)
            });
        }

        for id in ids {
            let device = Device::new(id);
            let Ok(context) = Context::from_device(&device) else {
                continue;
            };
            let info = info_of(&device);
            log::info!(
                "selected {} device '{}' ({} MiB global, svm: {:?})",
                kind,
                info.name,
                info.global_mem_size / (1024 * 1024),
                info.svm,
            );
            return Ok(Self {
                device,
                context,
                info,
                kind,
            });
        }
        Err(RclError::DeviceNotFound { kind })
    }

    /// The capability snapshot taken at construction.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// The kind that was requested at construction.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// The underlying opencl3 context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The underlying opencl3 device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Raw context handle, for identity comparison against wrapped buffers.
    pub fn raw_context(&self) -> cl_context {
        self.context.get()
    }

    /// Device global memory in bytes (0 if the query failed at probe time).
    pub fn global_mem_size(&self) -> u64 {
        self.info.global_mem_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_devices_does_not_panic() {
        // Must never panic, even without an OpenCL runtime.
        let devices = probe_devices();
        for d in &devices {
            assert!(d.max_work_group_size >= 1);
        }
    }

    #[test]
    fn test_device_count_matches_probe() {
        assert_eq!(device_count(), probe_devices().len());
    }

    #[test]
    fn test_svm_capability_ordering() {
        // The factory picks the "best" mode via Ord; keep the ordering pinned.
        assert!(SvmCapability::FineGrain > SvmCapability::CoarseGrain);
        assert!(SvmCapability::CoarseGrain > SvmCapability::None);
    }

    #[test]
    fn test_context_creation() {
        // Passes when a device is present, skips otherwise.
        match DeviceContext::new(DeviceKind::Gpu) {
            Ok(ctx) => {
                assert!(!ctx.info().name.is_empty());
                assert!(ctx.info().max_work_group_size > 0);
                assert!(!ctx.raw_context().is_null());
            }
            Err(RclError::DeviceNotFound { .. }) => {
                // No GPU available, that's fine.
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
