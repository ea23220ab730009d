//! GPU compute resource management for a radar signal-processing pipeline.
//!
//! `rcl` owns the OpenCL device context, multiplexes work across a pool of
//! out-of-order command queues, caches compiled programs and kernels, and
//! schedules large batched FFT workloads within a device memory budget.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐    ┌───────────┐    ┌──────────────────────────┐
//! │ DeviceContext │───▶│ QueuePool │───▶│ ProgramCache / Factory   │
//! └───────────────┘    └───────────┘    └──────────┬───────────────┘
//!                                                  │
//!                                       ┌──────────▼───────────────┐
//!                                       │ BatchScheduler           │
//!                                       │  pad ─▶ transform ─▶ peak│
//!                                       └──────────────────────────┘
//! ```
//!
//! The domain math (chirp generation, fractional-delay interpolation,
//! peak refinement) is injected as opaque kernel source text; this crate
//! only guarantees that identical source compiles to one cached artifact
//! and that the per-row [`PeakRecord`](scheduler::PeakRecord) layout stays
//! stable for downstream consumers.
//!
//! # Usage
//!
//! ```rust,no_run
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use rcl::device::{DeviceContext, DeviceKind};
//! use rcl::queue::QueuePool;
//!
//! let ctx = Arc::new(DeviceContext::new(DeviceKind::Gpu)?);
//! println!("Using device: {}", ctx.info().name);
//!
//! let pool = Arc::new(QueuePool::new(&ctx, 4)?);
//! pool.finish_all()?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod cache;
pub mod device;
pub mod queue;
pub mod registry;
pub mod scheduler;

use crate::device::DeviceKind;

/// Broad classification of an [`RclError`], for callers that branch on
/// failure class rather than on the exact variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Platform/device discovery failed at construction time.
    Lifecycle,
    /// The device ran out of a resource (memory, handles).
    ResourceExhaustion,
    /// The caller violated an API contract (bad index, size, context).
    Usage,
    /// Kernel compilation failed; the error carries the build log.
    BuildDiagnostic,
}

/// Error type for rcl operations.
///
/// Variants carry the operation name and the numeric OpenCL error code
/// where one is available, so failures can be diagnosed without re-running.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RclError {
    /// No OpenCL platform exposes a device of the requested kind.
    DeviceNotFound {
        /// The device kind that was requested.
        kind: DeviceKind,
    },
    /// A device API call failed.
    Api {
        /// The OpenCL operation that failed (e.g. `clEnqueueNDRangeKernel`).
        op: &'static str,
        /// The OpenCL error code, or 0 when the platform did not report one.
        code: i32,
    },
    /// A device allocation failed.
    Allocation {
        /// The allocating operation (e.g. `clCreateBuffer`, `clSVMAlloc`).
        op: &'static str,
        /// Requested size in bytes.
        bytes: usize,
        /// The OpenCL error code, or 0 when the platform did not report one.
        code: i32,
    },
    /// Kernel source failed to build; carries the device build log.
    CompilationFailed {
        /// The platform's full build log.
        build_log: String,
    },
    /// The requested kernel entry point does not exist in the program.
    KernelNotFound {
        /// The entry-point name that was requested.
        name: String,
        /// The OpenCL error code.
        code: i32,
    },
    /// A wrapped buffer belongs to a different execution context.
    ContextMismatch {
        /// The operation that detected the mismatch.
        op: &'static str,
    },
    /// A queue (or similar slot) index was out of range.
    IndexOutOfRange {
        /// The offending index.
        index: usize,
        /// The number of valid slots.
        len: usize,
    },
    /// A transfer asked for more elements than the buffer holds.
    SizeMismatch {
        /// The transfer operation.
        op: &'static str,
        /// Elements requested.
        requested: usize,
        /// Elements the buffer holds.
        capacity: usize,
    },
    /// A configuration value is outside its legal range.
    InvalidConfig {
        /// Human-readable description of the violation.
        reason: String,
    },
}

impl RclError {
    /// Classify this error into one of the four broad kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceNotFound { .. } => ErrorKind::Lifecycle,
            Self::Allocation { .. } => ErrorKind::ResourceExhaustion,
            Self::CompilationFailed { .. } => ErrorKind::BuildDiagnostic,
            Self::Api { .. }
            | Self::KernelNotFound { .. }
            | Self::ContextMismatch { .. }
            | Self::IndexOutOfRange { .. }
            | Self::SizeMismatch { .. }
            | Self::InvalidConfig { .. } => ErrorKind::Usage,
        }
    }
}

impl std::fmt::Display for RclError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceNotFound { kind } => {
                write!(f, "no OpenCL {kind} device found on any platform")
            }
            Self::Api { op, code } => write!(f, "{op} failed with error {code}"),
            Self::Allocation { op, bytes, code } => {
                write!(f, "{op} failed to allocate {bytes} bytes (error {code})")
            }
            Self::CompilationFailed { build_log } => {
                write!(f, "kernel compilation failed:\n{build_log}")
            }
            Self::KernelNotFound { name, code } => {
                write!(f, "kernel entry point '{name}' not found (error {code})")
            }
            Self::ContextMismatch { op } => {
                write!(f, "{op}: buffer belongs to a different execution context")
            }
            Self::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range for {len} slots")
            }
            Self::SizeMismatch {
                op,
                requested,
                capacity,
            } => {
                write!(
                    f,
                    "{op}: {requested} elements requested but buffer holds {capacity}"
                )
            }
            Self::InvalidConfig { reason } => write!(f, "invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for RclError {}

pub type RclResult<T> = Result<T, RclError>;

/// Map an opencl3 API error to [`RclError::Api`], keeping the numeric code.
pub(crate) fn api_error(op: &'static str, err: opencl3::error_codes::ClError) -> RclError {
    RclError::Api { op, code: err.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        let e = RclError::DeviceNotFound {
            kind: DeviceKind::Gpu,
        };
        assert_eq!(e.kind(), ErrorKind::Lifecycle);

        let e = RclError::Allocation {
            op: "clCreateBuffer",
            bytes: 1024,
            code: -4,
        };
        assert_eq!(e.kind(), ErrorKind::ResourceExhaustion);

        let e = RclError::CompilationFailed {
            build_log: "error: expected ';'".into(),
        };
        assert_eq!(e.kind(), ErrorKind::BuildDiagnostic);

        let e = RclError::ContextMismatch { op: "wrap_external" };
        assert_eq!(e.kind(), ErrorKind::Usage);
    }

    #[test]
    fn test_error_display_carries_detail() {
        let e = RclError::SizeMismatch {
            op: "write",
            requested: 100,
            capacity: 64,
        };
        let msg = e.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("64"));

        let e = RclError::CompilationFailed {
            build_log: "line 3: unknown type 'floatt'".into(),
        };
        assert!(e.to_string().contains("unknown type"));
    }
}
