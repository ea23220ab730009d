//! Device buffers behind one interface, and the factory that picks a
//! strategy per allocation.
//!
//! Two interchangeable strategies:
//!
//! - **Regular** — device and host memory are distinct; transfers are
//!   explicit `clEnqueueRead/WriteBuffer` commands.
//! - **Shared-address (SVM)** — host and device address one allocation;
//!   transfers are plain memory copies, bracketed by map/unmap fences on
//!   coarse-grained devices and fence-free on fine-grained ones.
//!
//! [`BufferFactory::determine_strategy`] chooses between them from the
//! device capability plus size/usage heuristics; a shared-address
//! allocation that fails at runtime transparently falls back to Regular
//! (counted separately in the factory statistics).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use opencl3::command_queue::CommandQueue;
use opencl3::event::Event;
use opencl3::kernel::ExecuteKernel;
use opencl3::memory::{ClMem, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY};
use opencl3::types::{cl_event, cl_mem_flags};

use crate::device::{DeviceContext, SvmCapability};
use crate::{RclError, RclResult};

mod regular;
mod shared;

pub use regular::{ExternalBuffer, RegularBuffer};
pub use shared::SharedBuffer;


/// Memory-access mode of a device buffer, from the device's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// The device only reads; the host writes.
    ReadOnly,
    /// The device only writes; the host reads.
    WriteOnly,
    /// Both directions.
    ReadWrite,
}

impl AccessMode {
    pub(crate) fn mem_flags(self) -> cl_mem_flags {
        match self {
            Self::ReadOnly => CL_MEM_READ_ONLY,
            Self::WriteOnly => CL_MEM_WRITE_ONLY,
            Self::ReadWrite => CL_MEM_READ_WRITE,
        }
    }
}

/// Which allocation strategy backs a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStrategy {
    /// Distinct host/device memory with explicit transfers.
    Regular,
    /// Shared address space with map/unmap coherence fences.
    SharedCoarse,
    /// Fully coherent shared address space, no fences.
    SharedFine,
}

impl BufferStrategy {
    /// Whether this is one of the shared-address sub-modes.
    pub fn is_shared(self) -> bool {
        matches!(self, Self::SharedCoarse | Self::SharedFine)
    }
}

/// How the caller expects to touch the buffer from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageHint {
    /// Never touched by the host after creation; sharing has no benefit.
    DeviceOnly,
    /// Occasional host access (upload once, read back at the end).
    HostRare,
    /// Frequent host read/write; sharing pays off when supported.
    HostFrequent,
}

/// Thresholds and overrides for [`BufferFactory::determine_strategy`].
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// When set, overrides every heuristic.
    pub force: Option<BufferStrategy>,
    /// Below this size sharing setup overhead dominates; use Regular.
    pub small_buffer_threshold: usize,
    /// Above this size prefer shared-address when the device supports it.
    pub large_buffer_threshold: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            force: None,
            small_buffer_threshold: 1024 * 1024,       // 1 MiB
            large_buffer_threshold: 64 * 1024 * 1024,  // 64 MiB
        }
    }
}

/// Pick a strategy from size, usage hint, and device SVM capability.
///
/// Decision order: force-flag, device-only hint, small-buffer threshold,
/// large-buffer / host-frequent preference, Regular fallback. Never fails;
/// an unsupported choice degrades to the best supported mode.
pub fn determine_strategy(
    size_bytes: usize,
    hint: UsageHint,
    svm: SvmCapability,
    config: &StrategyConfig,
) -> BufferStrategy {
    if let Some(forced) = config.force {
        return forced;
    }
    if hint == UsageHint::DeviceOnly {
        return BufferStrategy::Regular;
    }
    if size_bytes < config.small_buffer_threshold {
        return BufferStrategy::Regular;
    }
    if size_bytes > config.large_buffer_threshold || hint == UsageHint::HostFrequent {
        return match svm {
            SvmCapability::FineGrain => BufferStrategy::SharedFine,
            SvmCapability::CoarseGrain => BufferStrategy::SharedCoarse,
            SvmCapability::None => BufferStrategy::Regular,
        };
    }
    BufferStrategy::Regular
}

/// A device buffer, independent of the backing strategy.
///
/// Blocking `write`/`read` return once the transfer is complete; the
/// `_async` variants return the completion [`Event`] instead, for use in
/// event wait-lists. Transfers larger than the buffer's capacity fail with
/// [`RclError::SizeMismatch`].
pub trait DeviceBuffer<T>: Send + Sync {
    /// Element count.
    fn len(&self) -> usize;

    /// True when the buffer holds zero elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in bytes.
    fn size_bytes(&self) -> usize;

    /// Memory-access mode the buffer was created with.
    fn mode(&self) -> AccessMode;

    /// The strategy backing this buffer.
    fn strategy(&self) -> BufferStrategy;

    /// Blocking upload of `data` starting at element 0.
    fn write(&self, queue: &CommandQueue, data: &[T]) -> RclResult<()>;

    /// Blocking download of the whole buffer.
    fn read(&self, queue: &CommandQueue) -> RclResult<Vec<T>>;

    /// Enqueue an upload; returns the completion event.
    fn write_async(
        &self,
        queue: &CommandQueue,
        data: &[T],
        wait: &[cl_event],
    ) -> RclResult<Event>;

    /// Enqueue a download of `out.len()` elements; returns the completion
    /// event. `out` must stay alive and untouched until the event fires.
    fn read_async(
        &self,
        queue: &CommandQueue,
        out: &mut [T],
        wait: &[cl_event],
    ) -> RclResult<Event>;

    /// Enqueue a zero-fill of the whole buffer; returns the completion
    /// event.
    fn fill_zero(&self, queue: &CommandQueue, wait: &[cl_event]) -> RclResult<Event>;

    /// Bind this buffer as the next kernel argument.
    fn bind_arg(&self, kernel: &mut ExecuteKernel);
}

/// A factory-produced buffer of any strategy.
///
/// Concrete rather than a trait object so callers can park handles in the
/// [`BufferRegistry`](crate::registry::BufferRegistry), which needs a
/// sized type to downcast back to; it still coerces to
/// `Arc<dyn DeviceBuffer<T>>` wherever the interface alone matters.
pub enum AnyBuffer<T> {
    Regular(RegularBuffer<T>),
    Shared(SharedBuffer<T>),
    External(ExternalBuffer<T>),
}

impl<T: Copy + Default + Send + Sync> AnyBuffer<T> {
    fn inner(&self) -> &dyn DeviceBuffer<T> {
        match self {
            Self::Regular(b) => b,
            Self::Shared(b) => b,
            Self::External(b) => b,
        }
    }
}

impl<T: Copy + Default + Send + Sync> DeviceBuffer<T> for AnyBuffer<T> {
    fn len(&self) -> usize {
        self.inner().len()
    }

    fn size_bytes(&self) -> usize {
        self.inner().size_bytes()
    }

    fn mode(&self) -> AccessMode {
        self.inner().mode()
    }

    fn strategy(&self) -> BufferStrategy {
        self.inner().strategy()
    }

    fn write(&self, queue: &CommandQueue, data: &[T]) -> RclResult<()> {
        self.inner().write(queue, data)
    }

    fn read(&self, queue: &CommandQueue) -> RclResult<Vec<T>> {
        self.inner().read(queue)
    }

    fn write_async(
        &self,
        queue: &CommandQueue,
        data: &[T],
        wait: &[cl_event],
    ) -> RclResult<Event> {
        self.inner().write_async(queue, data, wait)
    }

    fn read_async(
        &self,
        queue: &CommandQueue,
        out: &mut [T],
        wait: &[cl_event],
    ) -> RclResult<Event> {
        self.inner().read_async(queue, out, wait)
    }

    fn fill_zero(&self, queue: &CommandQueue, wait: &[cl_event]) -> RclResult<Event> {
        self.inner().fill_zero(queue, wait)
    }

    fn bind_arg(&self, kernel: &mut ExecuteKernel) {
        self.inner().bind_arg(kernel)
    }
}

pub(crate) fn check_transfer<T>(
    op: &'static str,
    buf: &dyn DeviceBuffer<T>,
    requested: usize,
) -> RclResult<()> {
    if requested > buf.len() {
        return Err(RclError::SizeMismatch {
            op,
            requested,
            capacity: buf.len(),
        });
    }
    Ok(())
}

/// Creation counters, by strategy plus the shared→regular fallback path.
#[derive(Debug, Clone, Default)]
pub struct FactoryStatistics {
    /// Buffers created with the Regular strategy (not counting fallbacks).
    pub regular: u64,
    /// Buffers created with a shared-address strategy.
    pub shared: u64,
    /// Shared-address allocations that fell back to Regular at runtime.
    pub shared_fallbacks: u64,
    /// Non-owning wrappers over external allocations.
    pub wrapped: u64,
    /// Total bytes allocated through the factory (wrapped excluded).
    pub total_bytes: u64,
}

impl std::fmt::Display for FactoryStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "buffer factory: {} regular, {} shared ({} fallbacks), {} wrapped, {} bytes total",
            self.regular, self.shared, self.shared_fallbacks, self.wrapped, self.total_bytes
        )
    }
}

/// Creates device buffers, picking a strategy per allocation.
pub struct BufferFactory {
    ctx: Arc<DeviceContext>,
    config: StrategyConfig,
    regular: AtomicU64,
    shared: AtomicU64,
    shared_fallbacks: AtomicU64,
    wrapped: AtomicU64,
    total_bytes: AtomicU64,
}

impl BufferFactory {
    pub fn new(ctx: &Arc<DeviceContext>) -> Self {
        Self::with_config(ctx, StrategyConfig::default())
    }

    pub fn with_config(ctx: &Arc<DeviceContext>, config: StrategyConfig) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            config,
            regular: AtomicU64::new(0),
            shared: AtomicU64::new(0),
            shared_fallbacks: AtomicU64::new(0),
            wrapped: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        }
    }

    /// The context this factory allocates against.
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Apply the strategy policy for an allocation of `size_bytes`.
    pub fn determine_strategy(&self, size_bytes: usize, hint: UsageHint) -> BufferStrategy {
        determine_strategy(size_bytes, hint, self.ctx.info().svm, &self.config)
    }

    /// Create a buffer of `len` elements using the policy-chosen strategy.
    pub fn create<T: Copy + Default + Send + Sync + 'static>(
        &self,
        len: usize,
        mode: AccessMode,
        hint: UsageHint,
    ) -> RclResult<Arc<AnyBuffer<T>>> {
        let strategy = self.determine_strategy(len * std::mem::size_of::<T>(), hint);
        self.create_with_strategy(len, mode, strategy)
    }

    /// Create a buffer with an explicit strategy override.
    ///
    /// A failed shared-address allocation falls back to Regular instead of
    /// propagating; every other allocation failure is fatal for the caller.
    pub fn create_with_strategy<T: Copy + Default + Send + Sync + 'static>(
        &self,
        len: usize,
        mode: AccessMode,
        strategy: BufferStrategy,
    ) -> RclResult<Arc<AnyBuffer<T>>> {
        let bytes = len * std::mem::size_of::<T>();
        if strategy.is_shared() {
            match SharedBuffer::<T>::create(
                &self.ctx,
                len,
                mode,
                strategy == BufferStrategy::SharedFine,
            ) {
                Ok(buf) => {
                    self.shared.fetch_add(1, Ordering::Relaxed);
                    self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                    return Ok(Arc::new(AnyBuffer::Shared(buf)));
                }
                Err(e) => {
                    log::warn!(
                        "shared-address allocation of {bytes} bytes failed ({e}); \
                         falling back to regular"
                    );
                    self.shared_fallbacks.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        let buf = RegularBuffer::<T>::create(&self.ctx, len, mode)?;
        self.regular.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        Ok(Arc::new(AnyBuffer::Regular(buf)))
    }

    /// Build a non-owning Regular-strategy wrapper over an allocation the
    /// caller still owns.
    ///
    /// Fails with [`RclError::ContextMismatch`] when the external
    /// allocation does not belong to this factory's execution context —
    /// cross-context buffers are a fatal usage error, never silently
    /// tolerated.
    ///
    /// # Safety
    ///
    /// The caller guarantees the external allocation outlives the returned
    /// wrapper; the wrapper never retains or releases the handle.
    pub unsafe fn wrap_external<T: Copy + Default + Send + Sync + 'static>(
        &self,
        mem: &impl ClMem,
        len: usize,
        mode: AccessMode,
    ) -> RclResult<Arc<AnyBuffer<T>>> {
        let mem_ctx = mem
            .context()
            .map_err(|e| crate::api_error("clGetMemObjectInfo", e))?;
        if mem_ctx != self.ctx.raw_context() {
            return Err(RclError::ContextMismatch {
                op: "wrap_external",
            });
        }
        self.wrapped.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(AnyBuffer::External(ExternalBuffer::wrap(
            mem.get(),
            len,
            mode,
        ))))
    }

    /// Snapshot of the creation counters.
    pub fn statistics(&self) -> FactoryStatistics {
        FactoryStatistics {
            regular: self.regular.load(Ordering::Relaxed),
            shared: self.shared.load(Ordering::Relaxed),
            shared_fallbacks: self.shared_fallbacks.load(Ordering::Relaxed),
            wrapped: self.wrapped.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
        }
    }
}
