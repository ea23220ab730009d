//! Fixed-size pool of out-of-order command queues.
//!
//! Queues are independent submission streams: work enqueued to different
//! queues may overlap on the device. Every queue is created with
//! out-of-order execution enabled, so even within one queue the only
//! ordering guarantee comes from explicit event wait-lists — never from
//! enqueue order.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use opencl3::command_queue::{
    CommandQueue, CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE, CL_QUEUE_PROFILING_ENABLE,
};

use crate::device::DeviceContext;
use crate::{api_error, RclError, RclResult};

/// One command queue plus its usage counter.
///
/// Slots are owned by the pool and live until the pool is dropped; the
/// queue count is fixed at construction.
#[derive(Debug)]
pub struct QueueSlot {
    queue: CommandQueue,
    usage: AtomicU64,
}

impl QueueSlot {
    /// The wrapped command queue.
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// How many times this slot has been handed out.
    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }
}

/// Per-slot usage counts and load distribution for diagnostics.
///
/// The `Display` rendering is a human-readable report, not a stable
/// machine contract.
#[derive(Debug, Clone)]
pub struct PoolStatistics {
    /// Usage count per slot, indexed by queue index.
    pub per_slot: Vec<u64>,
}

impl PoolStatistics {
    /// Total number of queue acquisitions across all slots.
    pub fn total(&self) -> u64 {
        self.per_slot.iter().sum()
    }

    /// Load share of each slot as a percentage of the total (0.0 when idle).
    pub fn load_percentages(&self) -> Vec<f64> {
        let total = self.total();
        if total == 0 {
            return vec![0.0; self.per_slot.len()];
        }
        self.per_slot
            .iter()
            .map(|&u| u as f64 * 100.0 / total as f64)
            .collect()
    }
}

impl std::fmt::Display for PoolStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "queue pool: {} queues, {} acquisitions",
            self.per_slot.len(),
            self.total()
        )?;
        for (i, (count, pct)) in self
            .per_slot
            .iter()
            .zip(self.load_percentages())
            .enumerate()
        {
            writeln!(f, "  queue {i}: {count} uses ({pct:.1}%)")?;
        }
        Ok(())
    }
}

/// Fixed-size pool of command queues with round-robin selection.
pub struct QueuePool {
    _ctx: Arc<DeviceContext>,
    slots: Vec<QueueSlot>,
    next: AtomicUsize,
}

// SAFETY: OpenCL 1.2+ guarantees thread safety for command queue objects;
// the runtime serializes access to the underlying handles. The selection
// and usage counters are atomics.
unsafe impl Send for QueuePool {}
unsafe impl Sync for QueuePool {}

impl QueuePool {
    /// Create a pool of `n` queues against the given context.
    ///
    /// `n == 0` defaults to the host's available parallelism (minimum 1).
    /// Each queue is created with profiling and out-of-order execution
    /// enabled; on platforms without the OpenCL 2.0 queue-properties entry
    /// point, creation falls back to the 1.2 API with the same property
    /// bits.
    pub fn new(ctx: &Arc<DeviceContext>, n: usize) -> RclResult<Self> {
        let count = if n == 0 {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1)
        } else {
            n
        };
        log::debug!("creating queue pool with {count} queues");

        let props = CL_QUEUE_PROFILING_ENABLE | CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE;
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            let queue = match CommandQueue::create_default_with_properties(ctx.context(), props, 0)
            {
                Ok(q) => q,
                Err(_) => {
                    #[allow(deprecated)]
                    let q = CommandQueue::create_default(ctx.context(), props)
                        .map_err(|e| api_error("clCreateCommandQueue", e))?;
                    q
                }
            };
            slots.push(QueueSlot {
                queue,
                usage: AtomicU64::new(0),
            });
        }

        Ok(Self {
            _ctx: Arc::clone(ctx),
            slots,
            next: AtomicUsize::new(0),
        })
    }

    /// Number of queues in the pool (fixed after construction).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool holds no queues. Always false for a constructed pool.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Round-robin selection. Thread-safe; increments the slot's counter.
    pub fn next_queue(&self) -> &QueueSlot {
        &self.slots[self.next_index()]
    }

    /// Round-robin selection returning the slot index, for callers that
    /// store the index rather than borrow the slot.
    pub fn next_index(&self) -> usize {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        self.slots[idx].usage.fetch_add(1, Ordering::Relaxed);
        idx
    }

    /// Bounds-checked direct access by index.
    pub fn queue(&self, index: usize) -> RclResult<&QueueSlot> {
        self.slots.get(index).ok_or(RclError::IndexOutOfRange {
            index,
            len: self.slots.len(),
        })
    }

    /// Block until every queue has drained.
    pub fn finish_all(&self) -> RclResult<()> {
        for slot in &self.slots {
            slot.queue.finish().map_err(|e| api_error("clFinish", e))?;
        }
        Ok(())
    }

    /// Issue a non-blocking flush on every queue.
    pub fn flush_all(&self) -> RclResult<()> {
        for slot in &self.slots {
            slot.queue.flush().map_err(|e| api_error("clFlush", e))?;
        }
        Ok(())
    }

    /// Snapshot per-slot usage counts.
    pub fn statistics(&self) -> PoolStatistics {
        PoolStatistics {
            per_slot: self.slots.iter().map(|s| s.usage()).collect(),
        }
    }
}
