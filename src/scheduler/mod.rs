//! Batched execution of the pad → transform → reduce pipeline within a
//! device memory budget.
//!
//! One invocation moves through **Estimate → Decide → Execute → Collect**:
//! the memory footprint of the workload is estimated, compared against a
//! configurable fraction of device global memory, and the workload either
//! runs as a single pass or is split into batches ([`BatchPlan`]).
//! Batches run on one or more stream resource sets — each a queue, a
//! buffer set sized for the largest batch, a compiled transform plan, and
//! private kernel copies — with every stage dependency expressed as an
//! event wait, never as enqueue order (queues are out-of-order).
//!
//! # Kernel contract
//!
//! The domain math arrives as opaque source text in [`PipelineKernels`];
//! the scheduler owns argument binding and launch geometry. Entry points
//! must match:
//!
//! ```text
//! pad(input: const cfloat*, scratch: cfloat*,
//!     samples_per_row: uint, fft_size: uint, rows: uint)
//!         one work-item per scratch element of the batch
//! transform(scratch: cfloat*, rows: uint)       built with -DFFT_SIZE=<n>
//!         one launch per batch, sized for the provisioned row count
//! reduce(scratch: const cfloat*, records: peak_record*, fft_size: uint)
//!         one work-group per row, local size = reduce work-group size
//! ```
//!
//! where `cfloat` is two packed `float`s and `peak_record` matches
//! [`PeakRecord`] field for field.

use std::sync::{Arc, Mutex};

use opencl3::event::Event;
use opencl3::types::cl_uint;

use crate::buffer::BufferFactory;
use crate::cache::ProgramCache;
use crate::device::DeviceContext;
use crate::queue::QueuePool;
use crate::{api_error, RclError, RclResult};

mod plan;
mod stream;

pub use plan::{BatchPlan, BatchRange};

use stream::{BatchInFlight, StreamResource};

#[cfg(test)]
#[path = "tests.rs"]
mod tests;

/// One complex sample, matching the device's packed float pair.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Complex32 {
    pub re: f32,
    pub im: f32,
}

impl Complex32 {
    pub fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }
}

/// Per-row result record.
///
/// Must match the device-side `peak_record` struct exactly; this is the
/// one binary contract downstream report code depends on, so the layout
/// is pinned by tests and must not change.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeakRecord {
    /// Bin index of the strongest peak.
    pub peak_index: u32,
    /// Complex value at the peak.
    pub re: f32,
    pub im: f32,
    /// Peak magnitude.
    pub magnitude: f32,
    /// Peak phase in degrees.
    pub phase_deg: f32,
    /// Sub-bin frequency offset from parabolic interpolation around the
    /// top peak.
    pub freq_offset: f32,
    /// Refined frequency (bin + offset, scaled by the caller's bin width).
    pub refined_freq: f32,
}

/// Dimensions of one workload invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadShape {
    /// Number of independent rows (beams/channels).
    pub rows: usize,
    /// Complex samples per row before padding.
    pub samples_per_row: usize,
}

impl WorkloadShape {
    /// Total input length in complex samples.
    pub fn input_len(&self) -> usize {
        self.rows * self.samples_per_row
    }

    /// Transform length: input length rounded up to the next power of two,
    /// then doubled.
    pub fn padded_fft_size(&self) -> usize {
        self.samples_per_row.next_power_of_two() * 2
    }
}

/// Estimated device memory footprint of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryEstimate {
    /// Transform length each row is padded to.
    pub fft_size: usize,
    /// Bytes per row: input + transform working set + result record.
    pub bytes_per_row: usize,
    /// Footprint of the whole workload in one pass.
    pub total_bytes: u64,
}

/// Estimate the device bytes needed to run `shape` in a single pass.
pub fn estimate_memory(shape: WorkloadShape) -> MemoryEstimate {
    let fft_size = shape.padded_fft_size();
    let bytes_per_row = shape.samples_per_row * std::mem::size_of::<Complex32>()
        + fft_size * std::mem::size_of::<Complex32>()
        + std::mem::size_of::<PeakRecord>();
    MemoryEstimate {
        fft_size,
        bytes_per_row,
        total_bytes: shape.rows as u64 * bytes_per_row as u64,
    }
}

/// Hard cap on parallel streams, regardless of configuration.
pub const MAX_PARALLEL_STREAMS: usize = 8;

/// Caller-tunable scheduling knobs.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Fraction of total rows per batch when splitting.
    pub batch_size_ratio: f64,
    /// Fraction of device global memory treated as available; the rest is
    /// headroom for the driver and other allocations.
    pub memory_usage_limit: f64,
    /// Streams used in multi-batch mode; 1 means sequential batches.
    pub parallel_streams: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size_ratio: 0.25,
            memory_usage_limit: 0.4,
            parallel_streams: 2,
        }
    }
}

impl BatchConfig {
    /// Check ranges and clamp the stream count; rejects out-of-range
    /// fractions with [`RclError::InvalidConfig`].
    pub fn validated(mut self) -> RclResult<Self> {
        if !(self.batch_size_ratio > 0.0 && self.batch_size_ratio <= 1.0) {
            return Err(RclError::InvalidConfig {
                reason: format!(
                    "batch_size_ratio must be in (0, 1], got {}",
                    self.batch_size_ratio
                ),
            });
        }
        if !(self.memory_usage_limit > 0.0 && self.memory_usage_limit < 1.0) {
            return Err(RclError::InvalidConfig {
                reason: format!(
                    "memory_usage_limit must be in (0, 1), got {}",
                    self.memory_usage_limit
                ),
            });
        }
        if self.parallel_streams == 0 || self.parallel_streams > MAX_PARALLEL_STREAMS {
            let clamped = self.parallel_streams.clamp(1, MAX_PARALLEL_STREAMS);
            log::warn!(
                "parallel_streams {} clamped to {clamped}",
                self.parallel_streams
            );
            self.parallel_streams = clamped;
        }
        Ok(self)
    }
}

/// Opaque kernel source for the three pipeline stages.
///
/// The scheduler's only contract over the text is "identical source ⇒
/// identical cached artifact"; entry points must follow the module-level
/// kernel contract.
#[derive(Debug, Clone)]
pub struct PipelineKernels {
    pub pad_source: String,
    pub pad_entry: String,
    pub transform_source: String,
    pub transform_entry: String,
    pub reduce_source: String,
    pub reduce_entry: String,
    /// Extra build options shared by all three programs.
    pub build_options: String,
}

/// Which execution path an invocation took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// The whole workload fit the memory budget in one batch.
    SinglePass,
    /// Batches ran back to back on one stream.
    MultiBatch,
    /// Batches ran round-robin across `streams` concurrent streams.
    ParallelMultiBatch { streams: usize },
}

/// Extract elapsed time in milliseconds from a completed profiled event.
///
/// Requires queues created with `CL_QUEUE_PROFILING_ENABLE` (the pool
/// always does this). Returns `None` if the event carries no timing data.
pub fn event_elapsed_ms(event: &Event) -> Option<f64> {
    let start = event.profiling_command_start().ok()?;
    let end = event.profiling_command_end().ok()?;
    Some(end.saturating_sub(start) as f64 / 1_000_000.0)
}

/// Per-stage elapsed device time for one batch, in milliseconds.
///
/// Zero for a stage whose event carried no profiling data.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageTimings {
    pub upload_ms: f64,
    pub pad_ms: f64,
    pub transform_ms: f64,
    pub reduce_ms: f64,
    pub readback_ms: f64,
}

impl StageTimings {
    pub fn total_ms(&self) -> f64 {
        self.upload_ms + self.pad_ms + self.transform_ms + self.reduce_ms + self.readback_ms
    }

    fn accumulate(&mut self, other: &StageTimings) {
        self.upload_ms += other.upload_ms;
        self.pad_ms += other.pad_ms;
        self.transform_ms += other.transform_ms;
        self.reduce_ms += other.reduce_ms;
        self.readback_ms += other.readback_ms;
    }
}

/// Per-batch stage timings plus their sum over the invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationTimings {
    pub per_batch: Vec<StageTimings>,
}

impl InvocationTimings {
    /// Stage times summed across every batch.
    pub fn total(&self) -> StageTimings {
        let mut sum = StageTimings::default();
        for t in &self.per_batch {
            sum.accumulate(t);
        }
        sum
    }
}

/// Everything an invocation produced.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// One record per row, at the row's global index.
    pub records: Vec<PeakRecord>,
    /// The plan that was executed.
    pub plan: BatchPlan,
    /// Which path ran.
    pub mode: RunMode,
    /// Stream index each batch was assigned to, in batch order.
    pub assignments: Vec<usize>,
    /// Profiling data gathered from the stage events.
    pub timings: InvocationTimings,
}

/// Schedules batched pipeline invocations against a device memory budget.
///
/// Scratch buffers and the compiled transform plan are sized for the
/// largest batch of a plan and reused across all of its batches — and
/// across consecutive invocations, as long as capacity does not shrink.
/// Failure semantics are all-or-nothing: any stage failure aborts the
/// invocation and no partial result vector is returned.
pub struct BatchScheduler {
    ctx: Arc<DeviceContext>,
    pool: Arc<QueuePool>,
    cache: Arc<ProgramCache>,
    factory: Arc<BufferFactory>,
    config: BatchConfig,
    streams: Mutex<Vec<StreamResource>>,
}

impl BatchScheduler {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        pool: &Arc<QueuePool>,
        cache: &Arc<ProgramCache>,
        factory: &Arc<BufferFactory>,
        config: BatchConfig,
    ) -> RclResult<Self> {
        Ok(Self {
            ctx: Arc::clone(ctx),
            pool: Arc::clone(pool),
            cache: Arc::clone(cache),
            factory: Arc::clone(factory),
            config: config.validated()?,
            streams: Mutex::new(Vec::new()),
        })
    }

    /// The validated configuration in effect.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Device bytes the budget allows for one invocation.
    pub fn memory_budget(&self) -> u64 {
        (self.ctx.global_mem_size() as f64 * self.config.memory_usage_limit) as u64
    }

    /// Estimate, decide, and build the plan for `shape` without running.
    pub fn plan_for(&self, shape: WorkloadShape) -> BatchPlan {
        let est = estimate_memory(shape);
        if est.total_bytes <= self.memory_budget() {
            BatchPlan::single_pass(shape.rows, est.bytes_per_row)
        } else {
            BatchPlan::multi_batch(shape.rows, self.config.batch_size_ratio, est.bytes_per_row)
        }
    }

    /// Run the full pipeline over `input`, returning one [`PeakRecord`]
    /// per row.
    ///
    /// `input` holds `shape.rows × shape.samples_per_row` complex samples
    /// in row-major order. Memory estimation is best-effort: an
    /// under-estimate that still exceeds device capacity surfaces as an
    /// allocation failure, which aborts the invocation — there is no
    /// automatic shrink-and-retry.
    pub fn run(
        &self,
        input: &[Complex32],
        shape: WorkloadShape,
        kernels: &PipelineKernels,
    ) -> RclResult<BatchOutcome> {
        if input.len() != shape.input_len() {
            return Err(RclError::SizeMismatch {
                op: "run",
                requested: input.len(),
                capacity: shape.input_len(),
            });
        }
        if shape.rows == 0 {
            return Ok(BatchOutcome {
                records: Vec::new(),
                plan: BatchPlan::single_pass(0, 0),
                mode: RunMode::SinglePass,
                assignments: Vec::new(),
                timings: InvocationTimings::default(),
            });
        }

        let plan = self.plan_for(shape);
        let stream_count = self.stream_count(&plan);
        let mode = if plan.is_single_pass() {
            RunMode::SinglePass
        } else if stream_count == 1 {
            RunMode::MultiBatch
        } else {
            RunMode::ParallelMultiBatch {
                streams: stream_count,
            }
        };
        log::debug!(
            "workload of {} rows: {:?}, {} batches of ~{} rows",
            shape.rows,
            mode,
            plan.num_batches(),
            plan.batch_size,
        );

        let mut streams = self.streams.lock().unwrap();
        self.provision_streams(&mut streams, stream_count, plan.max_batch_items(), shape, kernels)?;

        let result = self.execute(&mut streams[..stream_count], input, shape, &plan);
        for s in streams.iter_mut() {
            s.clear_chain();
        }
        let (records, per_batch, assignments) = result?;
        Ok(BatchOutcome {
            records,
            plan,
            mode,
            assignments,
            timings: InvocationTimings { per_batch },
        })
    }

    /// Stream count: configured streams, bounded by the batch count and by
    /// the memory budget divided by the per-stream footprint. Always ≥ 1.
    fn stream_count(&self, plan: &BatchPlan) -> usize {
        if plan.is_single_pass() {
            return 1;
        }
        let stream_bytes = (plan.max_batch_items() * plan.bytes_per_item).max(1) as u64;
        let by_memory = (self.memory_budget() / stream_bytes).max(1) as usize;
        self.config
            .parallel_streams
            .min(plan.num_batches())
            .min(by_memory)
            .max(1)
    }

    fn provision_streams(
        &self,
        streams: &mut Vec<StreamResource>,
        count: usize,
        max_rows: usize,
        shape: WorkloadShape,
        kernels: &PipelineKernels,
    ) -> RclResult<()> {
        for i in 0..count {
            let adequate = streams
                .get(i)
                .is_some_and(|s| s.is_adequate(max_rows, shape, kernels));
            if adequate {
                continue;
            }
            let queue_index = match streams.get(i) {
                Some(existing) => existing.queue_index(),
                None => self.pool.next_index(),
            };
            let fresh = StreamResource::provision(
                &self.ctx,
                &self.factory,
                &self.cache,
                queue_index,
                max_rows,
                shape,
                kernels,
            )?;
            if i < streams.len() {
                streams[i] = fresh;
            } else {
                streams.push(fresh);
            }
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn execute(
        &self,
        streams: &mut [StreamResource],
        input: &[Complex32],
        shape: WorkloadShape,
        plan: &BatchPlan,
    ) -> RclResult<(Vec<PeakRecord>, Vec<StageTimings>, Vec<usize>)> {
        let k = streams.len();
        let mut in_flight: Vec<BatchInFlight> = Vec::with_capacity(plan.num_batches());
        let mut assignments = Vec::with_capacity(plan.num_batches());

        // Enqueue every batch's three-stage chain without waiting between
        // batches, then block on the whole set of readback events. Runs
        // inside a closure so that any failure drains the device BEFORE
        // `in_flight` (which owns the staging memory the device is still
        // writing into) can be dropped.
        let submitted: RclResult<()> = (|| {
            for (batch_idx, range) in plan.ranges.iter().enumerate() {
                let sid = batch_idx % k;
                assignments.push(sid);
                let slot = self.pool.queue(streams[sid].queue_index())?;
                let rows = &input[range.start * shape.samples_per_row
                    ..(range.start + range.count) * shape.samples_per_row];
                let batch = streams[sid].enqueue_batch(slot.queue(), *range, rows)?;
                in_flight.push(batch);
            }
            self.pool.flush_all()?;
            for batch in &in_flight {
                batch
                    .events
                    .read
                    .wait()
                    .map_err(|e| api_error("clWaitForEvents", e))?;
            }
            Ok(())
        })();
        if let Err(e) = submitted {
            let _ = self.pool.finish_all();
            return Err(e);
        }

        // Collect: every readback has completed; scatter each record to
        // its row's global index, whichever stream or batch produced it.
        let mut records = vec![PeakRecord::default(); shape.rows];
        let mut per_batch = Vec::with_capacity(in_flight.len());
        for batch in in_flight {
            for (i, record) in batch.staging.iter().enumerate() {
                records[batch.range.start + i] = *record;
            }
            per_batch.push(batch.events.timings());
        }
        Ok((records, per_batch, assignments))
    }
}

pub(crate) fn as_cl_uint(v: usize) -> cl_uint {
    v as cl_uint
}
