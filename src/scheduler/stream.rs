//! Per-stream resources and the event-chained batch pipeline.
//!
//! A stream is one queue, one buffer set sized for the largest batch it
//! will process, one compiled transform plan, and its own pad/reduce
//! kernel copies. Kernels carry bound arguments as mutable state, so a
//! handle must never be shared across concurrently-enqueueing streams —
//! each stream gets private copies up front.

use std::sync::Arc;

use opencl3::command_queue::CommandQueue;
use opencl3::event::Event;
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::types::cl_event;

use crate::buffer::{AccessMode, BufferFactory, BufferStrategy, DeviceBuffer};
use crate::cache::{source_key, ProgramCache};
use crate::device::DeviceContext;
use crate::scheduler::{
    as_cl_uint, event_elapsed_ms, BatchRange, Complex32, PeakRecord, PipelineKernels,
    StageTimings, WorkloadShape,
};
use crate::{api_error, RclResult};

/// The completion events of one batch's stage chain.
pub(crate) struct StageEvents {
    pub upload: Event,
    pub fill: Option<Event>,
    pub pad: Event,
    pub transform: Event,
    pub reduce: Event,
    pub read: Event,
}

impl StageEvents {
    /// Profiling data for the batch; zero where an event carries none.
    /// Only meaningful after `read` has completed.
    pub(crate) fn timings(&self) -> StageTimings {
        let fill_ms = self
            .fill
            .as_ref()
            .and_then(event_elapsed_ms)
            .unwrap_or(0.0);
        StageTimings {
            upload_ms: event_elapsed_ms(&self.upload).unwrap_or(0.0) + fill_ms,
            pad_ms: event_elapsed_ms(&self.pad).unwrap_or(0.0),
            transform_ms: event_elapsed_ms(&self.transform).unwrap_or(0.0),
            reduce_ms: event_elapsed_ms(&self.reduce).unwrap_or(0.0),
            readback_ms: event_elapsed_ms(&self.read).unwrap_or(0.0),
        }
    }
}

/// One enqueued batch: its range, host staging for the readback, and the
/// stage events. The staging vector must outlive the read event.
pub(crate) struct BatchInFlight {
    pub range: BatchRange,
    pub staging: Vec<PeakRecord>,
    pub events: StageEvents,
}

/// Device resources for one execution stream.
pub(crate) struct StreamResource {
    queue_index: usize,
    capacity_rows: usize,
    samples_per_row: usize,
    fft_size: usize,
    reduce_wg: usize,
    kernels_key: u64,
    input: Arc<dyn DeviceBuffer<Complex32>>,
    scratch: Arc<dyn DeviceBuffer<Complex32>>,
    records: Arc<dyn DeviceBuffer<PeakRecord>>,
    pad_kernel: Kernel,
    transform_kernel: Kernel,
    reduce_kernel: Kernel,
    /// Readback event of the previous batch on this stream, if any.
    /// Raw handle only: the owning `Event` lives in the invocation's
    /// in-flight list, and the chain is cleared when the invocation ends.
    last_read: Option<cl_event>,
}

// SAFETY: the scheduler serializes all access to a stream behind its
// stream-list mutex; kernel argument binding therefore never races. The
// OpenCL handles themselves are thread-safe per OpenCL 1.2+.
unsafe impl Send for StreamResource {}

/// Content key covering all three kernel sources and the shared options,
/// used to detect when a stream's compiled state is stale.
fn kernels_fingerprint(kernels: &PipelineKernels, fft_size: usize) -> u64 {
    let combined = format!(
        "{}\u{0}{}\u{0}{}\u{0}{}\u{0}{}\u{0}{}\u{0}{}",
        kernels.pad_source,
        kernels.pad_entry,
        kernels.transform_source,
        kernels.transform_entry,
        kernels.reduce_source,
        kernels.reduce_entry,
        kernels.build_options,
    );
    source_key(&combined, &fft_size.to_string())
}

impl StreamResource {
    /// Allocate buffers sized for `rows` and compile private kernel
    /// copies. Buffers use the Regular strategy explicitly: the stage
    /// chain relies on transfer events for dependency ordering, which
    /// shared-address copies do not provide.
    pub(crate) fn provision(
        ctx: &Arc<DeviceContext>,
        factory: &BufferFactory,
        cache: &ProgramCache,
        queue_index: usize,
        rows: usize,
        shape: WorkloadShape,
        kernels: &PipelineKernels,
    ) -> RclResult<Self> {
        let fft_size = shape.padded_fft_size();
        let input: Arc<dyn DeviceBuffer<Complex32>> = factory.create_with_strategy::<Complex32>(
            rows * shape.samples_per_row,
            AccessMode::ReadOnly,
            BufferStrategy::Regular,
        )?;
        let scratch: Arc<dyn DeviceBuffer<Complex32>> = factory.create_with_strategy::<Complex32>(
            rows * fft_size,
            AccessMode::ReadWrite,
            BufferStrategy::Regular,
        )?;
        let records: Arc<dyn DeviceBuffer<PeakRecord>> = factory
            .create_with_strategy::<PeakRecord>(rows, AccessMode::WriteOnly, BufferStrategy::Regular)?;

        let pad_program = cache.get_or_compile(&kernels.pad_source, &kernels.build_options)?;
        let pad_kernel = pad_program.create_kernel_copy(&kernels.pad_entry)?;

        // The transform plan is a specialization of the caller's source,
        // compiled for this stream's padded length and provisioned rows.
        let plan_options = format!("{} -DFFT_SIZE={fft_size}", kernels.build_options);
        let transform_program = cache.get_or_compile(&kernels.transform_source, &plan_options)?;
        let transform_kernel = transform_program.create_kernel_copy(&kernels.transform_entry)?;

        let reduce_program =
            cache.get_or_compile(&kernels.reduce_source, &kernels.build_options)?;
        let reduce_kernel = reduce_program.create_kernel_copy(&kernels.reduce_entry)?;

        let reduce_wg = ctx.info().max_work_group_size.min(256).max(1);
        log::debug!(
            "provisioned stream on queue {queue_index}: {rows} rows, fft {fft_size}, \
             reduce work-group {reduce_wg}"
        );

        Ok(Self {
            queue_index,
            capacity_rows: rows,
            samples_per_row: shape.samples_per_row,
            fft_size,
            reduce_wg,
            kernels_key: kernels_fingerprint(kernels, fft_size),
            input,
            scratch,
            records,
            pad_kernel,
            transform_kernel,
            reduce_kernel,
            last_read: None,
        })
    }

    /// Whether this stream can serve a plan of `rows`-row batches without
    /// reprovisioning. Capacity may exceed the request (reuse across
    /// invocations); it must never shrink mid-use.
    pub(crate) fn is_adequate(
        &self,
        rows: usize,
        shape: WorkloadShape,
        kernels: &PipelineKernels,
    ) -> bool {
        self.capacity_rows >= rows
            && self.samples_per_row == shape.samples_per_row
            && self.fft_size == shape.padded_fft_size()
            && self.kernels_key == kernels_fingerprint(kernels, self.fft_size)
    }

    pub(crate) fn queue_index(&self) -> usize {
        self.queue_index
    }

    /// Forget the previous batch's readback handle. Called when an
    /// invocation ends; the handle's owner is dropped with it.
    pub(crate) fn clear_chain(&mut self) {
        self.last_read = None;
    }

    /// Enqueue one batch's upload → pad → transform → reduce → readback
    /// chain and return without waiting.
    ///
    /// Stage dependencies are event waits only. The first command
    /// additionally waits on this stream's previous batch readback (the
    /// buffers are reused, so overwriting them early would race); events
    /// from other streams are never waited on here.
    pub(crate) fn enqueue_batch(
        &mut self,
        queue: &CommandQueue,
        range: BatchRange,
        rows: &[Complex32],
    ) -> RclResult<BatchInFlight> {
        let count = range.count;
        debug_assert!(count <= self.capacity_rows);
        debug_assert_eq!(rows.len(), count * self.samples_per_row);

        let chain: Vec<cl_event> = self.last_read.into_iter().collect();

        let upload = self.input.write_async(queue, rows, &chain)?;
        // A batch smaller than the provisioned size leaves stale rows in
        // scratch, and the transform plan always runs at provisioned size.
        let fill = if count < self.capacity_rows {
            Some(self.scratch.fill_zero(queue, &chain)?)
        } else {
            None
        };

        let samples = as_cl_uint(self.samples_per_row);
        let fft = as_cl_uint(self.fft_size);
        let batch_rows = as_cl_uint(count);

        let pad = unsafe {
            let mut ek = ExecuteKernel::new(&self.pad_kernel);
            self.input.bind_arg(&mut ek);
            self.scratch.bind_arg(&mut ek);
            ek.set_arg(&samples)
                .set_arg(&fft)
                .set_arg(&batch_rows)
                .set_global_work_size(count * self.fft_size)
                .set_wait_event(&upload);
            if let Some(f) = &fill {
                ek.set_wait_event(f);
            }
            ek.enqueue_nd_range(queue)
                .map_err(|e| api_error("clEnqueueNDRangeKernel(pad)", e))?
        };

        let provisioned_rows = as_cl_uint(self.capacity_rows);
        let transform = unsafe {
            let mut ek = ExecuteKernel::new(&self.transform_kernel);
            self.scratch.bind_arg(&mut ek);
            ek.set_arg(&provisioned_rows)
                .set_global_work_size(self.capacity_rows * self.fft_size)
                .set_wait_event(&pad);
            ek.enqueue_nd_range(queue)
                .map_err(|e| api_error("clEnqueueNDRangeKernel(transform)", e))?
        };

        let reduce = unsafe {
            let mut ek = ExecuteKernel::new(&self.reduce_kernel);
            self.scratch.bind_arg(&mut ek);
            self.records.bind_arg(&mut ek);
            ek.set_arg(&fft)
                .set_global_work_size(count * self.reduce_wg)
                .set_local_work_size(self.reduce_wg)
                .set_wait_event(&transform);
            ek.enqueue_nd_range(queue)
                .map_err(|e| api_error("clEnqueueNDRangeKernel(reduce)", e))?
        };

        let mut staging = vec![PeakRecord::default(); count];
        let read = self
            .records
            .read_async(queue, &mut staging, &[reduce.get()])?;
        self.last_read = Some(read.get());

        Ok(BatchInFlight {
            range,
            staging,
            events: StageEvents {
                upload,
                fill,
                pad,
                transform,
                reduce,
                read,
            },
        })
    }
}
