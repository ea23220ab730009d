use super::*;
use crate::buffer::BufferFactory;
use crate::cache::ProgramCache;
use crate::device::{DeviceContext, DeviceKind};
use crate::queue::QueuePool;

#[test]
fn test_peak_record_layout_is_pinned() {
    // 1 × u32 + 6 × f32, packed. Downstream report code depends on this.
    assert_eq!(std::mem::size_of::<PeakRecord>(), 28);
    assert_eq!(std::mem::align_of::<PeakRecord>(), 4);
}

#[test]
fn test_complex_sample_matches_device_pair() {
    assert_eq!(std::mem::size_of::<Complex32>(), 8);
    assert_eq!(std::mem::align_of::<Complex32>(), 4);
}

#[test]
fn test_padded_fft_size_rounds_up_and_doubles() {
    let shape = |samples| WorkloadShape {
        rows: 1,
        samples_per_row: samples,
    };
    assert_eq!(shape(64).padded_fft_size(), 128);
    assert_eq!(shape(100).padded_fft_size(), 256);
    assert_eq!(shape(1000).padded_fft_size(), 2048);
    assert_eq!(shape(1).padded_fft_size(), 2);
}

#[test]
fn test_memory_estimate_math() {
    let shape = WorkloadShape {
        rows: 10,
        samples_per_row: 1000,
    };
    let est = estimate_memory(shape);
    assert_eq!(est.fft_size, 2048);
    // input + working set + record, per row
    assert_eq!(est.bytes_per_row, 1000 * 8 + 2048 * 8 + 28);
    assert_eq!(est.total_bytes, 10 * est.bytes_per_row as u64);
}

#[test]
fn test_config_rejects_bad_fractions() {
    let bad = BatchConfig {
        batch_size_ratio: 0.0,
        ..BatchConfig::default()
    };
    assert!(matches!(
        bad.validated(),
        Err(RclError::InvalidConfig { .. })
    ));

    let bad = BatchConfig {
        memory_usage_limit: 1.0,
        ..BatchConfig::default()
    };
    assert!(matches!(
        bad.validated(),
        Err(RclError::InvalidConfig { .. })
    ));
}

#[test]
fn test_config_clamps_stream_count() {
    let cfg = BatchConfig {
        parallel_streams: 99,
        ..BatchConfig::default()
    }
    .validated()
    .expect("fractions are valid");
    assert_eq!(cfg.parallel_streams, MAX_PARALLEL_STREAMS);

    let cfg = BatchConfig {
        parallel_streams: 0,
        ..BatchConfig::default()
    }
    .validated()
    .expect("fractions are valid");
    assert_eq!(cfg.parallel_streams, 1);
}

#[test]
fn test_timings_sum_across_batches() {
    let a = StageTimings {
        upload_ms: 1.0,
        pad_ms: 2.0,
        transform_ms: 3.0,
        reduce_ms: 4.0,
        readback_ms: 5.0,
    };
    let b = StageTimings {
        upload_ms: 0.5,
        ..StageTimings::default()
    };
    let inv = InvocationTimings {
        per_batch: vec![a, b],
    };
    let total = inv.total();
    assert!((total.upload_ms - 1.5).abs() < 1e-12);
    assert!((total.total_ms() - 15.5).abs() < 1e-12);
}

// End-to-end tests against a real device, with stand-in stage kernels.
// The stand-ins keep the scheduler's launch geometry and event wiring
// honest without bringing radar math into the crate: pad copies and
// zero-extends, transform is a pass-through sized by -DFFT_SIZE, reduce
// finds each row's strongest bin.

const PAD_SOURCE: &str = r#"
    typedef struct { float re; float im; } cfloat;

    __kernel void pad_rows(__global const cfloat* input,
                           __global cfloat* scratch,
                           uint samples_per_row, uint fft_size, uint rows) {
        size_t gid = get_global_id(0);
        size_t row = gid / fft_size;
        size_t pos = gid % fft_size;
        if (row >= rows) {
            return;
        }
        cfloat v = {0.0f, 0.0f};
        if (pos < samples_per_row) {
            v = input[row * samples_per_row + pos];
        }
        scratch[row * fft_size + pos] = v;
    }
"#;

const TRANSFORM_SOURCE: &str = r#"
    typedef struct { float re; float im; } cfloat;

    __kernel void transform_rows(__global cfloat* scratch, uint rows) {
        size_t gid = get_global_id(0);
        if (gid >= (size_t)rows * FFT_SIZE) {
            return;
        }
        cfloat v = scratch[gid];
        scratch[gid] = v;
    }
"#;

const REDUCE_SOURCE: &str = r#"
    typedef struct { float re; float im; } cfloat;
    typedef struct {
        uint peak_index;
        float re; float im;
        float magnitude; float phase_deg;
        float freq_offset; float refined_freq;
    } peak_record;

    __kernel void find_peaks(__global const cfloat* scratch,
                             __global peak_record* records,
                             uint fft_size) {
        size_t row = get_group_id(0);
        size_t lid = get_local_id(0);
        size_t lsz = get_local_size(0);
        __local float best_mag[256];
        __local uint best_idx[256];

        float bm = -1.0f;
        uint bi = 0;
        for (size_t i = lid; i < fft_size; i += lsz) {
            cfloat v = scratch[row * fft_size + i];
            float m = v.re * v.re + v.im * v.im;
            if (m > bm) {
                bm = m;
                bi = (uint)i;
            }
        }
        best_mag[lid] = bm;
        best_idx[lid] = bi;
        barrier(CLK_LOCAL_MEM_FENCE);

        if (lid == 0) {
            float m = -1.0f;
            uint idx = 0;
            for (size_t i = 0; i < lsz; i++) {
                if (best_mag[i] > m) {
                    m = best_mag[i];
                    idx = best_idx[i];
                }
            }
            cfloat v = scratch[row * fft_size + idx];
            peak_record r;
            r.peak_index = idx;
            r.re = v.re;
            r.im = v.im;
            r.magnitude = sqrt(m);
            r.phase_deg = atan2(v.im, v.re) * 57.295779513f;
            r.freq_offset = 0.0f;
            r.refined_freq = (float)idx;
            records[row] = r;
        }
    }
"#;

fn stand_in_kernels() -> PipelineKernels {
    PipelineKernels {
        pad_source: PAD_SOURCE.to_string(),
        pad_entry: "pad_rows".to_string(),
        transform_source: TRANSFORM_SOURCE.to_string(),
        transform_entry: "transform_rows".to_string(),
        reduce_source: REDUCE_SOURCE.to_string(),
        reduce_entry: "find_peaks".to_string(),
        build_options: String::new(),
    }
}

struct TestStack {
    ctx: Arc<DeviceContext>,
    pool: Arc<QueuePool>,
    cache: Arc<ProgramCache>,
    factory: Arc<BufferFactory>,
}

fn test_stack() -> Option<TestStack> {
    let ctx = DeviceContext::new(DeviceKind::Gpu)
        .or_else(|_| DeviceContext::new(DeviceKind::Cpu))
        .ok()
        .map(Arc::new)?;
    let pool = Arc::new(QueuePool::new(&ctx, 2).ok()?);
    let cache = Arc::new(ProgramCache::new(&ctx));
    let factory = Arc::new(BufferFactory::new(&ctx));
    Some(TestStack {
        ctx,
        pool,
        cache,
        factory,
    })
}

fn scheduler(stack: &TestStack, config: BatchConfig) -> BatchScheduler {
    BatchScheduler::new(
        &stack.ctx,
        &stack.pool,
        &stack.cache,
        &stack.factory,
        config,
    )
    .expect("scheduler construction")
}

/// Rows of zeros with one spike per row; the peak index and magnitude are
/// then known exactly.
fn spiked_input(shape: WorkloadShape) -> Vec<Complex32> {
    let mut input = vec![Complex32::default(); shape.input_len()];
    for row in 0..shape.rows {
        let pos = (row * 3) % shape.samples_per_row;
        input[row * shape.samples_per_row + pos] = Complex32::new((row + 1) as f32, 0.0);
    }
    input
}

fn assert_spikes_found(records: &[PeakRecord], shape: WorkloadShape) {
    assert_eq!(records.len(), shape.rows);
    for (row, record) in records.iter().enumerate() {
        let expected = ((row * 3) % shape.samples_per_row) as u32;
        assert_eq!(
            record.peak_index, expected,
            "row {row}: expected peak at {expected}, got {}",
            record.peak_index
        );
        let amp = (row + 1) as f32;
        assert!(
            (record.magnitude - amp).abs() < 1e-3,
            "row {row}: magnitude {} vs {amp}",
            record.magnitude
        );
        assert!((record.refined_freq - expected as f32).abs() < 1e-3);
    }
}

#[test]
fn test_single_pass_end_to_end() {
    let Some(stack) = test_stack() else { return };
    let sched = scheduler(&stack, BatchConfig::default());

    let shape = WorkloadShape {
        rows: 4,
        samples_per_row: 32,
    };
    let input = spiked_input(shape);
    let outcome = sched
        .run(&input, shape, &stand_in_kernels())
        .expect("single-pass run");

    assert_eq!(outcome.mode, RunMode::SinglePass);
    assert_eq!(outcome.plan.num_batches(), 1);
    assert_eq!(outcome.assignments, vec![0]);
    assert_spikes_found(&outcome.records, shape);
    assert_eq!(outcome.timings.per_batch.len(), 1);
}

#[test]
fn test_parallel_streams_round_robin_and_scatter() {
    let Some(stack) = test_stack() else { return };
    if stack.ctx.global_mem_size() == 0 {
        // Device does not report memory; budget math is meaningless.
        return;
    }

    let shape = WorkloadShape {
        rows: 16,
        samples_per_row: 64,
    };
    let est = estimate_memory(shape);
    // Budget below the single-pass footprint but wide enough for two
    // stream provisioning sets: forces 4 batches across 2 streams.
    let per_stream = 4 * est.bytes_per_row; // 4-row batches at ratio 0.25
    let budget = (3 * per_stream) as f64;
    let config = BatchConfig {
        batch_size_ratio: 0.25,
        memory_usage_limit: budget / stack.ctx.global_mem_size() as f64,
        parallel_streams: 2,
    };
    let sched = scheduler(&stack, config);

    let input = spiked_input(shape);
    let outcome = sched
        .run(&input, shape, &stand_in_kernels())
        .expect("parallel run");

    assert_eq!(outcome.mode, RunMode::ParallelMultiBatch { streams: 2 });
    assert_eq!(outcome.plan.num_batches(), 4);
    // Batches 0 and 2 on stream 0, batches 1 and 3 on stream 1.
    assert_eq!(outcome.assignments, vec![0, 1, 0, 1]);
    assert_spikes_found(&outcome.records, shape);
    assert_eq!(outcome.timings.per_batch.len(), 4);
}

#[test]
fn test_consecutive_invocations_reuse_compiled_programs() {
    let Some(stack) = test_stack() else { return };
    let sched = scheduler(&stack, BatchConfig::default());

    let shape = WorkloadShape {
        rows: 4,
        samples_per_row: 32,
    };
    let input = spiked_input(shape);
    let kernels = stand_in_kernels();

    sched.run(&input, shape, &kernels).expect("first run");
    let misses_after_first = stack.cache.statistics().misses;
    let outcome = sched.run(&input, shape, &kernels).expect("second run");

    assert_spikes_found(&outcome.records, shape);
    // Streams and programs are reused: no new compilations.
    assert_eq!(stack.cache.statistics().misses, misses_after_first);
}

#[test]
fn test_unknown_entry_point_aborts_with_no_results() {
    let Some(stack) = test_stack() else { return };
    let sched = scheduler(&stack, BatchConfig::default());

    let shape = WorkloadShape {
        rows: 4,
        samples_per_row: 32,
    };
    let input = spiked_input(shape);
    let mut kernels = stand_in_kernels();
    kernels.reduce_entry = "no_such_kernel".to_string();

    match sched.run(&input, shape, &kernels) {
        Err(RclError::KernelNotFound { name, .. }) => {
            assert_eq!(name, "no_such_kernel");
        }
        other => panic!("expected KernelNotFound, got {other:?}"),
    }
}

#[test]
fn test_input_length_mismatch_is_usage_error() {
    let Some(stack) = test_stack() else { return };
    let sched = scheduler(&stack, BatchConfig::default());

    let shape = WorkloadShape {
        rows: 4,
        samples_per_row: 32,
    };
    let short_input = vec![Complex32::default(); 7];
    match sched.run(&short_input, shape, &stand_in_kernels()) {
        Err(RclError::SizeMismatch { op: "run", .. }) => {}
        other => panic!("expected SizeMismatch, got {other:?}"),
    }
}

#[test]
fn test_empty_workload_returns_empty_outcome() {
    let Some(stack) = test_stack() else { return };
    let sched = scheduler(&stack, BatchConfig::default());

    let shape = WorkloadShape {
        rows: 0,
        samples_per_row: 64,
    };
    let outcome = sched
        .run(&[], shape, &stand_in_kernels())
        .expect("empty run");
    assert!(outcome.records.is_empty());
    assert_eq!(outcome.mode, RunMode::SinglePass);
}
