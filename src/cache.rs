//! Content-hash-keyed caches for compiled programs and kernels.
//!
//! Compilation is expensive, so it always happens outside the cache lock:
//! two callers racing to compile the same uncached source both succeed and
//! the last insert wins — both artifacts are valid, and the lock only ever
//! guards map mutation. Cached artifacts are immutable after insertion and
//! are only removed wholesale via [`ProgramCache::clear`].
//!
//! Kernel handles carry bound arguments as mutable state, so the shared
//! handles returned by [`CachedProgram::kernel`] must not be dispatched
//! from concurrently-enqueueing call sites; those use
//! [`CachedProgram::create_kernel_copy`] to get private handles instead.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use opencl3::kernel::Kernel;
use opencl3::program::Program;

use crate::device::DeviceContext;
use crate::{RclError, RclResult};

/// 64-bit content key over kernel source text and build options.
///
/// Build options participate because `-D` defines produce distinct
/// artifacts from identical source.
pub fn source_key(source: &str, options: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    options.hash(&mut hasher);
    hasher.finish()
}

/// A compiled program plus its per-name kernel cache.
#[derive(Debug)]
pub struct CachedProgram {
    program: Program,
    key: u64,
    kernels: Mutex<HashMap<String, Arc<Kernel>>>,
}

// SAFETY: OpenCL 1.2+ guarantees thread safety for program and kernel
// objects themselves; the kernel map is mutex-guarded. Argument binding on
// a shared kernel handle is NOT safe under concurrency — see the module
// docs — which is an enqueue-discipline contract, not a memory-safety one.
unsafe impl Send for CachedProgram {}
unsafe impl Sync for CachedProgram {}

impl CachedProgram {
    /// The content key this program was cached under.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// The underlying compiled program.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Get or create the shared kernel handle for `name`.
    ///
    /// Creation failure (unknown entry point) is a fatal
    /// [`RclError::KernelNotFound`] and is not cached.
    pub fn kernel(&self, name: &str) -> RclResult<Arc<Kernel>> {
        if let Some(k) = self.kernels.lock().unwrap().get(name) {
            return Ok(Arc::clone(k));
        }
        // Create outside the lock; a racing duplicate is benign.
        let kernel = self.create_kernel_copy(name)?;
        let kernel = Arc::new(kernel);
        self.kernels
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&kernel));
        Ok(kernel)
    }

    /// Create a fresh, uncached kernel handle for `name`.
    ///
    /// Used by the scheduler's parallel mode, where each stream needs its
    /// own handle so argument bindings never race across streams.
    pub fn create_kernel_copy(&self, name: &str) -> RclResult<Kernel> {
        Kernel::create(&self.program, name).map_err(|e| RclError::KernelNotFound {
            name: name.to_string(),
            code: e.0,
        })
    }
}

/// Hit/miss counters for diagnostics.
#[derive(Debug, Clone)]
pub struct CacheStatistics {
    /// Number of compiled programs currently cached.
    pub programs: usize,
    /// Lookups satisfied from the cache.
    pub hits: u64,
    /// Lookups that triggered a compilation.
    pub misses: u64,
}

impl std::fmt::Display for CacheStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "program cache: {} programs, {} hits, {} misses",
            self.programs, self.hits, self.misses
        )
    }
}

/// Cache of compiled programs keyed by source-content hash.
pub struct ProgramCache {
    ctx: Arc<DeviceContext>,
    programs: Mutex<HashMap<u64, Arc<CachedProgram>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ProgramCache {
    pub fn new(ctx: &Arc<DeviceContext>) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            programs: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up `source` by content hash, compiling on miss.
    ///
    /// Compilation happens outside the lock. On build failure the partial
    /// program handle is dropped and [`RclError::CompilationFailed`] carries
    /// the platform's build log; nothing is cached.
    pub fn get_or_compile(
        &self,
        source: &str,
        options: &str,
    ) -> RclResult<Arc<CachedProgram>> {
        let key = source_key(source, options);
        if let Some(p) = self.programs.lock().unwrap().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(p));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        log::debug!("program cache miss for key {key:#018x}, compiling");

        let program = Program::create_and_build_from_source(self.ctx.context(), source, options)
            .map_err(|e| RclError::CompilationFailed {
                build_log: e.to_string(),
            })?;

        let cached = Arc::new(CachedProgram {
            program,
            key,
            kernels: Mutex::new(HashMap::new()),
        });
        // Last writer wins if two callers compiled the same source
        // concurrently; both artifacts are valid.
        self.programs
            .lock()
            .unwrap()
            .insert(key, Arc::clone(&cached));
        Ok(cached)
    }

    /// Current hit/miss counters and entry count.
    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            programs: self.programs.lock().unwrap().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Drop every cached program and kernel.
    ///
    /// Outstanding `Arc<CachedProgram>` handles stay valid; the entries are
    /// simply no longer reachable through the cache.
    pub fn clear(&self) {
        self.programs.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;

    fn test_context() -> Option<Arc<DeviceContext>> {
        DeviceContext::new(DeviceKind::Gpu)
            .or_else(|_| DeviceContext::new(DeviceKind::Cpu))
            .ok()
            .map(Arc::new)
    }

    const TRIVIAL_KERNEL: &str = r#"
        __kernel void touch(__global float* data) {
            size_t i = get_global_id(0);
            data[i] = data[i];
        }
    "#;

    #[test]
    fn test_source_key_stability_and_separation() {
        assert_eq!(source_key("a", ""), source_key("a", ""));
        assert_ne!(source_key("a", ""), source_key("b", ""));
        // Same source, different defines => different artifacts.
        assert_ne!(source_key("a", "-DN=1"), source_key("a", "-DN=2"));
    }

    #[test]
    fn test_second_compile_is_a_hit() {
        let Some(ctx) = test_context() else { return };
        let cache = ProgramCache::new(&ctx);

        let first = cache.get_or_compile(TRIVIAL_KERNEL, "").expect("compile");
        let second = cache.get_or_compile(TRIVIAL_KERNEL, "").expect("lookup");
        assert!(Arc::ptr_eq(&first, &second));

        let stats = cache.statistics();
        assert_eq!(stats.programs, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_distinct_sources_do_not_share_entries() {
        let Some(ctx) = test_context() else { return };
        let cache = ProgramCache::new(&ctx);

        let a = cache.get_or_compile(TRIVIAL_KERNEL, "").expect("compile a");
        let other = TRIVIAL_KERNEL.replace("touch", "touch2");
        let b = cache.get_or_compile(&other, "").expect("compile b");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.statistics().programs, 2);
    }

    #[test]
    fn test_compile_failure_carries_build_log_and_caches_nothing() {
        let Some(ctx) = test_context() else { return };
        let cache = ProgramCache::new(&ctx);

        let bad = "__kernel void broken(__global floatt* x) { x[0] = ; }";
        match cache.get_or_compile(bad, "") {
            Err(RclError::CompilationFailed { build_log }) => {
                assert!(!build_log.is_empty());
            }
            other => panic!("expected CompilationFailed, got {other:?}"),
        }
        assert_eq!(cache.statistics().programs, 0);
    }

    #[test]
    fn test_kernel_lookup_and_unknown_name() {
        let Some(ctx) = test_context() else { return };
        let cache = ProgramCache::new(&ctx);
        let program = cache.get_or_compile(TRIVIAL_KERNEL, "").expect("compile");

        let k1 = program.kernel("touch").expect("kernel");
        let k2 = program.kernel("touch").expect("kernel again");
        assert!(Arc::ptr_eq(&k1, &k2));

        match program.kernel("no_such_entry") {
            Err(RclError::KernelNotFound { name, .. }) => {
                assert_eq!(name, "no_such_entry");
            }
            other => panic!("expected KernelNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_kernel_copies_are_distinct_handles() {
        let Some(ctx) = test_context() else { return };
        let cache = ProgramCache::new(&ctx);
        let program = cache.get_or_compile(TRIVIAL_KERNEL, "").expect("compile");

        let shared = program.kernel("touch").expect("shared");
        let copy = program.create_kernel_copy("touch").expect("copy");
        // A copy is a new handle, not the shared Arc.
        assert_ne!(shared.get(), copy.get());
    }

    #[test]
    fn test_clear_empties_cache() {
        let Some(ctx) = test_context() else { return };
        let cache = ProgramCache::new(&ctx);
        let keep = cache.get_or_compile(TRIVIAL_KERNEL, "").expect("compile");
        cache.clear();
        assert_eq!(cache.statistics().programs, 0);
        // Outstanding handles stay usable.
        assert!(keep.kernel("touch").is_ok());
    }
}
