//! Shared-address (SVM) buffers: one allocation addressable from both
//! host and device.
//!
//! On coarse-grained devices every host access is bracketed by
//! map/unmap coherence fences; fine-grained devices need no fences and
//! host copies are plain `memcpy`.

use std::marker::PhantomData;
use std::sync::Arc;

use opencl3::command_queue::CommandQueue;
use opencl3::event::Event;
use opencl3::kernel::ExecuteKernel;
use opencl3::memory::{svm_alloc, svm_free, CL_MAP_READ, CL_MAP_WRITE, CL_MEM_SVM_FINE_GRAIN_BUFFER};
use opencl3::types::{cl_event, CL_BLOCKING};

use crate::buffer::{check_transfer, AccessMode, BufferStrategy, DeviceBuffer};
use crate::device::DeviceContext;
use crate::{api_error, RclError, RclResult};

/// Shared-address buffer backed by an SVM allocation.
pub struct SharedBuffer<T> {
    ptr: *mut T,
    len: usize,
    mode: AccessMode,
    fine_grained: bool,
    ctx: Arc<DeviceContext>,
    _marker: PhantomData<T>,
}

// SAFETY: the SVM pointer is owned by this value and freed exactly once in
// Drop; the OpenCL runtime serializes access to the allocation itself.
// Concurrent host writes to overlapping element ranges are a caller data
// race exactly as they would be for a plain slice.
unsafe impl<T: Send> Send for SharedBuffer<T> {}
unsafe impl<T: Send> Sync for SharedBuffer<T> {}

impl<T> SharedBuffer<T> {
    pub(crate) fn create(
        ctx: &Arc<DeviceContext>,
        len: usize,
        mode: AccessMode,
        fine_grained: bool,
    ) -> RclResult<Self> {
        let bytes = len * std::mem::size_of::<T>();
        let mut flags = mode.mem_flags();
        if fine_grained {
            flags |= CL_MEM_SVM_FINE_GRAIN_BUFFER;
        }
        let ptr = unsafe { svm_alloc(ctx.raw_context(), flags, bytes, 0) }.map_err(|e| {
            RclError::Allocation {
                op: "clSVMAlloc",
                bytes,
                code: e.into(),
            }
        })?;
        if ptr.is_null() {
            return Err(RclError::Allocation {
                op: "clSVMAlloc",
                bytes,
                code: 0,
            });
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
            mode,
            fine_grained,
            ctx: Arc::clone(ctx),
            _marker: PhantomData,
        })
    }

    /// Whether this allocation is fully coherent (no map/unmap fences).
    pub fn is_fine_grained(&self) -> bool {
        self.fine_grained
    }

    /// The whole allocation as a host slice. Only coherent outside a
    /// map/unmap bracket on fine-grained devices.
    unsafe fn region(&self) -> &mut [T] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

impl<T> Drop for SharedBuffer<T> {
    fn drop(&mut self) {
        unsafe { svm_free(self.ctx.raw_context(), self.ptr.cast()) };
    }
}

impl<T: Copy + Default + Send + Sync> DeviceBuffer<T> for SharedBuffer<T> {
    fn len(&self) -> usize {
        self.len
    }

    fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    fn mode(&self) -> AccessMode {
        self.mode
    }

    fn strategy(&self) -> BufferStrategy {
        if self.fine_grained {
            BufferStrategy::SharedFine
        } else {
            BufferStrategy::SharedCoarse
        }
    }

    fn write(&self, queue: &CommandQueue, data: &[T]) -> RclResult<()> {
        let event = self.write_async(queue, data, &[])?;
        event.wait().map_err(|e| api_error("clWaitForEvents", e))?;
        Ok(())
    }

    fn read(&self, queue: &CommandQueue) -> RclResult<Vec<T>> {
        let mut out = vec![T::default(); self.len];
        let event = self.read_async(queue, &mut out, &[])?;
        event.wait().map_err(|e| api_error("clWaitForEvents", e))?;
        Ok(out)
    }

    fn write_async(
        &self,
        queue: &CommandQueue,
        data: &[T],
        wait: &[cl_event],
    ) -> RclResult<Event> {
        check_transfer("write", self, data.len())?;
        unsafe {
            if !self.fine_grained {
                queue
                    .enqueue_svm_map(CL_BLOCKING, CL_MAP_WRITE, self.region(), wait)
                    .map_err(|e| api_error("clEnqueueSVMMap", e))?;
            }
            // The copy happens host-side immediately; on fine-grained
            // devices the returned event is a marker honoring `wait`, on
            // coarse-grained it is the unmap fence.
            self.region()[..data.len()].copy_from_slice(data);
            if self.fine_grained {
                queue
                    .enqueue_marker_with_wait_list(wait)
                    .map_err(|e| api_error("clEnqueueMarkerWithWaitList", e))
            } else {
                queue
                    .enqueue_svm_unmap(self.region(), &[])
                    .map_err(|e| api_error("clEnqueueSVMUnmap", e))
            }
        }
    }

    fn read_async(
        &self,
        queue: &CommandQueue,
        out: &mut [T],
        wait: &[cl_event],
    ) -> RclResult<Event> {
        check_transfer("read", self, out.len())?;
        unsafe {
            if !self.fine_grained {
                queue
                    .enqueue_svm_map(CL_BLOCKING, CL_MAP_READ, self.region(), wait)
                    .map_err(|e| api_error("clEnqueueSVMMap", e))?;
            }
            out.copy_from_slice(&self.region()[..out.len()]);
            if self.fine_grained {
                queue
                    .enqueue_marker_with_wait_list(wait)
                    .map_err(|e| api_error("clEnqueueMarkerWithWaitList", e))
            } else {
                queue
                    .enqueue_svm_unmap(self.region(), &[])
                    .map_err(|e| api_error("clEnqueueSVMUnmap", e))
            }
        }
    }

    fn fill_zero(&self, queue: &CommandQueue, wait: &[cl_event]) -> RclResult<Event> {
        unsafe {
            if !self.fine_grained {
                queue
                    .enqueue_svm_map(CL_BLOCKING, CL_MAP_WRITE, self.region(), wait)
                    .map_err(|e| api_error("clEnqueueSVMMap", e))?;
            }
            for v in self.region().iter_mut() {
                *v = T::default();
            }
            if self.fine_grained {
                queue
                    .enqueue_marker_with_wait_list(wait)
                    .map_err(|e| api_error("clEnqueueMarkerWithWaitList", e))
            } else {
                queue
                    .enqueue_svm_unmap(self.region(), &[])
                    .map_err(|e| api_error("clEnqueueSVMUnmap", e))
            }
        }
    }

    fn bind_arg(&self, kernel: &mut ExecuteKernel) {
        unsafe {
            kernel.set_arg_svm(self.ptr.cast::<std::ffi::c_void>());
        }
    }
}
