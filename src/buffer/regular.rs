//! Regular-strategy buffers: distinct host/device memory with explicit
//! transfer commands.

use std::marker::PhantomData;
use std::ptr;
use std::sync::{Arc, Mutex};

use opencl3::command_queue::CommandQueue;
use opencl3::event::Event;
use opencl3::kernel::ExecuteKernel;
use opencl3::memory::{Buffer, ClMem};
use opencl3::types::{cl_event, cl_mem, cl_uint, CL_BLOCKING, CL_NON_BLOCKING};

use crate::buffer::{check_transfer, AccessMode, BufferStrategy, DeviceBuffer};
use crate::device::DeviceContext;
use crate::{api_error, RclError, RclResult};

/// Owning buffer in distinct device memory.
///
/// The wrapped `opencl3` buffer sits behind a mutex because write enqueues
/// need a mutable handle; the lock covers only the enqueue call, and the
/// raw handle used for kernel-argument binding is cached outside it.
pub struct RegularBuffer<T> {
    mem: Mutex<Buffer<T>>,
    raw: cl_mem,
    len: usize,
    mode: AccessMode,
    _ctx: Arc<DeviceContext>,
}

// SAFETY: OpenCL 1.2+ guarantees thread safety for memory objects; the
// opencl3 handle is an opaque pointer into the runtime, which serializes
// access internally. Host-side mutation of the handle goes through the
// mutex.
unsafe impl<T: Send> Send for RegularBuffer<T> {}
unsafe impl<T: Send> Sync for RegularBuffer<T> {}

impl<T> RegularBuffer<T> {
    pub(crate) fn create(
        ctx: &Arc<DeviceContext>,
        len: usize,
        mode: AccessMode,
    ) -> RclResult<Self> {
        let bytes = len * std::mem::size_of::<T>();
        let buffer =
            unsafe { Buffer::<T>::create(ctx.context(), mode.mem_flags(), len, ptr::null_mut()) }
                .map_err(|e| RclError::Allocation {
                    op: "clCreateBuffer",
                    bytes,
                    code: e.0,
                })?;
        let raw = buffer.get();
        Ok(Self {
            mem: Mutex::new(buffer),
            raw,
            len,
            mode,
            _ctx: Arc::clone(ctx),
        })
    }
}

impl<T: Copy + Default + Send + Sync> DeviceBuffer<T> for RegularBuffer<T> {
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
        BufferStrategy::Regular
    }

    fn write(&self, queue: &CommandQueue, data: &[T]) -> RclResult<()> {
        let event = self.write_async(queue, data, &[])?;
        event.wait().map_err(|e| api_error("clWaitForEvents", e))?;
        Ok(())
    }

    fn read(&self, queue: &CommandQueue) -> RclResult<Vec<T>> {
        let mut out = vec![T::default(); self.len];
        let mem = self.mem.lock().unwrap();
        let event = unsafe {
            queue
                .enqueue_read_buffer(&mem, CL_BLOCKING, 0, &mut out, &[])
                .map_err(|e| api_error("clEnqueueReadBuffer", e))?
        };
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
        let mut mem = self.mem.lock().unwrap();
        let event = unsafe {
            queue
                .enqueue_write_buffer(&mut mem, CL_NON_BLOCKING, 0, data, wait)
                .map_err(|e| api_error("clEnqueueWriteBuffer", e))?
        };
        Ok(event)
    }

    fn read_async(
        &self,
        queue: &CommandQueue,
        out: &mut [T],
        wait: &[cl_event],
    ) -> RclResult<Event> {
        check_transfer("read", self, out.len())?;
        let mem = self.mem.lock().unwrap();
        let event = unsafe {
            queue
                .enqueue_read_buffer(&mem, CL_NON_BLOCKING, 0, out, wait)
                .map_err(|e| api_error("clEnqueueReadBuffer", e))?
        };
        Ok(event)
    }

    fn fill_zero(&self, queue: &CommandQueue, wait: &[cl_event]) -> RclResult<Event> {
        let pattern = [T::default()];
        let mut mem = self.mem.lock().unwrap();
        let event = unsafe {
            queue
                .enqueue_fill_buffer(&mut mem, &pattern, 0, self.size_bytes(), wait)
                .map_err(|e| api_error("clEnqueueFillBuffer", e))?
        };
        Ok(event)
    }

    fn bind_arg(&self, kernel: &mut ExecuteKernel) {
        unsafe {
            kernel.set_arg(&self.raw);
        }
    }
}

/// Non-owning Regular-strategy view over a caller-owned allocation.
///
/// Never retains or releases the handle: dropping the wrapper leaves the
/// external allocation untouched. Constructed through
/// [`BufferFactory::wrap_external`](crate::buffer::BufferFactory::wrap_external),
/// which validates that the allocation belongs to the factory's context
/// before a wrapper can exist.
pub struct ExternalBuffer<T> {
    raw: cl_mem,
    len: usize,
    mode: AccessMode,
    _marker: PhantomData<T>,
}

// SAFETY: same runtime thread-safety argument as RegularBuffer; this type
// holds a borrowed opaque handle and no host-side mutable state.
unsafe impl<T: Send> Send for ExternalBuffer<T> {}
unsafe impl<T: Send> Sync for ExternalBuffer<T> {}

impl<T> ExternalBuffer<T> {
    pub(crate) fn wrap(raw: cl_mem, len: usize, mode: AccessMode) -> Self {
        Self {
            raw,
            len,
            mode,
            _marker: PhantomData,
        }
    }

    fn wait_ptr(wait: &[cl_event]) -> *const cl_event {
        if wait.is_empty() {
            ptr::null()
        } else {
            wait.as_ptr()
        }
    }
}

impl<T: Copy + Default + Send + Sync> DeviceBuffer<T> for ExternalBuffer<T> {
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
        BufferStrategy::Regular
    }

    fn write(&self, queue: &CommandQueue, data: &[T]) -> RclResult<()> {
        check_transfer("write", self, data.len())?;
        // The handle is borrowed, so transfers go through the raw entry
        // points rather than the owning opencl3 wrapper.
        let raw_event = unsafe {
            opencl3::command_queue::enqueue_write_buffer(
                queue.get(),
                self.raw,
                CL_BLOCKING,
                0,
                std::mem::size_of_val(data),
                data.as_ptr().cast(),
                wait_len(&[]),
                Self::wait_ptr(&[]),
            )
        }
        .map_err(|e| RclError::Api {
            op: "clEnqueueWriteBuffer",
            code: e.into(),
        })?;
        Event::new(raw_event)
            .wait()
            .map_err(|e| api_error("clWaitForEvents", e))
    }

    fn read(&self, queue: &CommandQueue) -> RclResult<Vec<T>> {
        let mut out = vec![T::default(); self.len];
        let raw_event = unsafe {
            opencl3::command_queue::enqueue_read_buffer(
                queue.get(),
                self.raw,
                CL_BLOCKING,
                0,
                std::mem::size_of_val(out.as_slice()),
                out.as_mut_ptr().cast(),
                wait_len(&[]),
                Self::wait_ptr(&[]),
            )
        }
        .map_err(|e| RclError::Api {
            op: "clEnqueueReadBuffer",
            code: e.into(),
        })?;
        Event::new(raw_event)
            .wait()
            .map_err(|e| api_error("clWaitForEvents", e))?;
        Ok(out)
    }

    fn write_async(
        &self,
        queue: &CommandQueue,
        data: &[T],
        wait: &[cl_event],
    ) -> RclResult<Event> {
        check_transfer("write", self, data.len())?;
        let raw_event = unsafe {
            opencl3::command_queue::enqueue_write_buffer(
                queue.get(),
                self.raw,
                CL_NON_BLOCKING,
                0,
                std::mem::size_of_val(data),
                data.as_ptr().cast(),
                wait_len(wait),
                Self::wait_ptr(wait),
            )
        }
        .map_err(|e| RclError::Api {
            op: "clEnqueueWriteBuffer",
            code: e.into(),
        })?;
        Ok(Event::new(raw_event))
    }

    fn read_async(
        &self,
        queue: &CommandQueue,
        out: &mut [T],
        wait: &[cl_event],
    ) -> RclResult<Event> {
        check_transfer("read", self, out.len())?;
        let raw_event = unsafe {
            opencl3::command_queue::enqueue_read_buffer(
                queue.get(),
                self.raw,
                CL_NON_BLOCKING,
                0,
                std::mem::size_of_val(out),
                out.as_mut_ptr().cast(),
                wait_len(wait),
                Self::wait_ptr(wait),
            )
        }
        .map_err(|e| RclError::Api {
            op: "clEnqueueReadBuffer",
            code: e.into(),
        })?;
        Ok(Event::new(raw_event))
    }

    fn fill_zero(&self, queue: &CommandQueue, wait: &[cl_event]) -> RclResult<Event> {
        let pattern = [T::default()];
        let raw_event = unsafe {
            opencl3::command_queue::enqueue_fill_buffer(
                queue.get(),
                self.raw,
                pattern.as_ptr().cast(),
                std::mem::size_of::<T>(),
                0,
                self.len * std::mem::size_of::<T>(),
                wait_len(wait),
                Self::wait_ptr(wait),
            )
        }
        .map_err(|e| RclError::Api {
            op: "clEnqueueFillBuffer",
            code: e.into(),
        })?;
        Ok(Event::new(raw_event))
    }

    fn bind_arg(&self, kernel: &mut ExecuteKernel) {
        unsafe {
            kernel.set_arg(&self.raw);
        }
    }
}

fn wait_len(wait: &[cl_event]) -> cl_uint {
    wait.len() as cl_uint
}
