pub mod sim;

use crate::error::UsmResult;

/// Opaque handle to a driver-managed heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapHandle(pub u64);

/// Opaque handle to a driver-managed buffer (heap sub-buffer or no-copy view).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// Static device properties the pool sizes itself from.
#[derive(Debug, Clone, Copy)]
pub struct DeviceLimits {
    /// Hard ceiling on a single buffer. Allocations at or above this are
    /// rejected before reaching the driver.
    pub max_buffer_length: u64,
    /// Physical memory of the machine.
    pub physical_memory: u64,
    /// The device's own recommended working-set size.
    pub working_set_hint: u64,
}

/// Capability surface the allocator consumes from the GPU driver/runtime.
///
/// The pool never encodes commands or dispatches kernels; everything it needs
/// from the device is behind this trait, which makes the allocator itself
/// portable and testable against a software device ([`sim::SimDriver`]).
///
/// Address-assignment assumption: the GPU address reported by
/// [`create_no_copy_buffer`](Self::create_no_copy_buffer) is a deterministic
/// function of allocation order, so releasing a rejected buffer and retrying
/// observes the same assignment. Block construction depends on this.
pub trait GpuDriver {
    /// Create a heap of `size` bytes. `hazard_tracking_disabled` hands
    /// cross-buffer synchronization to the caller; `cpu_gpu_shared` requests
    /// storage visible to both sides.
    fn create_heap(
        &mut self,
        size: u64,
        hazard_tracking_disabled: bool,
        cpu_gpu_shared: bool,
    ) -> UsmResult<HeapHandle>;

    /// Mark a heap purgeable/empty so it contributes no resident footprint
    /// until written.
    fn set_heap_purgeable(&mut self, heap: HeapHandle);

    /// Largest single sub-buffer the heap can currently provide, at the given
    /// alignment. A lower bound, not an exact free-byte count.
    fn heap_max_available_size(&self, heap: HeapHandle, alignment: u64) -> u64;

    /// Sub-allocate `size` bytes from a heap. Returns the buffer handle, its
    /// GPU address, and the actual (driver-rounded) size consumed.
    fn heap_allocate_buffer(
        &mut self,
        heap: HeapHandle,
        size: u64,
    ) -> UsmResult<(BufferHandle, u64, u64)>;

    /// Wrap `size` bytes of caller-owned memory at `cpu_addr` in a buffer
    /// without copying. The driver, not the caller, picks the GPU address.
    fn create_no_copy_buffer(&mut self, cpu_addr: u64, size: u64) -> UsmResult<(BufferHandle, u64)>;

    /// Release a buffer created by either allocation path. Returns the actual
    /// size the buffer occupied.
    fn release_buffer(&mut self, buffer: BufferHandle) -> u64;

    /// Release a heap. All of its sub-buffers must have been released first.
    fn release_heap(&mut self, heap: HeapHandle);

    /// Reserve `size` bytes of anonymous virtual memory with no backing file.
    fn reserve_virtual_memory(&mut self, size: u64) -> UsmResult<*mut u8>;

    /// Release a reservation made by
    /// [`reserve_virtual_memory`](Self::reserve_virtual_memory).
    fn release_virtual_memory(&mut self, base: *mut u8, size: u64);

    fn device_limits(&self) -> DeviceLimits;

    /// Marketing/diagnostic name of the device.
    fn device_name(&self) -> String {
        "unknown".to_string()
    }
}
