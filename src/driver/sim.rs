//! Deterministic software device.
//!
//! Implements [`GpuDriver`] entirely in-process so the allocator can be
//! exercised without GPU hardware: the virtual span is a real `mmap`
//! reservation, no-copy buffers flip their range to read/write, and "GPU"
//! addresses come from deterministic cursors. Writes through allocator
//! pointers and reads through [`SimDriver::resolve`] therefore touch the same
//! bytes, which is exactly the aliasing the real device provides.

use crate::driver::{BufferHandle, DeviceLimits, GpuDriver, HeapHandle};
use crate::error::{UsmError, UsmResult};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::ptr;

/// Sub-buffer sizes are rounded up to this, mimicking driver-side rounding.
pub const BUFFER_GRANULE: u64 = 256;

const PAGE_SIZE: u64 = 4096;

/// Shape of the simulated device.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Budget for the sum of live heap sizes; `create_heap` refuses beyond it.
    pub device_memory: u64,
    pub max_buffer_length: u64,
    pub physical_memory: u64,
    pub working_set_hint: u64,
    /// First GPU address handed to a no-copy buffer. The allocator never sees
    /// this constant; it discovers the assignment through buffer creation.
    pub nocopy_base: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            device_memory: 8 << 30,
            max_buffer_length: 4 << 30,
            physical_memory: 16 << 30,
            working_set_hint: 12 << 30,
            nocopy_base: 0x1_8000_0000,
        }
    }
}

#[derive(Debug)]
struct SimHeap {
    size: u64,
    /// Internal base of the heap's GPU address range. Deliberately not
    /// exposed through the trait; callers must discover it empirically.
    va_base: u64,
    purgeable: bool,
    /// offset -> actual size, first-fit.
    allocs: BTreeMap<u64, u64>,
}

impl SimHeap {
    /// Lowest offset where `size` bytes fit, or None.
    fn first_fit(&self, size: u64) -> Option<u64> {
        let mut cursor = 0u64;
        for (&off, &len) in &self.allocs {
            if off.saturating_sub(cursor) >= size {
                return Some(cursor);
            }
            cursor = off + len;
        }
        (self.size.saturating_sub(cursor) >= size).then_some(cursor)
    }

    /// Largest free extent, floored to a multiple of `alignment`.
    fn max_available(&self, alignment: u64) -> u64 {
        let mut best = 0u64;
        let mut cursor = 0u64;
        for (&off, &len) in &self.allocs {
            best = best.max(off.saturating_sub(cursor));
            cursor = off + len;
        }
        best = best.max(self.size.saturating_sub(cursor));
        if alignment > 1 { best / alignment * alignment } else { best }
    }
}

#[derive(Debug)]
enum SimBuffer {
    HeapSub { heap: HeapHandle, offset: u64, size: u64 },
    NoCopy { cpu: u64, gpu: u64, size: u64 },
}

/// In-process [`GpuDriver`] implementation.
#[derive(Debug)]
pub struct SimDriver {
    config: SimConfig,
    heaps: HashMap<HeapHandle, SimHeap>,
    buffers: HashMap<BufferHandle, SimBuffer>,
    next_handle: u64,
    /// Bump cursor for no-copy GPU addresses. Rolls back when the most
    /// recently assigned buffer is released, so a release-and-retry observes
    /// the same address - the determinism the convergence loop relies on.
    nocopy_cursor: u64,
    heap_va_cursor: u64,
    device_used: u64,
    reservations: Vec<(u64, u64)>,
}

impl SimDriver {
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            heaps: HashMap::new(),
            buffers: HashMap::new(),
            next_handle: 1,
            nocopy_cursor: config.nocopy_base,
            heap_va_cursor: 0x6000_0000_0000,
            device_used: 0,
            reservations: Vec::new(),
        }
    }

    fn fresh_handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn heap(&self, heap: HeapHandle) -> &SimHeap {
        self.heaps.get(&heap).expect("unknown heap handle")
    }

    /// Live device-memory footprint of all heaps.
    #[must_use]
    pub fn device_used(&self) -> u64 {
        self.device_used
    }

    /// Whether the heap is currently marked purgeable. The hint is cleared by
    /// the first sub-allocation.
    #[must_use]
    pub fn heap_is_purgeable(&self, heap: HeapHandle) -> bool {
        self.heap(heap).purgeable
    }

    /// CPU pointer backing `offset` bytes into a no-copy buffer.
    ///
    /// Stands in for the device-side view of pool memory in demos and tests:
    /// a dispatch that was handed `(buffer, offset)` reads through this.
    ///
    /// # Panics
    /// Panics for heap sub-buffers; only no-copy buffers alias CPU memory
    /// directly.
    #[must_use]
    pub fn resolve(&self, buffer: BufferHandle, offset: u64) -> *mut u8 {
        match self.buffers.get(&buffer) {
            Some(SimBuffer::NoCopy { cpu, size, .. }) => {
                assert!(offset < *size, "offset {offset} outside buffer");
                (*cpu + offset) as *mut u8
            }
            Some(SimBuffer::HeapSub { .. }) => {
                panic!("heap sub-buffers have no direct CPU view")
            }
            None => panic!("unknown buffer handle"),
        }
    }

    fn mprotect_rw(&self, cpu_addr: u64, size: u64) -> io::Result<()> {
        let covered = self
            .reservations
            .iter()
            .any(|&(base, len)| cpu_addr >= base && cpu_addr + size <= base + len);
        if !covered {
            // Caller-owned memory outside our reservations is already mapped.
            return Ok(());
        }
        let start = cpu_addr / PAGE_SIZE * PAGE_SIZE;
        let end = (cpu_addr + size).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let ret = unsafe {
            libc::mprotect(
                start as *mut libc::c_void,
                (end - start) as usize,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl GpuDriver for SimDriver {
    fn create_heap(
        &mut self,
        size: u64,
        _hazard_tracking_disabled: bool,
        _cpu_gpu_shared: bool,
    ) -> UsmResult<HeapHandle> {
        if self.device_used + size > self.config.device_memory {
            return Err(UsmError::OutOfDeviceMemory { requested: size });
        }
        let handle = HeapHandle(self.fresh_handle());
        let va_base = self.heap_va_cursor;
        // 64 KiB guard gap between heap ranges.
        self.heap_va_cursor += size + (64 << 10);
        self.device_used += size;
        self.heaps.insert(
            handle,
            SimHeap {
                size,
                va_base,
                purgeable: false,
                allocs: BTreeMap::new(),
            },
        );
        Ok(handle)
    }

    fn set_heap_purgeable(&mut self, heap: HeapHandle) {
        self.heaps
            .get_mut(&heap)
            .expect("unknown heap handle")
            .purgeable = true;
    }

    fn heap_max_available_size(&self, heap: HeapHandle, alignment: u64) -> u64 {
        self.heap(heap).max_available(alignment)
    }

    fn heap_allocate_buffer(
        &mut self,
        heap: HeapHandle,
        size: u64,
    ) -> UsmResult<(BufferHandle, u64, u64)> {
        let actual = size.max(1).div_ceil(BUFFER_GRANULE) * BUFFER_GRANULE;
        let entry = self.heaps.get_mut(&heap).expect("unknown heap handle");
        let Some(offset) = entry.first_fit(actual) else {
            return Err(UsmError::Driver(format!(
                "heap cannot place {actual} bytes"
            )));
        };
        entry.allocs.insert(offset, actual);
        entry.purgeable = false;
        let gpu = entry.va_base + offset;
        let handle = BufferHandle(self.fresh_handle());
        self.buffers
            .insert(handle, SimBuffer::HeapSub { heap, offset, size: actual });
        Ok((handle, gpu, actual))
    }

    fn create_no_copy_buffer(&mut self, cpu_addr: u64, size: u64) -> UsmResult<(BufferHandle, u64)> {
        let gpu = self.nocopy_cursor;
        self.mprotect_rw(cpu_addr, size)?;
        self.nocopy_cursor += size;
        let handle = BufferHandle(self.fresh_handle());
        self.buffers
            .insert(handle, SimBuffer::NoCopy { cpu: cpu_addr, gpu, size });
        Ok((handle, gpu))
    }

    fn release_buffer(&mut self, buffer: BufferHandle) -> u64 {
        match self.buffers.remove(&buffer) {
            Some(SimBuffer::HeapSub { heap, offset, size }) => {
                let entry = self.heaps.get_mut(&heap).expect("unknown heap handle");
                entry
                    .allocs
                    .remove(&offset)
                    .expect("sub-buffer not registered in its heap");
                size
            }
            Some(SimBuffer::NoCopy { gpu, size, .. }) => {
                if gpu + size == self.nocopy_cursor {
                    self.nocopy_cursor = gpu;
                }
                size
            }
            None => panic!("unknown buffer handle"),
        }
    }

    fn release_heap(&mut self, heap: HeapHandle) {
        let entry = self.heaps.remove(&heap).expect("unknown heap handle");
        assert!(
            entry.allocs.is_empty(),
            "heap released with live sub-buffers"
        );
        self.device_used -= entry.size;
    }

    fn reserve_virtual_memory(&mut self, size: u64) -> UsmResult<*mut u8> {
        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(UsmError::Io(io::Error::last_os_error()));
        }
        self.reservations.push((ret as u64, size));
        Ok(ret.cast::<u8>())
    }

    fn release_virtual_memory(&mut self, base: *mut u8, size: u64) {
        self.reservations
            .retain(|&(b, _)| b != base as u64);
        unsafe {
            libc::munmap(base.cast::<libc::c_void>(), size as usize);
        }
    }

    fn device_limits(&self) -> DeviceLimits {
        DeviceLimits {
            max_buffer_length: self.config.max_buffer_length,
            physical_memory: self.config.physical_memory,
            working_set_hint: self.config.working_set_hint,
        }
    }

    fn device_name(&self) -> String {
        "usm-sim".to_string()
    }
}

impl Drop for SimDriver {
    fn drop(&mut self) {
        for &(base, size) in &self.reservations {
            unsafe {
                libc::munmap(base as *mut libc::c_void, size as usize);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_buffer_sizes_round_to_granule() {
        let mut sim = SimDriver::new(SimConfig::default());
        let heap = sim.create_heap(1 << 20, true, true).unwrap();
        let (_, _, actual) = sim.heap_allocate_buffer(heap, 100).unwrap();
        assert_eq!(actual, BUFFER_GRANULE);
        let (_, gpu2, actual2) = sim.heap_allocate_buffer(heap, 300).unwrap();
        assert_eq!(actual2, 2 * BUFFER_GRANULE);
        // First-fit: second buffer lands right behind the first.
        let base = gpu2 - BUFFER_GRANULE;
        assert_eq!(sim.heap(heap).va_base, base);
    }

    #[test]
    fn nocopy_cursor_rolls_back_on_release() {
        let mut sim = SimDriver::new(SimConfig::default());
        let (b1, gpu1) = sim.create_no_copy_buffer(0, 4096).unwrap();
        sim.release_buffer(b1);
        let (_, gpu2) = sim.create_no_copy_buffer(0, 4096).unwrap();
        assert_eq!(gpu1, gpu2);
    }

    #[test]
    fn purge_hint_clears_on_first_use() {
        let mut sim = SimDriver::new(SimConfig::default());
        let heap = sim.create_heap(1 << 20, true, true).unwrap();
        assert!(!sim.heap_is_purgeable(heap));
        sim.set_heap_purgeable(heap);
        assert!(sim.heap_is_purgeable(heap));
        sim.heap_allocate_buffer(heap, 4096).unwrap();
        assert!(!sim.heap_is_purgeable(heap));
    }

    #[test]
    fn heap_budget_is_enforced() {
        let mut sim = SimDriver::new(SimConfig {
            device_memory: 1 << 20,
            ..SimConfig::default()
        });
        let h = sim.create_heap(1 << 20, true, true).unwrap();
        assert!(matches!(
            sim.create_heap(4096, true, true),
            Err(UsmError::OutOfDeviceMemory { .. })
        ));
        sim.release_heap(h);
        assert!(sim.create_heap(4096, true, true).is_ok());
        assert_eq!(sim.device_used(), 4096);
    }

    #[test]
    fn available_size_floors_to_alignment() {
        let mut sim = SimDriver::new(SimConfig::default());
        let heap = sim.create_heap(1 << 20, true, true).unwrap();
        assert_eq!(sim.heap_max_available_size(heap, 16 << 10), 1 << 20);
        sim.heap_allocate_buffer(heap, 100).unwrap();
        // 1 MiB - 256 B free, floored to 16 KiB.
        assert_eq!(
            sim.heap_max_available_size(heap, 16 << 10),
            (1 << 20) - (16 << 10)
        );
    }

    #[test]
    fn reservation_pages_become_writable_after_registration() {
        let mut sim = SimDriver::new(SimConfig::default());
        let base = sim.reserve_virtual_memory(1 << 20).unwrap();
        sim.create_no_copy_buffer(base as u64, 8192).unwrap();
        unsafe {
            base.write(0xAB);
            assert_eq!(base.read(), 0xAB);
        }
        sim.release_virtual_memory(base, 1 << 20);
    }
}
