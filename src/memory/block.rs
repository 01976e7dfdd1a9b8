use crate::config::PoolConfig;
use crate::driver::{BufferHandle, GpuDriver, HeapHandle};
use crate::error::UsmResult;
use crate::memory::LiveAllocation;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// One GPU-heap-backed capacity window inside the reserved span.
///
/// A block owns a heap object, the no-copy buffer that aliases the heap's
/// bytes at a CPU address, and the offset-sorted set of live sub-allocations.
/// The construction handshake pins the block to the pool-wide translation
/// invariant: `cpu_base - gpu_base` equals `reservation base - gpu_base_ref`
/// for every block, so one address walk resolves either kind of pointer.
#[derive(Debug)]
pub struct HeapBlock {
    heap: HeapHandle,
    /// Block-spanning no-copy buffer; the GPU-facing handle returned by
    /// pointer translation.
    buffer: BufferHandle,
    cpu_base: u64,
    gpu_base: u64,
    /// The heap's internal base address, discovered empirically. Sub-buffer
    /// offsets are computed against this.
    heap_va: u64,
    capacity: u64,
    used: u64,
    /// Driver-reported lower bound on the largest single sub-allocation.
    available: u64,
    /// Alignment at which `available` is queried.
    alignment: u64,
    /// offset within block -> live sub-allocation, ascending.
    allocations: BTreeMap<u64, LiveAllocation>,
}

impl HeapBlock {
    /// Create a block of `size` bytes.
    ///
    /// `cpu_anchor` is the reservation's base pointer; the block's final CPU
    /// base comes out of the address-matching handshake and is generally
    /// offset from it.
    ///
    /// Returns `Ok(None)` when the driver refuses the heap (device memory
    /// pressure) - the caller decides whether to evict and retry.
    ///
    /// # Errors
    /// Propagates driver failures from the no-copy registration step.
    ///
    /// # Panics
    /// Panics when the address-matching loop exceeds its retry cap or the
    /// heap-base probe reports inconsistent sizes. Both mean the driver no
    /// longer assigns addresses deterministically, which this design cannot
    /// tolerate silently.
    pub fn create<D: GpuDriver>(
        driver: &mut D,
        cpu_anchor: u64,
        size: u64,
        config: &PoolConfig,
    ) -> UsmResult<Option<Self>> {
        // 1. The heap itself. Hazard tracking stays off: the pool guarantees
        //    non-overlap, the driver does not need to.
        let Ok(heap) = driver.create_heap(size, true, true) else {
            debug!(size, "driver refused heap");
            return Ok(None);
        };

        // 2. Purgeable until first use, so an idle block costs nothing.
        driver.set_heap_purgeable(heap);

        // 3. Address-matching handshake: the driver picks the GPU address,
        //    we move the CPU placement until both sides agree.
        let mut target = config.gpu_base_ref;
        let mut attempt = 0u32;
        let (buffer, cpu_base, gpu_base) = loop {
            attempt += 1;
            assert!(
                attempt <= config.address_match_retries,
                "GPU address assignment did not converge within {} attempts",
                config.address_match_retries
            );
            let delta = target
                .checked_sub(config.gpu_base_ref)
                .expect("driver assigned a GPU address below the reference base");
            let cpu_try = cpu_anchor + delta;
            let (buf, reported) = match driver.create_no_copy_buffer(cpu_try, size) {
                Ok(pair) => pair,
                Err(e) => {
                    driver.release_heap(heap);
                    return Err(e);
                }
            };
            if reported == target {
                break (buf, cpu_try, reported);
            }
            // Rejected placement: release before retrying so the driver sees
            // a fresh registration, then chase the reported address.
            driver.release_buffer(buf);
            target = reported;
        };

        // 4. Initial capacity signal.
        let available = driver.heap_max_available_size(heap, config.heap_alignment);

        // 5. The heap's internal base is not exposed; measure it.
        let heap_va = Self::probe_heap_base(driver, heap, config);

        debug!(size, cpu_base, gpu_base, attempts = attempt, "block created");
        Ok(Some(Self {
            heap,
            buffer,
            cpu_base,
            gpu_base,
            heap_va,
            capacity: size,
            used: 0,
            available,
            alignment: config.heap_alignment,
            allocations: BTreeMap::new(),
        }))
    }

    /// Discover the heap's internal base address with two adjacent probes.
    ///
    /// Deterministic and idempotent on an otherwise-empty heap: re-running
    /// yields the same address, and the bookkeeping side effects net to zero.
    ///
    /// # Panics
    /// Panics if the probes are not exactly `probe_size` apart or the heap's
    /// available size does not shrink by exactly `probe_size` per probe.
    pub fn probe_heap_base<D: GpuDriver>(
        driver: &mut D,
        heap: HeapHandle,
        config: &PoolConfig,
    ) -> u64 {
        let probe = config.probe_size;
        let avail0 = driver.heap_max_available_size(heap, config.heap_alignment);

        let Ok((b1, addr1, actual1)) = driver.heap_allocate_buffer(heap, probe) else {
            panic!("heap refused a {probe}-byte probe during base discovery");
        };
        assert_eq!(actual1, probe, "probe buffer was rounded; pick a granule-aligned probe size");
        let avail1 = driver.heap_max_available_size(heap, config.heap_alignment);
        assert_eq!(
            avail0 - avail1,
            probe,
            "first probe did not shrink available size by its own size"
        );

        let Ok((b2, addr2, _)) = driver.heap_allocate_buffer(heap, probe) else {
            panic!("heap refused a {probe}-byte probe during base discovery");
        };
        let avail2 = driver.heap_max_available_size(heap, config.heap_alignment);
        assert_eq!(
            avail1 - avail2,
            probe,
            "second probe did not shrink available size by its own size"
        );
        assert_eq!(
            addr2 - addr1,
            probe,
            "probe buffers are not adjacent; heap sub-allocation is not deterministic"
        );

        driver.release_buffer(b1);
        driver.release_buffer(b2);
        debug_assert_eq!(
            driver.heap_max_available_size(heap, config.heap_alignment),
            avail0
        );
        addr1
    }

    /// Sub-allocate `size` bytes and return the CPU address.
    ///
    /// Precondition (checked): `size <= available`. The pool verifies this
    /// before delegating; a violation is a programming error, not a runtime
    /// condition.
    ///
    /// # Errors
    /// Propagates a driver refusal of the sub-buffer.
    pub fn allocate<D: GpuDriver>(&mut self, driver: &mut D, size: u64) -> UsmResult<u64> {
        assert!(size > 0, "zero-size allocation");
        assert!(
            size <= self.available,
            "block asked for {size} bytes with only {} available",
            self.available
        );

        let (buf, gpu_addr, actual) = driver.heap_allocate_buffer(self.heap, size)?;
        assert!(
            gpu_addr >= self.heap_va,
            "sub-buffer address below the probed heap base"
        );
        let offset = gpu_addr - self.heap_va;

        // Neighbors in offset order must not overlap the new range.
        debug_assert!(
            self.allocations
                .range(..offset)
                .next_back()
                .is_none_or(|(&o, a)| o + a.size <= offset),
            "sub-allocation overlaps its predecessor"
        );
        debug_assert!(
            self.allocations
                .range(offset..)
                .next()
                .is_none_or(|(&o, _)| offset + actual <= o),
            "sub-allocation overlaps its successor"
        );

        self.allocations
            .insert(offset, LiveAllocation { buffer: buf, size: actual });
        self.used += actual;
        self.available = driver.heap_max_available_size(self.heap, self.alignment);

        trace!(offset, size, actual, "sub-allocated");
        Ok(self.cpu_base + offset)
    }

    /// Free the sub-allocation that starts at `cpu_addr`.
    ///
    /// # Panics
    /// Panics when no live sub-allocation starts there: a double free or a
    /// pointer this block never issued.
    pub fn deallocate<D: GpuDriver>(&mut self, driver: &mut D, cpu_addr: u64) {
        assert!(self.contains(cpu_addr), "pointer outside block range");
        let offset = cpu_addr - self.cpu_base;
        let Some(entry) = self.allocations.remove(&offset) else {
            panic!("no live sub-allocation at offset {offset}: double free or foreign pointer");
        };
        let freed = driver.release_buffer(entry.buffer);
        assert_eq!(
            freed, entry.size,
            "driver accounting for the freed buffer diverged from the block's"
        );
        self.used -= entry.size;
        self.available = driver.heap_max_available_size(self.heap, self.alignment);
        trace!(offset, size = entry.size, "sub-allocation freed");
    }

    /// Byte offset of `cpu_addr` within this block, if it falls inside a live
    /// sub-allocation. Probed speculatively by the pool, so a miss is a
    /// `None`, never fatal.
    #[must_use]
    pub fn get_offset(&self, cpu_addr: u64) -> Option<u64> {
        if !self.contains(cpu_addr) {
            return None;
        }
        let offset = cpu_addr - self.cpu_base;
        let (&start, entry) = self.allocations.range(..=offset).next_back()?;
        (offset < start + entry.size).then_some(offset)
    }

    #[must_use]
    pub fn contains(&self, cpu_addr: u64) -> bool {
        cpu_addr >= self.cpu_base && cpu_addr < self.cpu_base + self.capacity
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    #[must_use]
    pub fn cpu_base(&self) -> u64 {
        self.cpu_base
    }

    #[must_use]
    pub fn gpu_base(&self) -> u64 {
        self.gpu_base
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn available(&self) -> u64 {
        self.available
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.used
    }

    #[must_use]
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub(crate) fn allocations(&self) -> &BTreeMap<u64, LiveAllocation> {
        &self.allocations
    }

    /// Hand everything back to the driver. Consumes the block.
    pub fn release<D: GpuDriver>(self, driver: &mut D) {
        for entry in self.allocations.values() {
            driver.release_buffer(entry.buffer);
        }
        driver.release_buffer(self.buffer);
        driver.release_heap(self.heap);
        debug!(cpu_base = self.cpu_base, capacity = self.capacity, "block released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::{SimConfig, SimDriver};

    const BLOCK: u64 = 1 << 20;

    fn setup() -> (SimDriver, u64, PoolConfig) {
        let mut sim = SimDriver::new(SimConfig::default());
        let base = sim.reserve_virtual_memory(1 << 30).unwrap() as u64;
        (sim, base, PoolConfig::default())
    }

    fn new_block(sim: &mut SimDriver, anchor: u64, cfg: &PoolConfig) -> HeapBlock {
        HeapBlock::create(sim, anchor, BLOCK, cfg).unwrap().unwrap()
    }

    #[test]
    fn construction_pins_the_uniform_delta() {
        let (mut sim, anchor, cfg) = setup();
        let b1 = new_block(&mut sim, anchor, &cfg);
        let b2 = new_block(&mut sim, anchor, &cfg);
        let delta = anchor.wrapping_sub(cfg.gpu_base_ref);
        assert_eq!(b1.cpu_base().wrapping_sub(b1.gpu_base()), delta);
        assert_eq!(b2.cpu_base().wrapping_sub(b2.gpu_base()), delta);
        assert!(b2.gpu_base() >= b1.gpu_base() + b1.capacity());
    }

    #[test]
    fn probe_is_idempotent_and_net_zero() {
        let (mut sim, anchor, cfg) = setup();
        let block = new_block(&mut sim, anchor, &cfg);
        let avail = block.available();
        let va1 = HeapBlock::probe_heap_base(&mut sim, block.heap, &cfg);
        let va2 = HeapBlock::probe_heap_base(&mut sim, block.heap, &cfg);
        assert_eq!(va1, va2);
        assert_eq!(va1, block.heap_va);
        assert_eq!(
            sim.heap_max_available_size(block.heap, cfg.heap_alignment),
            avail
        );
    }

    #[test]
    fn allocate_writes_land_in_the_block() {
        let (mut sim, anchor, cfg) = setup();
        let mut block = new_block(&mut sim, anchor, &cfg);
        let addr = block.allocate(&mut sim, 1024).unwrap();
        assert!(block.contains(addr));
        unsafe {
            let p = addr as *mut u8;
            p.write(0x5A);
            assert_eq!(p.read(), 0x5A);
        }
        assert_eq!(block.used(), 1024);

        let offset = block.get_offset(addr).unwrap();
        assert_eq!(block.get_offset(addr + 100), Some(offset + 100));
        assert_eq!(block.get_offset(addr + 1024), None);

        block.deallocate(&mut sim, addr);
        assert!(block.is_empty());
        assert_eq!(block.get_offset(addr), None);
    }

    #[test]
    fn tracks_actual_rounded_sizes() {
        let (mut sim, anchor, cfg) = setup();
        let mut block = new_block(&mut sim, anchor, &cfg);
        block.allocate(&mut sim, 100).unwrap();
        // Driver rounds to its granule; the block must account the rounded size.
        assert_eq!(block.used(), crate::driver::sim::BUFFER_GRANULE);
    }

    #[test]
    #[should_panic(expected = "double free or foreign pointer")]
    fn double_free_panics() {
        let (mut sim, anchor, cfg) = setup();
        let mut block = new_block(&mut sim, anchor, &cfg);
        let addr = block.allocate(&mut sim, 4096).unwrap();
        block.deallocate(&mut sim, addr);
        block.deallocate(&mut sim, addr);
    }

    #[test]
    #[should_panic(expected = "available")]
    fn oversubscription_is_a_programming_error() {
        let (mut sim, anchor, cfg) = setup();
        let mut block = new_block(&mut sim, anchor, &cfg);
        let too_big = block.available() + 1;
        let _ = block.allocate(&mut sim, too_big);
    }

    #[test]
    fn release_returns_everything_to_the_driver() {
        let (mut sim, anchor, cfg) = setup();
        let mut block = new_block(&mut sim, anchor, &cfg);
        block.allocate(&mut sim, 4096).unwrap();
        block.release(&mut sim);
        assert_eq!(sim.device_used(), 0);
    }
}
