/// Tunables for the pool and its address-space engineering.
///
/// Every retry cap and granule the allocator relies on lives here rather than
/// as a literal at the use site, so a deployment can widen a bound without
/// touching allocator code.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// First candidate size for the virtual span reservation.
    pub virtual_span_preferred: u64,
    /// Smallest acceptable span. Failing to reserve this much is a fatal
    /// startup condition.
    pub virtual_span_floor: u64,
    /// Bisection iterations when growing the span back toward the last
    /// failed candidate.
    pub reserve_refine_steps: u32,
    /// Candidate sizes during the grow-back search are rounded down to a
    /// multiple of this.
    pub reserve_step_granule: u64,
    /// Fixed GPU-side reference address. Never dereferenced; only the anchor
    /// against which the CPU<->GPU delta is detected. Must be clear of the
    /// device's own internal allocations.
    pub gpu_base_ref: u64,
    /// Iteration cap for the address-convergence loop during block
    /// construction. Exceeding it means the driver no longer assigns
    /// addresses deterministically, which is fatal.
    pub address_match_retries: u32,
    /// How many fully-empty blocks to retain per tier before releasing
    /// further empties back to the driver.
    pub spare_empty_blocks_per_tier: usize,
    /// One-off heaps (for allocations at or above the large-allocation
    /// threshold) are sized to the request rounded up to this granule.
    pub oneoff_granularity: u64,
    /// Alignment at which a heap's maximum available size is queried.
    pub heap_alignment: u64,
    /// Size of the two probe buffers used to discover a heap's internal
    /// base address. Must be a multiple of the sub-buffer granule.
    pub probe_size: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            virtual_span_preferred: 16 << 30,
            virtual_span_floor: 1 << 30,
            reserve_refine_steps: 6,
            reserve_step_granule: 256 << 20,
            gpu_base_ref: 0x1_5000_0000,
            address_match_retries: 8,
            spare_empty_blocks_per_tier: 1,
            oneoff_granularity: 128 << 10,
            heap_alignment: 16 << 10,
            probe_size: 16 << 10,
        }
    }
}
