use crate::config::PoolConfig;
use crate::driver::{BufferHandle, DeviceLimits, GpuDriver};
use crate::error::{UsmError, UsmResult};
use crate::memory::block::HeapBlock;
use crate::memory::reservation::AddressSpaceReservation;
use crate::memory::tiers::SizeTiers;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Stable identity of a block inside the pool's arena. Indexes refer to
/// blocks by ID, never by reference, so extract/mutate/reinsert never fights
/// the borrow checker or dangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u64);

impl BlockId {
    const MIN: Self = Self(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Small,
    Large,
}

/// Unified CPU/GPU memory pool.
///
/// Owns the virtual span, every heap block inside it, and three indexes:
/// blocks by GPU base address, and per-tier blocks ascending by available
/// size. A returned pointer is valid for CPU access immediately and resolves
/// to a `(buffer, offset)` pair for GPU binding via
/// [`get_buffer_and_offset`](Self::get_buffer_and_offset).
///
/// # Concurrency contract
///
/// The pool is synchronous and single-threaded; callers needing concurrent
/// access must serialize externally (one mutex around the whole pool).
/// Sub-allocated memory may be referenced by in-flight GPU work the pool
/// knows nothing about: the command-queue layer must defer
/// [`deallocate`](Self::deallocate) until that work has completed.
pub struct HeapPool<D: GpuDriver> {
    driver: D,
    config: PoolConfig,
    limits: DeviceLimits,
    tiers: SizeTiers,
    reservation: AddressSpaceReservation,

    blocks: HashMap<BlockId, HeapBlock>,
    /// gpu_base -> block, ascending, ranges disjoint.
    by_address: BTreeMap<u64, BlockId>,
    /// (available, id), ascending - best-fit extraction is a range scan.
    small_by_size: BTreeSet<(u64, BlockId)>,
    large_by_size: BTreeSet<(u64, BlockId)>,
    next_block_id: u64,
}

impl<D: GpuDriver> HeapPool<D> {
    /// Reserve the virtual span and compute tier thresholds.
    ///
    /// # Errors
    /// `VirtualReservationFailed` when the span search bottoms out below the
    /// configured floor.
    pub fn new(mut driver: D, config: PoolConfig) -> UsmResult<Self> {
        let limits = driver.device_limits();
        let tiers = SizeTiers::compute(&limits);
        let reservation = AddressSpaceReservation::reserve(&mut driver, &config)?;
        info!(
            device = %driver.device_name(),
            span = reservation.len(),
            small_heap = tiers.small_heap,
            large_heap = tiers.large_heap,
            "pool initialized"
        );
        Ok(Self {
            driver,
            config,
            limits,
            tiers,
            reservation,
            blocks: HashMap::new(),
            by_address: BTreeMap::new(),
            small_by_size: BTreeSet::new(),
            large_by_size: BTreeSet::new(),
            next_block_id: 0,
        })
    }

    // ===========================================================================================
    // Public allocation API
    // ===========================================================================================

    /// Allocate `size` bytes of CPU/GPU-shared memory.
    ///
    /// # Errors
    /// - `OversizeAllocation`: `size` at or above the device buffer limit.
    /// - `OutOfDeviceMemory`: the device refused a new heap even after empty
    ///   blocks were evicted. The caller may free pressure (for instance wait
    ///   for GPU work and deallocate) and retry; the pool itself never
    ///   retries beyond the single eviction pass.
    /// - `OutOfVirtualMemory`: the new block fell outside the reserved span.
    pub fn allocate(&mut self, size: u64) -> UsmResult<*mut u8> {
        assert!(size > 0, "zero-size allocation");
        if size >= self.limits.max_buffer_length {
            return Err(UsmError::OversizeAllocation {
                requested: size,
                limit: self.limits.max_buffer_length,
            });
        }

        let tier = self.tier_of_request(size);

        // 1. Best fit: smallest block whose available size still covers the
        //    request. Extracted now, reinserted at its new position below.
        let best = self
            .size_index(tier)
            .range((size, BlockId::MIN)..)
            .next()
            .copied();
        let id = match best {
            Some(key) => {
                self.size_index(tier).remove(&key);
                key.1
            }
            None => self.create_block(size, tier)?,
        };

        // 2. Delegate the sub-allocation.
        let block = self.blocks.get_mut(&id).expect("arena lost a block");
        let result = block.allocate(&mut self.driver, size);
        let available = block.available();

        // 3. Reinsert at the refreshed available size, success or not.
        self.size_index(tier).insert((available, id));
        let addr = result?;

        self.debug_check();
        Ok(addr as *mut u8)
    }

    /// Return `ptr` to the pool.
    ///
    /// # Panics
    /// Panics when `ptr` was not issued by this pool (or was already freed):
    /// a caller contract violation, per the error taxonomy.
    pub fn deallocate(&mut self, ptr: *mut u8) {
        let addr = ptr as u64;
        let Some(id) = self.owning_block_id(addr) else {
            panic!("pointer {addr:#x} was not allocated by this pool");
        };

        let block = &self.blocks[&id];
        let tier = self.tier_of_block(block);
        let capacity = block.capacity();
        let gpu_base = block.gpu_base();

        // The block's size-sort position goes stale the moment it mutates:
        // pull it out first, reinsert (or evict) after.
        let key = (block.available(), id);
        let removed = self.size_index(tier).remove(&key);
        assert!(removed, "block missing from its size index");

        let block = self.blocks.get_mut(&id).expect("arena lost a block");
        block.deallocate(&mut self.driver, addr);

        if block.is_empty() {
            let standard =
                capacity == self.tiers.small_heap || capacity == self.tiers.large_heap;
            // One-off blocks never earn their O(block-count) keep; standard
            // blocks stay as the tier's spare up to the configured count.
            let evict = !standard
                || self.empty_standard_blocks(tier, id) >= self.config.spare_empty_blocks_per_tier;
            if evict {
                self.by_address.remove(&gpu_base);
                let block = self.blocks.remove(&id).expect("arena lost a block");
                block.release(&mut self.driver);
                self.debug_check();
                return;
            }
        }

        let available = self.blocks[&id].available();
        self.size_index(tier).insert((available, id));
        self.debug_check();
    }

    /// Resolve a pool pointer to the GPU-facing buffer and byte offset the
    /// caller binds to a dispatch. `None` for anything the pool does not own
    /// or that is not inside a live allocation - this path is probed
    /// speculatively and never fatal.
    #[must_use]
    pub fn get_buffer_and_offset(&self, ptr: *const u8) -> Option<(BufferHandle, u64)> {
        let addr = ptr as u64;
        let id = self.owning_block_id(addr)?;
        let block = &self.blocks[&id];
        let offset = block.get_offset(addr)?;
        Some((block.buffer(), offset))
    }

    /// Sum of live allocation sizes (driver-rounded), across all blocks.
    #[must_use]
    pub fn total_used_size(&self) -> u64 {
        self.blocks.values().map(HeapBlock::used).sum()
    }

    /// Every pool-owned GPU buffer, in address order. The command-encoding
    /// layer marks these resident before each dispatch; the pool itself does
    /// not perform that declaration.
    #[must_use]
    pub fn resident_buffers(&self) -> Vec<BufferHandle> {
        self.by_address
            .values()
            .map(|id| self.blocks[id].buffer())
            .collect()
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn tiers(&self) -> &SizeTiers {
        &self.tiers
    }

    #[must_use]
    pub fn device_limits(&self) -> &DeviceLimits {
        &self.limits
    }

    #[must_use]
    pub fn reservation(&self) -> &AddressSpaceReservation {
        &self.reservation
    }

    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    // ===========================================================================================
    // Block lifecycle
    // ===========================================================================================

    fn create_block(&mut self, size: u64, tier: Tier) -> UsmResult<BlockId> {
        let heap_size = match tier {
            Tier::Small => self.tiers.small_heap,
            // Rare oversized requests get a heap cut to measure instead of
            // wasting a full large-tier heap.
            Tier::Large if size >= self.tiers.min_large_alloc => {
                size.div_ceil(self.config.oneoff_granularity) * self.config.oneoff_granularity
            }
            Tier::Large => self.tiers.large_heap,
        };

        let anchor = self.reservation.cpu_base() as u64;
        let mut created = HeapBlock::create(&mut self.driver, anchor, heap_size, &self.config)?;
        if created.is_none() {
            let evicted = self.evict_empty_blocks();
            warn!(evicted, heap_size, "device refused heap; retrying after eviction");
            created = HeapBlock::create(&mut self.driver, anchor, heap_size, &self.config)?;
        }
        let Some(block) = created else {
            return Err(UsmError::OutOfDeviceMemory { requested: size });
        };

        if !self
            .reservation
            .contains_range(block.cpu_base(), block.capacity())
        {
            warn!(
                cpu_base = block.cpu_base(),
                capacity = block.capacity(),
                "new block fell outside the reserved span"
            );
            block.release(&mut self.driver);
            return Err(UsmError::OutOfVirtualMemory { requested: size });
        }

        // Every block must sit on the pool-wide CPU<->GPU delta, or pointer
        // translation through the gpu-keyed address index breaks.
        debug_assert_eq!(
            block.cpu_base().wrapping_sub(block.gpu_base()),
            anchor.wrapping_sub(self.config.gpu_base_ref),
            "block delta diverged from the reservation delta"
        );

        let id = BlockId(self.next_block_id);
        self.next_block_id += 1;
        self.by_address.insert(block.gpu_base(), id);
        self.blocks.insert(id, block);
        Ok(id)
    }

    /// Drop every fully-empty block from all three indexes. Used as the one
    /// retry step when the device refuses a new heap.
    fn evict_empty_blocks(&mut self) -> usize {
        let empties: Vec<BlockId> = self
            .blocks
            .iter()
            .filter(|(_, b)| b.is_empty())
            .map(|(&id, _)| id)
            .collect();
        for &id in &empties {
            let block = self.blocks.remove(&id).expect("arena lost a block");
            let tier = if block.capacity() == self.tiers.small_heap {
                Tier::Small
            } else {
                Tier::Large
            };
            let removed = self.size_index(tier).remove(&(block.available(), id));
            assert!(removed, "block missing from its size index");
            self.by_address.remove(&block.gpu_base());
            block.release(&mut self.driver);
        }
        empties.len()
    }

    // ===========================================================================================
    // Lookup helpers
    // ===========================================================================================

    /// Owner of a CPU pointer, through the gpu-keyed address index. Relies on
    /// the uniform delta pinned at block construction.
    fn owning_block_id(&self, cpu_addr: u64) -> Option<BlockId> {
        let anchor = self.reservation.cpu_base() as u64;
        let gpu_guess = cpu_addr
            .wrapping_sub(anchor)
            .wrapping_add(self.config.gpu_base_ref);
        let (_, &id) = self.by_address.range(..=gpu_guess).next_back()?;
        self.blocks[&id].contains(cpu_addr).then_some(id)
    }

    fn tier_of_request(&self, size: u64) -> Tier {
        if self.tiers.is_small(size) { Tier::Small } else { Tier::Large }
    }

    fn tier_of_block(&self, block: &HeapBlock) -> Tier {
        if block.capacity() == self.tiers.small_heap {
            Tier::Small
        } else {
            Tier::Large
        }
    }

    fn size_index(&mut self, tier: Tier) -> &mut BTreeSet<(u64, BlockId)> {
        match tier {
            Tier::Small => &mut self.small_by_size,
            Tier::Large => &mut self.large_by_size,
        }
    }

    /// Fully-empty standard-capacity blocks of `tier`, excluding `except`.
    fn empty_standard_blocks(&self, tier: Tier, except: BlockId) -> usize {
        let standard = match tier {
            Tier::Small => self.tiers.small_heap,
            Tier::Large => self.tiers.large_heap,
        };
        self.blocks
            .iter()
            .filter(|&(&id, b)| id != except && b.capacity() == standard && b.is_empty())
            .count()
    }

    // ===========================================================================================
    // Consistency checks
    // ===========================================================================================

    fn debug_check(&self) {
        if cfg!(debug_assertions) {
            self.check_invariants();
        }
    }

    /// Cross-index consistency. Cheap enough for debug builds after every
    /// mutation; release builds skip it.
    ///
    /// # Panics
    /// Panics on any violation - these are allocator bugs, never runtime
    /// conditions.
    pub fn check_invariants(&self) {
        assert_eq!(
            self.by_address.len(),
            self.blocks.len(),
            "address index and arena disagree"
        );
        assert_eq!(
            self.small_by_size.len() + self.large_by_size.len(),
            self.blocks.len(),
            "size indexes do not partition the arena"
        );

        let mut prev_end = 0u64;
        for (&gpu_base, id) in &self.by_address {
            let block = &self.blocks[id];
            assert_eq!(block.gpu_base(), gpu_base, "address index key is stale");
            assert!(
                gpu_base >= prev_end,
                "blocks overlap in the address index"
            );
            prev_end = gpu_base + block.capacity();

            let tier = self.tier_of_block(block);
            let in_small = self.small_by_size.contains(&(block.available(), *id));
            let in_large = self.large_by_size.contains(&(block.available(), *id));
            match tier {
                Tier::Small => assert!(in_small && !in_large, "block in the wrong size index"),
                Tier::Large => assert!(in_large && !in_small, "block in the wrong size index"),
            }

            let live: u64 = block.allocations().values().map(|a| a.size).sum();
            assert_eq!(block.used(), live, "block usage drifted from its allocations");
        }
    }
}

impl<D: GpuDriver> Drop for HeapPool<D> {
    fn drop(&mut self) {
        for (_, block) in std::mem::take(&mut self.blocks) {
            block.release(&mut self.driver);
        }
        let base = self.reservation.cpu_base();
        let len = self.reservation.len();
        self.driver.release_virtual_memory(base, len);
        debug!("pool torn down");
    }
}
