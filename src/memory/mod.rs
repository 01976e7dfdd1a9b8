pub mod block;
pub mod manager;
pub mod reservation;
pub mod tiers;

/// One live sub-allocation inside a [`block::HeapBlock`].
///
/// `size` is the actual driver-rounded size, not the requested one; freeing
/// accounts against this value.
#[derive(Debug, Clone, Copy)]
pub struct LiveAllocation {
    pub buffer: crate::driver::BufferHandle,
    pub size: u64,
}

// Re-export the main manager for easy access
pub use manager::HeapPool;
pub use reservation::AddressSpaceReservation;
pub use tiers::SizeTiers;
