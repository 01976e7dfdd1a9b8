use thiserror::Error;

/// Recoverable failures surfaced by the allocator.
///
/// Contract violations (freeing a foreign pointer, an out-of-order index) and
/// driver-assumption violations (a non-converging address match, an
/// inconsistent heap-base probe) are not represented here: they indicate a bug
/// in the caller, the allocator or the driver, and panic instead.
#[derive(Error, Debug)]
pub enum UsmError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of device memory (requested {requested} bytes)")]
    OutOfDeviceMemory { requested: u64 },

    #[error("Out of reserved virtual address space (requested {requested} bytes)")]
    OutOfVirtualMemory { requested: u64 },

    #[error("Allocation of {requested} bytes exceeds the device buffer limit of {limit}")]
    OversizeAllocation { requested: u64, limit: u64 },

    #[error("Could not reserve a virtual span of at least {floor} bytes")]
    VirtualReservationFailed { floor: u64 },

    #[error("Driver Error: {0}")]
    Driver(String),
}

// A convenient alias
pub type UsmResult<T> = Result<T, UsmError>;
