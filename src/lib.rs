//! Unified CPU/GPU memory pool.
//!
//! One reserved virtual span, shared by both sides: every pointer handed out
//! by [`HeapPool`] is immediately dereferenceable on the CPU and resolves,
//! through a fixed discovered translation, to a GPU buffer and byte offset.
//! Backing storage is a pool of heap objects sized by a tiered policy and
//! sub-allocated so the driver is never registered with per-allocation
//! buffers.
//!
//! The GPU runtime is consumed strictly through the [`driver::GpuDriver`]
//! capability trait; [`driver::sim::SimDriver`] is a deterministic software
//! device for bring-up and tests.

pub mod config;
pub mod driver;
pub mod error;
pub mod memory;

pub use config::PoolConfig;
pub use error::{UsmError, UsmResult};
pub use memory::HeapPool;
