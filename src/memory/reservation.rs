use crate::config::PoolConfig;
use crate::driver::GpuDriver;
use crate::error::{UsmError, UsmResult};
use tracing::{debug, info};

/// A single large reservation of anonymous virtual memory.
///
/// Reserved once at pool construction and never resized. CPU pointers handed
/// out by the pool all live inside `[cpu_base, cpu_base + len)`; the matching
/// GPU addresses are anchored at `PoolConfig::gpu_base_ref`.
#[derive(Debug)]
pub struct AddressSpaceReservation {
    cpu_base: *mut u8,
    len: u64,
}

impl AddressSpaceReservation {
    /// Reserve a close-to-maximal span.
    ///
    /// Starts at `virtual_span_preferred` and halves on failure; once a
    /// candidate succeeds, a bounded bisection grows it back toward the last
    /// failed size. No intermediate success is held while a larger candidate
    /// is probed, so nothing leaks regardless of where the search ends.
    ///
    /// # Errors
    /// `VirtualReservationFailed` if even `virtual_span_floor` cannot be
    /// reserved. This is an unrecoverable startup condition.
    pub fn reserve<D: GpuDriver>(driver: &mut D, config: &PoolConfig) -> UsmResult<Self> {
        let floor = config.virtual_span_floor;
        let mut size = config.virtual_span_preferred.max(floor);

        // 1. Halve until the OS accepts a candidate.
        let mut base = loop {
            match driver.reserve_virtual_memory(size) {
                Ok(ptr) => break ptr,
                Err(_) => {
                    debug!(size, "virtual span candidate rejected");
                    if size / 2 < floor {
                        return Err(UsmError::VirtualReservationFailed { floor });
                    }
                    size /= 2;
                }
            }
        };

        // 2. Grow back toward the last failure with a bounded bisection.
        if size < config.virtual_span_preferred {
            let granule = config.reserve_step_granule.max(1);
            let mut lo = size;
            let mut hi = (size * 2).min(config.virtual_span_preferred);
            for _ in 0..config.reserve_refine_steps {
                let mid = (lo + (hi - lo) / 2) / granule * granule;
                if mid <= lo {
                    break;
                }
                driver.release_virtual_memory(base, lo);
                match driver.reserve_virtual_memory(mid) {
                    Ok(ptr) => {
                        base = ptr;
                        lo = mid;
                    }
                    Err(_) => {
                        hi = mid;
                        // Fall back to the size known to work. The OS just
                        // gave this much back, so a refusal here means the
                        // environment shifted under us.
                        base = driver
                            .reserve_virtual_memory(lo)
                            .map_err(|_| UsmError::VirtualReservationFailed { floor })?;
                    }
                }
            }
            size = lo;
        }

        info!(size, "virtual span reserved");
        Ok(Self { cpu_base: base, len: size })
    }

    #[must_use]
    pub fn cpu_base(&self) -> *mut u8 {
        self.cpu_base
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `[addr, addr + size)` lies inside the reservation.
    #[must_use]
    pub fn contains_range(&self, addr: u64, size: u64) -> bool {
        let base = self.cpu_base as u64;
        addr >= base && addr + size <= base + self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{BufferHandle, DeviceLimits, HeapHandle};

    /// OS stand-in that accepts reservations only up to a cap and tracks how
    /// many are simultaneously held.
    struct ShrinkingOs {
        accept_up_to: u64,
        held: Vec<(u64, u64)>,
        max_held: usize,
        next: u64,
    }

    impl ShrinkingOs {
        fn new(accept_up_to: u64) -> Self {
            Self { accept_up_to, held: Vec::new(), max_held: 0, next: 0x1000_0000 }
        }
    }

    impl GpuDriver for ShrinkingOs {
        fn create_heap(&mut self, _: u64, _: bool, _: bool) -> UsmResult<HeapHandle> {
            unimplemented!()
        }
        fn set_heap_purgeable(&mut self, _: HeapHandle) {
            unimplemented!()
        }
        fn heap_max_available_size(&self, _: HeapHandle, _: u64) -> u64 {
            unimplemented!()
        }
        fn heap_allocate_buffer(&mut self, _: HeapHandle, _: u64) -> UsmResult<(BufferHandle, u64, u64)> {
            unimplemented!()
        }
        fn create_no_copy_buffer(&mut self, _: u64, _: u64) -> UsmResult<(BufferHandle, u64)> {
            unimplemented!()
        }
        fn release_buffer(&mut self, _: BufferHandle) -> u64 {
            unimplemented!()
        }
        fn release_heap(&mut self, _: HeapHandle) {
            unimplemented!()
        }
        fn reserve_virtual_memory(&mut self, size: u64) -> UsmResult<*mut u8> {
            if size > self.accept_up_to {
                return Err(UsmError::Io(std::io::Error::from_raw_os_error(libc::ENOMEM)));
            }
            let base = self.next;
            self.next += size;
            self.held.push((base, size));
            self.max_held = self.max_held.max(self.held.len());
            Ok(base as *mut u8)
        }
        fn release_virtual_memory(&mut self, base: *mut u8, _: u64) {
            let addr = base as u64;
            let before = self.held.len();
            self.held.retain(|&(b, _)| b != addr);
            assert_eq!(before, self.held.len() + 1, "released unknown reservation");
        }
        fn device_limits(&self) -> DeviceLimits {
            unimplemented!()
        }
    }

    fn config(preferred: u64, floor: u64) -> PoolConfig {
        PoolConfig {
            virtual_span_preferred: preferred,
            virtual_span_floor: floor,
            reserve_step_granule: 1 << 20,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn preferred_size_succeeds_first_try() {
        let mut os = ShrinkingOs::new(16 << 30);
        let r = AddressSpaceReservation::reserve(&mut os, &config(8 << 30, 1 << 30)).unwrap();
        assert_eq!(r.len(), 8 << 30);
        assert_eq!(os.held.len(), 1);
    }

    #[test]
    fn search_converges_near_the_os_limit_without_leaking() {
        // OS accepts at most 5 GiB; halving lands at 4 GiB, bisection should
        // claw back some of the missing 1 GiB.
        let limit = 5 << 30;
        let mut os = ShrinkingOs::new(limit);
        let r = AddressSpaceReservation::reserve(&mut os, &config(16 << 30, 1 << 30)).unwrap();
        assert!(r.len() >= 4 << 30);
        assert!(r.len() <= limit);
        assert_eq!(os.max_held, 1, "two reservations held at once");
        assert_eq!(os.held.len(), 1);
    }

    #[test]
    fn below_floor_is_fatal() {
        let mut os = ShrinkingOs::new(1 << 20);
        let err = AddressSpaceReservation::reserve(&mut os, &config(1 << 30, 256 << 20));
        assert!(matches!(err, Err(UsmError::VirtualReservationFailed { .. })));
        assert!(os.held.is_empty());
    }

    #[test]
    fn range_containment() {
        let mut os = ShrinkingOs::new(1 << 30);
        let r = AddressSpaceReservation::reserve(&mut os, &config(1 << 30, 1 << 20)).unwrap();
        let base = r.cpu_base() as u64;
        assert!(r.contains_range(base, 1));
        assert!(r.contains_range(base + (1 << 30) - 4096, 4096));
        assert!(!r.contains_range(base + (1 << 30), 1));
        assert!(!r.contains_range(base - 1, 1));
    }
}
