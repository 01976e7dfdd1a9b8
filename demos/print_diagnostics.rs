use usm_rs::driver::GpuDriver;
use usm_rs::driver::sim::{SimConfig, SimDriver};
use usm_rs::{HeapPool, PoolConfig, UsmError};

fn main() -> Result<(), UsmError> {
    println!("============================================================");
    println!("              Unified Memory Pool - Diagnostics              ");
    println!("============================================================");

    // 1. Bring up the (software) device
    let driver = SimDriver::new(SimConfig::default());
    let limits = driver.device_limits();
    println!("[+] Device: {}", driver.device_name());
    println!("    Max buffer length:  {} MiB", limits.max_buffer_length >> 20);
    println!("    Physical memory:    {} MiB", limits.physical_memory >> 20);
    println!("    Working-set hint:   {} MiB", limits.working_set_hint >> 20);

    // 2. Build the pool (reserves the span, computes tiers)
    println!("\n[+] Initializing pool...");
    let mut pool = HeapPool::new(driver, PoolConfig::default())?;

    let tiers = pool.tiers();
    println!("    Physical limit:     {} MiB", tiers.physical_memory_limit >> 20);
    println!("    Small heap:         {} KiB", tiers.small_heap >> 10);
    println!("    Large heap:         {} KiB", tiers.large_heap >> 10);
    println!("    Max small alloc:    {} KiB", tiers.max_small_alloc >> 10);
    println!("    Min large alloc:    {} KiB", tiers.min_large_alloc >> 10);
    println!(
        "    Reserved span:      {} MiB @ {:p}",
        pool.reservation().len() >> 20,
        pool.reservation().cpu_base()
    );

    // 3. Exercise both tiers
    println!("\n[+] Exercising the allocator...");
    let small = pool.allocate(4 << 10)?;
    let large = pool.allocate(1 << 20)?;
    println!("    small (4 KiB):  {small:p}");
    println!("    large (1 MiB):  {large:p}");
    println!("    blocks resident: {}", pool.block_count());
    println!("    used bytes:      {}", pool.total_used_size());

    for buffer in pool.resident_buffers() {
        println!("    resident buffer: {buffer:?}");
    }

    pool.deallocate(large);
    pool.deallocate(small);
    println!("\n[+] After release: used = {} bytes", pool.total_used_size());

    Ok(())
}
