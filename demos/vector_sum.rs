//! Three pattern-filled inputs, one output, summed through translated
//! addresses: the CPU writes through pool pointers, the "dispatch" reads
//! through the device-side (buffer, offset) pairs, and both must agree.

use usm_rs::driver::sim::{SimConfig, SimDriver};
use usm_rs::{HeapPool, PoolConfig, UsmError};

const WORDS: usize = 1 << 18; // 1 MiB per buffer
const PATTERNS: [u32; 3] = [0x0101_0101, 0x0202_0202, 0x1000_0001];

fn main() -> Result<(), UsmError> {
    println!("============================================================");
    println!("            Unified Memory Pool - Vector Sum Demo            ");
    println!("============================================================");

    let mut pool = HeapPool::new(SimDriver::new(SimConfig::default()), PoolConfig::default())?;
    let bytes = (WORDS * 4) as u64;

    // 1. Allocate three inputs and one output from the pool
    let inputs: Vec<*mut u8> = (0..3).map(|_| pool.allocate(bytes)).collect::<Result<_, _>>()?;
    let output = pool.allocate(bytes)?;
    println!("[+] Allocated 4 x {} KiB", bytes >> 10);

    // 2. Fill the inputs through their CPU pointers
    for (ptr, pattern) in inputs.iter().zip(PATTERNS) {
        let words = unsafe { std::slice::from_raw_parts_mut(ptr.cast::<u32>(), WORDS) };
        words.fill(pattern);
    }

    // 3. Translate every pointer to its GPU-facing (buffer, offset) pair
    let translated: Vec<_> = inputs
        .iter()
        .chain(std::iter::once(&output))
        .map(|&p| pool.get_buffer_and_offset(p).expect("pool pointer must translate"))
        .collect();
    for (buffer, offset) in &translated {
        println!("    {buffer:?} + {offset:#x}");
    }

    // 4. "Dispatch": sum the inputs into the output through the device-side
    //    views, exactly as a kernel bound to these buffers would
    {
        let sim = pool.driver();
        let srcs: Vec<*const u32> = translated[..3]
            .iter()
            .map(|&(b, o)| sim.resolve(b, o).cast_const().cast::<u32>())
            .collect();
        let (ob, oo) = translated[3];
        let dst = sim.resolve(ob, oo).cast::<u32>();
        for i in 0..WORDS {
            unsafe {
                *dst.add(i) = srcs.iter().map(|&s| *s.add(i)).fold(0u32, u32::wrapping_add);
            }
        }
    }

    // 5. Verify through the CPU pointer
    let expected = PATTERNS.iter().fold(0u32, |a, &b| a.wrapping_add(b));
    let out_words = unsafe { std::slice::from_raw_parts(output.cast::<u32>(), WORDS) };
    let bad = out_words.iter().filter(|&&w| w != expected).count();
    if bad == 0 {
        println!("[+] All {WORDS} output words equal {expected:#010x}");
    } else {
        println!("[-] {bad} output words diverged");
        std::process::exit(1);
    }

    for ptr in inputs {
        pool.deallocate(ptr);
    }
    pool.deallocate(output);
    println!("[+] Pool drained: used = {} bytes", pool.total_used_size());
    Ok(())
}
