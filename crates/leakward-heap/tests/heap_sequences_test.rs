//! Deterministic allocate/free sequences checked against a shadow model.

use std::ptr::NonNull;

use leakward_heap::{BLOCK_ALIGN, HeapConfig, HeapRegion, PrivateHeap, SystemRegion};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[derive(Clone, Copy, Debug)]
struct Shadow {
    ptr: NonNull<u8>,
    size: usize,
    line: u32,
    serial: u64,
}

#[test]
fn deterministic_sequences_keep_registry_consistent() {
    // Invariant pressure rather than a fuzz campaign.
    const SEEDS: [u64; 4] = [1, 2, 3, 4];
    const STEPS: usize = 3_000;
    const SLOTS: usize = 48;

    for seed in SEEDS {
        let heap = PrivateHeap::new();
        let mut rng = XorShift64::new(seed);
        let mut slots: [Option<Shadow>; SLOTS] = [None; SLOTS];
        let mut succeeded = 0_usize;
        let mut freed = 0_usize;
        let mut last_serial: Option<u64> = None;

        for step in 0..STEPS {
            let idx = rng.gen_range_usize(0, SLOTS - 1);
            match (rng.gen_range_usize(0, 99), slots[idx]) {
                (0..=54, None) => {
                    let size = rng.gen_range_usize(1, 4_096);
                    let line = 1 + (step as u32 % 997);
                    let ptr = heap.allocate(size, "sequence.rs", line).expect("alloc");
                    assert_eq!(ptr.as_ptr() as usize % BLOCK_ALIGN, 0);
                    // SAFETY: live block of `heap`.
                    let info = unsafe { heap.header_of(ptr) };
                    if let Some(prev) = last_serial {
                        assert!(info.serial > prev, "seed={seed} step={step}: serial regressed");
                    } else {
                        assert_eq!(info.serial, 0, "seed={seed}: first serial must be 0");
                    }
                    last_serial = Some(info.serial);
                    // SAFETY: block spans `size` bytes.
                    unsafe { std::ptr::write_bytes(ptr.as_ptr(), idx as u8, size) };
                    slots[idx] = Some(Shadow {
                        ptr,
                        size,
                        line,
                        serial: info.serial,
                    });
                    succeeded += 1;
                }
                (55..=99, Some(shadow)) => {
                    // SAFETY: live block tracked by the shadow model.
                    let info = unsafe { heap.header_of(shadow.ptr) };
                    assert_eq!(info.size, shadow.size, "seed={seed} step={step}: size");
                    assert_eq!(info.origin_line, shadow.line, "seed={seed} step={step}: line");
                    assert_eq!(info.origin_file, "sequence.rs");
                    assert_eq!(info.serial, shadow.serial, "seed={seed} step={step}: serial");
                    // SAFETY: block spans `shadow.size` bytes.
                    let payload =
                        unsafe { std::slice::from_raw_parts(shadow.ptr.as_ptr(), shadow.size) };
                    assert!(payload.iter().all(|&b| b == idx as u8));
                    // SAFETY: freed exactly once.
                    unsafe { heap.deallocate(shadow.ptr.as_ptr()) };
                    slots[idx] = None;
                    freed += 1;
                }
                _ => {}
            }

            let live = slots.iter().flatten().count();
            assert_eq!(live, succeeded - freed);
            if step % 97 == 0 {
                assert_eq!(
                    heap.check_integrity(),
                    Ok(live),
                    "seed={seed} step={step}: registry invariants"
                );
                let mut expected: Vec<u64> = slots.iter().flatten().map(|s| s.serial).collect();
                let mut registered: Vec<u64> = heap.blocks().iter().map(|b| b.serial).collect();
                expected.sort_unstable();
                registered.sort_unstable();
                assert_eq!(registered, expected, "seed={seed} step={step}: membership");
            } else {
                assert_eq!(heap.live_blocks(), live);
            }
        }

        for shadow in slots.iter().flatten() {
            // SAFETY: still live.
            unsafe { heap.deallocate(shadow.ptr.as_ptr()) };
        }
        assert_eq!(heap.check_integrity(), Ok(0));
        assert_eq!(heap.live_bytes(), 0);
    }
}

#[test]
fn exhaustion_mid_sequence_leaves_registry_untouched() {
    let heap = PrivateHeap::with_region(SystemRegion::from_config(
        &HeapConfig::default().with_limit(16 * 1024),
    ));
    let mut live = Vec::new();
    let mut failures = 0;
    for i in 0..200 {
        match heap.allocate(256 + i, "exhaust.rs", 1) {
            Ok(ptr) => live.push(ptr),
            Err(_) => failures += 1,
        }
        assert_eq!(heap.live_blocks(), live.len());
        assert_eq!(heap.next_serial(), live.len() as u64);
    }
    assert!(failures > 0, "limit must be hit");
    assert_eq!(heap.check_integrity(), Ok(live.len()));
    for ptr in live {
        // SAFETY: live block of `heap`.
        unsafe { heap.deallocate(ptr.as_ptr()) };
    }
    assert_eq!(heap.region().stats().outstanding_bytes, 0);
}
