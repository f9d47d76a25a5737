//! Random rent/release/read sequences against the payload pool.
//!
//! Stale handles must always be rejected and live handles must always read
//! back what was rented.

#![no_main]

use libfuzzer_sys::fuzz_target;
use streamhub_core::PayloadPool;

fuzz_target!(|data: &[u8]| {
    let pool = PayloadPool::new(64);
    let mut live = Vec::new();
    let mut dead = Vec::new();

    for chunk in data.chunks(2) {
        let op = chunk[0] % 3;
        let arg = chunk.get(1).copied().unwrap_or(0);
        match op {
            0 => {
                let bytes = vec![arg; usize::from(arg)];
                live.push((pool.rent(&bytes), bytes));
            },
            1 if !live.is_empty() => {
                let (handle, _) = live.swap_remove(usize::from(arg) % live.len());
                pool.release(handle).expect("live handle releases");
                dead.push(handle);
            },
            _ => {
                for (handle, bytes) in &live {
                    assert_eq!(pool.to_bytes(*handle).expect("live handle reads").as_ref(), bytes.as_slice());
                }
                for handle in &dead {
                    assert!(pool.release(*handle).is_err());
                    assert!(pool.with(*handle, |_| ()).is_err());
                }
            },
        }
    }

    assert_eq!(pool.stats().outstanding, live.len());
});
