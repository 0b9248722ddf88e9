use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static FALLBACK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Uniform index in `0..len`. `len` must be non-zero.
pub fn random_index(len: usize) -> usize {
    debug_assert!(len > 0);
    if len <= 1 {
        return 0;
    }
    let len = len as u64;
    // Rejection sampling keeps the pick unbiased.
    let zone = u64::MAX - (u64::MAX % len);
    loop {
        let value = random_u64();
        if value < zone {
            return (value % len) as usize;
        }
    }
}

fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_ok() {
        return u64::from_le_bytes(bytes);
    }
    let ts_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or(0);
    let seq = FALLBACK_SEQ.fetch_add(1, Ordering::Relaxed);
    ts_nanos ^ seq.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
