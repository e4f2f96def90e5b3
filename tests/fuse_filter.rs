//! End-to-end binary fuse filter checks: completeness at scale, the sizing
//! calibration point, and false-positive behavior.

use stdx::fuse::{BinaryFuse16, BinaryFuse8};

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[test]
fn million_keys_complete_and_calibrated() {
    let keys: Vec<u64> = (0..1_000_000).collect();
    let filter = BinaryFuse8::populate(&keys).unwrap();

    for &k in keys.iter().step_by(997) {
        assert!(filter.contains(k));
    }
    assert!(filter.contains(0));
    assert!(filter.contains(999_999));

    // Sizing calibration: 1,130,496 fingerprint cells plus the 40-byte
    // header for one million u8 entries.
    assert_eq!(filter.fingerprint_count(), 1_130_496);
    assert_eq!(filter.size_in_bytes(), 1_130_536);
}

#[test]
fn million_key_false_positive_rate_near_one_in_256() {
    let keys: Vec<u64> = (0..1_000_000).collect();
    let filter = BinaryFuse8::populate(&keys).unwrap();

    let mut rng = 0x5eed_f00du64;
    let mut positives = 0u64;
    const PROBES: u64 = 1_000_000;
    for _ in 0..PROBES {
        // Anything with the top bit set is outside the inserted range.
        let probe = splitmix64(&mut rng) | (1 << 63);
        if filter.contains(probe) {
            positives += 1;
        }
    }
    let rate = positives as f64 / PROBES as f64;
    assert!(
        (0.002..0.008).contains(&rate),
        "rate {rate} outside the expected band around 1/256"
    );
}

#[test]
fn duplicate_key_build_succeeds() {
    let keys = [303u64, 1, 77, 31, 241, 303];
    let filter = BinaryFuse8::populate(&keys).unwrap();
    for &k in &keys {
        assert!(filter.contains(k));
    }
    // No false negatives and plausible sizing for six (five unique) keys.
    assert!(filter.fingerprint_count() >= 12);
}

#[test]
fn sixteen_bit_rate_is_far_tighter() {
    let keys: Vec<u64> = (0..100_000).collect();
    let filter = BinaryFuse16::populate(&keys).unwrap();

    let mut rng = 0xabcdu64;
    let mut positives = 0u64;
    const PROBES: u64 = 500_000;
    for _ in 0..PROBES {
        let probe = splitmix64(&mut rng) | (1 << 63);
        if filter.contains(probe) {
            positives += 1;
        }
    }
    // Expected ~7.6 positives at 2^-16; even 10x leaves a wide margin
    // below the 8-bit rate.
    assert!(positives < 80, "16-bit false positives: {positives}");
}

#[test]
fn filter_is_shareable_across_threads() {
    use std::sync::Arc;

    let keys: Vec<u64> = (0..100_000).collect();
    let filter = Arc::new(BinaryFuse8::populate(&keys).unwrap());

    std::thread::scope(|s| {
        for t in 0..4u64 {
            let filter = Arc::clone(&filter);
            s.spawn(move || {
                for k in (t * 25_000)..((t + 1) * 25_000) {
                    assert!(filter.contains(k));
                }
            });
        }
    });
}
