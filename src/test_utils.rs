//! Test-only scaling knobs.
//!
//! The property suites and the cross-thread stress loops are sized for CI;
//! unqualified local `cargo test` runs get clamped counts so the suite stays
//! quick. Explicit environment overrides always win:
//!
//! - `PROPTEST_CASES` sets the proptest case count.
//! - `STRESS_OPS` sets the iteration count of the spin/handoff stress loops.

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

fn on_ci() -> bool {
    std::env::var_os("CI").is_some()
}

/// Proptest case count for a suite whose CI default is `default`.
pub fn proptest_cases(default: u32) -> u32 {
    match env_parse::<u32>("PROPTEST_CASES") {
        Some(cases) => cases.max(1),
        None if on_ci() => default.max(1),
        None => default.clamp(1, 4),
    }
}

/// Iteration count for a cross-thread stress loop whose CI default is
/// `default`. Contended spin loops dominate local test time, so the local
/// cap is aggressive; correctness assertions are all derived from the
/// returned count.
pub fn stress_ops(default: u64) -> u64 {
    match env_parse::<u64>("STRESS_OPS") {
        Some(ops) => ops.max(1),
        None if on_ci() => default.max(1),
        None => default.min(10_000),
    }
}
