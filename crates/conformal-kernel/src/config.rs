//! Process-wide knobs.
//!
//! All limits are plain atomics: reads are lock-free, writes are rare and
//! test-driven. `reset_config` restores the documented defaults.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

pub const CHECK_ASSERTS_DEFAULT: bool = false;
pub const RECURSION_LIMIT_DEFAULT: usize = 4;
pub const FSPEC_ITERATIONS_DEFAULT: usize = 21;
pub const COLL_CHECK_LIMIT_DEFAULT: usize = 101;
pub const COLL_ERROR_LIMIT_DEFAULT: usize = 20;

/// Upper bound on generated collection sizes unless a spec overrides it.
pub const GEN_MAX_DEFAULT: usize = 20;

/// Retry budget for filtered (`such_that`) generators.
pub const SUCH_THAT_TRIES: usize = 100;

/// Seed used when the caller does not supply one. Generation is
/// deterministic: same seed, same values.
pub const DEFAULT_SEED: u64 = 0x5eed_cafe_f00d_0001;

static CHECK_ASSERTS: AtomicBool = AtomicBool::new(CHECK_ASSERTS_DEFAULT);
static RECURSION_LIMIT: AtomicUsize = AtomicUsize::new(RECURSION_LIMIT_DEFAULT);
static FSPEC_ITERATIONS: AtomicUsize = AtomicUsize::new(FSPEC_ITERATIONS_DEFAULT);
static COLL_CHECK_LIMIT: AtomicUsize = AtomicUsize::new(COLL_CHECK_LIMIT_DEFAULT);
static COLL_ERROR_LIMIT: AtomicUsize = AtomicUsize::new(COLL_ERROR_LIMIT_DEFAULT);
static SEED: AtomicU64 = AtomicU64::new(DEFAULT_SEED);

/// Whether `assert` raises on non-conforming values.
pub fn check_asserts() -> bool {
    CHECK_ASSERTS.load(Ordering::Relaxed)
}

pub fn set_check_asserts(on: bool) {
    CHECK_ASSERTS.store(on, Ordering::Relaxed);
}

/// How many times generation may re-enter the same recursive node.
pub fn recursion_limit() -> usize {
    RECURSION_LIMIT.load(Ordering::Relaxed)
}

pub fn set_recursion_limit(n: usize) {
    RECURSION_LIMIT.store(n, Ordering::Relaxed);
}

/// Trial count for generative function-spec checking.
pub fn fspec_iterations() -> usize {
    FSPEC_ITERATIONS.load(Ordering::Relaxed)
}

pub fn set_fspec_iterations(n: usize) {
    FSPEC_ITERATIONS.store(n, Ordering::Relaxed);
}

/// Sampling cap for `every` membership checks.
pub fn coll_check_limit() -> usize {
    COLL_CHECK_LIMIT.load(Ordering::Relaxed)
}

pub fn set_coll_check_limit(n: usize) {
    COLL_CHECK_LIMIT.store(n, Ordering::Relaxed);
}

/// Problem cap for collection explanations.
pub fn coll_error_limit() -> usize {
    COLL_ERROR_LIMIT.load(Ordering::Relaxed)
}

pub fn set_coll_error_limit(n: usize) {
    COLL_ERROR_LIMIT.store(n, Ordering::Relaxed);
}

/// The ambient generation seed.
pub fn seed() -> u64 {
    SEED.load(Ordering::Relaxed)
}

pub fn set_seed(seed: u64) {
    SEED.store(seed, Ordering::Relaxed);
}

/// Restore every knob to its default.
pub fn reset_config() {
    set_check_asserts(CHECK_ASSERTS_DEFAULT);
    set_recursion_limit(RECURSION_LIMIT_DEFAULT);
    set_fspec_iterations(FSPEC_ITERATIONS_DEFAULT);
    set_coll_check_limit(COLL_CHECK_LIMIT_DEFAULT);
    set_coll_error_limit(COLL_ERROR_LIMIT_DEFAULT);
    set_seed(DEFAULT_SEED);
}
