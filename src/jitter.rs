//! Symmetric jitter, applied on top of a computed base delay.
//!
//! Spec formula (§4.1): `jitter = base × jitterFraction × (U(0,1) − 0.5)`,
//! i.e. jitter is symmetric around the base delay rather than the teacher's
//! one-sided `Full`/`Equal`/`Decorrelated` strategies.

use rand::Rng;
use std::time::Duration;

/// Apply symmetric jitter to `base`, using the thread-local RNG.
pub fn apply(base: Duration, jitter_fraction: f64) -> Duration {
    let mut rng = rand::thread_rng();
    apply_with_rng(base, jitter_fraction, &mut rng)
}

/// Apply symmetric jitter with an injected RNG, for deterministic tests.
pub fn apply_with_rng<R: Rng>(base: Duration, jitter_fraction: f64, rng: &mut R) -> Duration {
    if jitter_fraction <= 0.0 {
        return base;
    }
    let u: f64 = rng.gen_range(0.0..1.0);
    let signed_fraction = jitter_fraction * (u - 0.5);
    let base_millis = base.as_secs_f64() * 1000.0;
    let jittered_millis = base_millis + base_millis * signed_fraction;
    Duration::from_millis(jittered_millis.max(0.0) as u64)
}
