use rand::Rng;
use std::time::Duration;

/// Returns `d` moved by a uniformly distributed offset of at most `pct * d`.
///
/// `pct` is clamped to `[0, 1]`.
pub fn jitter(d: Duration, pct: f64) -> Duration {
    if d.is_zero() || pct <= 0.0 || !pct.is_finite() {
        return d;
    }
    let base = d.as_secs_f64();
    let delta = base * pct.min(1.0);
    let offset = rand::thread_rng().gen_range(-delta..=delta);
    Duration::from_secs_f64((base + offset).max(0.0))
}
