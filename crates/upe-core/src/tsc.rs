//! Process-wide TSC calibration, set once at process init (`spec.md` §5).
//!
//! Used only to produce the RX cycle-counter timestamp stored in
//! [`crate::buffer::PacketBuffer`]; nothing on the datapath reads the
//! calibration ratio itself, so a coarse one-shot measurement is enough.
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static CYCLES_PER_NS: OnceLock<f64> = OnceLock::new();

/// Measures and caches the TSC-cycles-per-nanosecond ratio by bracketing a
/// short sleep with a wall clock and a cycle-counter read.
///
/// Idempotent: the first call performs the measurement (costing ~50ms); every
/// later call returns the cached ratio.
pub fn calibrate() -> f64 {
    *CYCLES_PER_NS.get_or_init(|| {
        let wall_start = Instant::now();
        let tsc_start = read_cycles();
        std::thread::sleep(Duration::from_millis(50));
        let tsc_end = read_cycles();
        let elapsed_ns = wall_start.elapsed().as_nanos().max(1) as f64;
        (tsc_end.wrapping_sub(tsc_start)) as f64 / elapsed_ns
    })
}

/// Returns a monotonically-increasing cycle count for RX timestamping.
///
/// On x86_64 this is the raw TSC (`RDTSC`); elsewhere it falls back to a
/// nanosecond monotonic clock, since the timestamp is opaque outside of
/// latency measurement tooling that this engine does not ship (`spec.md`
/// §1 excludes "the benchmark harnesses").
#[must_use]
pub fn read_cycles() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: RDTSC is available on every x86_64 target this crate
        // supports; it has no memory or aliasing preconditions.
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::time::SystemTime;
        SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_are_monotonic_nondecreasing_over_a_short_span() {
        let a = read_cycles();
        for _ in 0..1000 {
            std::hint::spin_loop();
        }
        let b = read_cycles();
        assert!(b >= a);
    }

    #[test]
    fn calibration_is_positive_and_stable_across_calls() {
        let first = calibrate();
        assert!(first > 0.0);
        assert_eq!(first, calibrate());
    }
}
