//! CPU affinity pinning for the capture and worker threads.
//!
//! Direct counterpart of `affinity_pin_self`/`affinity_get_num_cores`: pins
//! the *calling* thread, since every thread in this engine pins itself right
//! after spawning rather than being pinned from outside.
use std::mem;

use crate::error::NetError;

/// Returns the number of online CPUs, per `sysconf(_SC_NPROCESSORS_ONLN)`.
pub fn num_cores() -> Result<usize, NetError> {
    // SAFETY: sysconf has no preconditions; a negative return means the
    // query itself failed, not that cores are negative in count.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        return Err(NetError::Affinity(std::io::Error::last_os_error()));
    }
    Ok(n as usize)
}

/// Pins the calling thread to a single CPU core.
///
/// # Errors
/// Returns [`NetError::CoreOutOfRange`] if `core_id` is not an online core,
/// or [`NetError::Affinity`] if the kernel call itself fails.
pub fn pin_current_thread(core_id: usize) -> Result<(), NetError> {
    let cores = num_cores()?;
    if core_id >= cores {
        return Err(NetError::CoreOutOfRange { core_id, num_cores: cores });
    }

    // SAFETY: `cpu_set_t` is a plain bitmask struct; zeroing and setting a
    // single bit within its bounds is always defined.
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core_id, &mut set);

        let rc = libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            return Err(NetError::Affinity(std::io::Error::last_os_error()));
        }
    }

    tracing::debug!(core_id, "thread pinned");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_cores_is_at_least_one() {
        assert!(num_cores().unwrap() >= 1);
    }

    #[test]
    fn pinning_to_an_out_of_range_core_is_rejected() {
        let cores = num_cores().unwrap();
        assert!(matches!(
            pin_current_thread(cores + 1000),
            Err(NetError::CoreOutOfRange { .. })
        ));
    }

    #[test]
    fn pinning_to_core_zero_succeeds() {
        assert!(pin_current_thread(0).is_ok());
    }
}
