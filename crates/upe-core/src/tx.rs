//! The interface the worker pipeline consumes for egress.
//!
//! The batching policy (which frames to send, when, and how to account for
//! shortfall) lives in [`crate::worker`]; the syscall-level mechanics of
//! actually putting bytes on a wire are an external collaborator per
//! `spec.md` §1, implemented outside this crate (see `upe-net::tx`).

/// Transmits a batch of raw L2 frames on a bound egress interface in a
/// single kernel entry.
///
/// Returns the number of frames the kernel accepted; a return less than
/// `frames.len()` is a partial-success shortfall, not an error. A hard error
/// (socket gone, interface down) is reported by returning 0.
pub trait FrameSender: Send + Sync {
    fn send_batch(&self, frames: &[&[u8]]) -> usize;
}

impl<T: FrameSender + ?Sized> FrameSender for std::sync::Arc<T> {
    fn send_batch(&self, frames: &[&[u8]]) -> usize {
        (**self).send_batch(frames)
    }
}
