//! Raw AF_PACKET egress, implementing [`upe_core::FrameSender`].
//!
//! The batching *policy* (when to flush, how to account for shortfall)
//! belongs to `upe_core::worker`; this module is only the `sendto`/
//! `sendmmsg` mechanics, the direct counterpart of the original `tx_init`/
//! `tx_send` pair.
use std::ffi::CString;
use std::mem;
use std::os::unix::io::RawFd;

use upe_core::FrameSender;

use crate::error::NetError;

/// Implementation cap on frames accepted by one `send_batch` call
/// (`spec.md` §4.9: "Truncates at an implementation cap (64)").
pub const MAX_BATCH: usize = 64;

/// A bound raw-socket egress interface.
pub struct AfPacketSender {
    fd: RawFd,
    ifindex: i32,
}

impl AfPacketSender {
    /// Opens an `AF_PACKET`/`SOCK_RAW` socket bound for transmit on
    /// `out_iface`.
    ///
    /// # Errors
    /// [`NetError::InterfaceNotFound`] if the interface name does not
    /// resolve; [`NetError::SocketCreation`] if the socket syscall fails.
    pub fn new(out_iface: &str) -> Result<Self, NetError> {
        let cname = CString::new(out_iface).map_err(|_| NetError::InterfaceNotFound(out_iface.to_string()))?;
        // SAFETY: `cname` is a valid, nul-terminated C string for the
        // duration of this call.
        let ifindex = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if ifindex == 0 {
            return Err(NetError::InterfaceNotFound(out_iface.to_string()));
        }

        // SAFETY: plain syscall with no pointer arguments beyond the
        // constants above.
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, (libc::ETH_P_ALL as u16).to_be() as i32) };
        if fd < 0 {
            return Err(NetError::SocketCreation("AF_PACKET/SOCK_RAW", std::io::Error::last_os_error()));
        }

        Ok(Self { fd, ifindex: ifindex as i32 })
    }

    fn sockaddr(&self) -> libc::sockaddr_ll {
        // SAFETY: `sockaddr_ll` is a plain C struct; zeroing is a valid
        // initial value for every field.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_ifindex = self.ifindex;
        addr.sll_halen = 6; // ETH_ALEN
        addr
    }
}

impl FrameSender for AfPacketSender {
    fn send_batch(&self, frames: &[&[u8]]) -> usize {
        if frames.is_empty() {
            return 0;
        }
        let frames = &frames[..frames.len().min(MAX_BATCH)];
        let addr = self.sockaddr();

        let mut iovecs: Vec<libc::iovec> = frames
            .iter()
            .map(|frame| libc::iovec {
                iov_base: frame.as_ptr().cast_mut().cast(),
                iov_len: frame.len(),
            })
            .collect();

        let mut msgs: Vec<libc::mmsghdr> = iovecs
            .iter_mut()
            .map(|iov| libc::mmsghdr {
                msg_hdr: libc::msghdr {
                    msg_name: std::ptr::addr_of!(addr).cast_mut().cast(),
                    msg_namelen: mem::size_of::<libc::sockaddr_ll>() as u32,
                    msg_iov: iov as *mut libc::iovec,
                    msg_iovlen: 1,
                    msg_control: std::ptr::null_mut(),
                    msg_controllen: 0,
                    msg_flags: 0,
                },
                msg_len: 0,
            })
            .collect();

        // SAFETY: `msgs` and the `iovec`s it points into are valid and live
        // for the duration of this call; `addr` outlives the call too.
        let sent = unsafe { libc::sendmmsg(self.fd, msgs.as_mut_ptr(), msgs.len() as u32, 0) };
        sent.max(0) as usize
    }
}

impl Drop for AfPacketSender {
    fn drop(&mut self) {
        // SAFETY: `fd` is owned exclusively by this struct.
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_interface_is_rejected() {
        let result = AfPacketSender::new("no-such-iface-xyz");
        assert!(matches!(result, Err(NetError::InterfaceNotFound(_))));
    }
}
