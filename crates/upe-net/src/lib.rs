//! Syscall boundary of the userspace packet engine: raw `AF_PACKET` RX/TX,
//! offline pcap replay, and CPU affinity pinning.
//!
//! `upe-core` never touches a socket or a thread's affinity mask directly;
//! it only depends on the [`upe_core::FrameSource`] and
//! [`upe_core::FrameSender`] traits this crate implements.

pub mod affinity;
pub mod capture;
pub mod error;
pub mod tx;

pub use affinity::{num_cores, pin_current_thread};
pub use capture::{LiveCapture, PcapReplay};
pub use error::NetError;
pub use tx::{AfPacketSender, MAX_BATCH};

/// Resolves an interface name to its kernel `ifindex`.
///
/// Used to bind a rule's `out_iface` (parsed as a plain string by
/// `upe-config`, which has no socket access of its own) to the numeric
/// `ifindex` that `upe_core::rule_table::Action::Fwd` carries.
///
/// # Errors
/// [`NetError::InterfaceNotFound`] if the name does not resolve.
pub fn interface_index(name: &str) -> Result<u32, NetError> {
    let cname = std::ffi::CString::new(name).map_err(|_| NetError::InterfaceNotFound(name.to_string()))?;
    // SAFETY: `cname` lives for the duration of this call.
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        return Err(NetError::InterfaceNotFound(name.to_string()));
    }
    Ok(idx)
}

const SIOCGIFHWADDR: libc::c_ulong = 0x8927;

#[repr(C)]
struct Ifreq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_hwaddr: libc::sockaddr,
}

/// Reads the MAC address of `iface` via `SIOCGIFHWADDR`, used to stamp the
/// Ethernet source address on forwarded frames.
///
/// # Errors
/// [`NetError::InterfaceNotFound`] if the name is too long or the ioctl
/// fails; [`NetError::SocketCreation`] if the helper socket cannot be
/// opened.
pub fn hardware_address(iface: &str) -> Result<[u8; 6], NetError> {
    let cname = std::ffi::CString::new(iface).map_err(|_| NetError::InterfaceNotFound(iface.to_string()))?;
    let name_bytes = cname.as_bytes_with_nul();
    if name_bytes.len() > libc::IFNAMSIZ {
        return Err(NetError::InterfaceNotFound(iface.to_string()));
    }

    // SAFETY: zeroing is a valid initial value for every field of `Ifreq`.
    let mut req: Ifreq = unsafe { std::mem::zeroed() };
    for (i, &b) in name_bytes.iter().enumerate() {
        req.ifr_name[i] = b as libc::c_char;
    }

    // SAFETY: plain UDP/IP socket used only as an ioctl handle, never
    // connected or sent on.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(NetError::SocketCreation("AF_INET/SOCK_DGRAM", std::io::Error::last_os_error()));
    }

    // SAFETY: `req` is a valid, fully-initialized `Ifreq` for the duration
    // of the call; the kernel writes the hardware address back into it.
    let rc = unsafe { libc::ioctl(fd, SIOCGIFHWADDR, std::ptr::addr_of_mut!(req)) };
    // SAFETY: `fd` is owned solely by this function.
    unsafe {
        libc::close(fd);
    }
    if rc != 0 {
        return Err(NetError::InterfaceNotFound(iface.to_string()));
    }

    let mut mac = [0u8; 6];
    for (i, slot) in mac.iter_mut().enumerate() {
        *slot = req.ifr_hwaddr.sa_data[i] as u8;
    }
    Ok(mac)
}
