//! Frame sources: live `AF_PACKET` ingress and offline pcap-file replay.
//!
//! Both implement [`upe_core::FrameSource`], the trait `upe_core::dispatch`
//! drives; this module owns only how bytes are obtained, not what happens to
//! them afterward.
use std::fs::File;
use std::io::{BufReader, Read};
use std::mem;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use upe_core::buffer::BUFFER_CAPACITY;
use upe_core::FrameSource;

use crate::error::NetError;

const SOL_PACKET: libc::c_int = 263;
const PACKET_IGNORE_OUTGOING: libc::c_int = 23;

/// Live ingress over a raw `AF_PACKET` socket bound to one interface.
///
/// Direction is restricted to inbound only (`PACKET_IGNORE_OUTGOING`), per
/// `spec.md` §4.7: "Reads direction is restricted to 'in' for live mode to
/// prevent processing the engine's own egress."
pub struct LiveCapture {
    fd: RawFd,
}

impl LiveCapture {
    /// Opens and binds an `AF_PACKET`/`SOCK_RAW` socket on `iface`.
    ///
    /// # Errors
    /// [`NetError::InterfaceNotFound`], [`NetError::SocketCreation`], or
    /// [`NetError::Bind`].
    pub fn new(iface: &str) -> Result<Self, NetError> {
        let cname = std::ffi::CString::new(iface).map_err(|_| NetError::InterfaceNotFound(iface.to_string()))?;
        // SAFETY: `cname` lives for the duration of this call.
        let ifindex = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if ifindex == 0 {
            return Err(NetError::InterfaceNotFound(iface.to_string()));
        }

        let proto = (libc::ETH_P_ALL as u16).to_be() as i32;
        // SAFETY: plain syscall, no pointer arguments.
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, proto) };
        if fd < 0 {
            return Err(NetError::SocketCreation("AF_PACKET/SOCK_RAW", std::io::Error::last_os_error()));
        }

        // SAFETY: `addr` is a valid, fully-initialized sockaddr_ll for the
        // duration of the bind call.
        unsafe {
            let mut addr: libc::sockaddr_ll = mem::zeroed();
            addr.sll_family = libc::AF_PACKET as u16;
            addr.sll_protocol = proto as u16;
            addr.sll_ifindex = ifindex as i32;

            let rc = libc::bind(
                fd,
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_ll>() as u32,
            );
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(NetError::Bind(iface.to_string(), err));
            }

            let ignore_outgoing: libc::c_int = 1;
            libc::setsockopt(
                fd,
                SOL_PACKET,
                PACKET_IGNORE_OUTGOING,
                std::ptr::addr_of!(ignore_outgoing).cast(),
                mem::size_of::<libc::c_int>() as u32,
            );
        }

        tracing::info!(iface, "live capture bound");
        Ok(Self { fd })
    }

    fn set_recv_timeout(&self, timeout: Duration) {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: libc::suseconds_t::from(timeout.subsec_micros()),
        };
        // SAFETY: `tv` is valid for the duration of the call.
        unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                std::ptr::addr_of!(tv).cast(),
                mem::size_of::<libc::timeval>() as u32,
            );
        }
    }
}

impl FrameSource for LiveCapture {
    fn recv(&mut self, buf: &mut [u8; BUFFER_CAPACITY], poll_timeout: Duration) -> Option<usize> {
        self.set_recv_timeout(poll_timeout);
        // SAFETY: `buf` is a valid, writable region of `BUFFER_CAPACITY`
        // bytes for the duration of the call.
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n <= 0 {
            None
        } else {
            Some(n as usize)
        }
    }
}

impl Drop for LiveCapture {
    fn drop(&mut self) {
        // SAFETY: `fd` is owned exclusively by this struct.
        unsafe {
            libc::close(self.fd);
        }
    }
}

const PCAP_MAGIC_LE: u32 = 0xa1b2_c3d4;
const PCAP_MAGIC_SWAPPED: u32 = 0xd4c3_b2a1;
const PCAP_GLOBAL_HEADER_LEN: usize = 24;
const PCAP_RECORD_HEADER_LEN: usize = 16;

/// Offline replay from a classic pcap-format capture file.
///
/// Implemented as a direct binary reader rather than a `libpcap` binding: the
/// file format (a 24-byte global header, then `{ts_sec, ts_usec, incl_len,
/// orig_len}` + payload records) is small, fixed, and fully specified, so
/// matches the original's `pcap_open_live`/`pcap_loop` reader without an
/// external C library dependency.
pub struct PcapReplay {
    reader: BufReader<File>,
    swapped: bool,
    path: PathBuf,
}

impl PcapReplay {
    /// Opens `path` and validates its global header.
    ///
    /// # Errors
    /// [`NetError::PcapOpen`] if the file cannot be opened, or
    /// [`NetError::PcapMalformed`] if the magic number or header length is
    /// wrong.
    pub fn open(path: &Path) -> Result<Self, NetError> {
        let file = File::open(path).map_err(|e| NetError::PcapOpen(path.to_path_buf(), e))?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; PCAP_GLOBAL_HEADER_LEN];
        reader
            .read_exact(&mut header)
            .map_err(|_| NetError::PcapMalformed(path.to_path_buf()))?;

        let magic_le = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let swapped = match magic_le {
            PCAP_MAGIC_LE => false,
            PCAP_MAGIC_SWAPPED => true,
            _ => return Err(NetError::PcapMalformed(path.to_path_buf())),
        };

        tracing::info!(path = %path.display(), "offline replay opened");
        Ok(Self { reader, swapped, path: path.to_path_buf() })
    }

    fn read_u32(&self, bytes: [u8; 4]) -> u32 {
        if self.swapped {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        }
    }
}

impl FrameSource for PcapReplay {
    fn recv(&mut self, buf: &mut [u8; BUFFER_CAPACITY], _poll_timeout: Duration) -> Option<usize> {
        let mut record_header = [0u8; PCAP_RECORD_HEADER_LEN];
        self.reader.read_exact(&mut record_header).ok()?;

        let incl_len = self.read_u32([record_header[8], record_header[9], record_header[10], record_header[11]]) as usize;
        if incl_len > buf.len() {
            tracing::warn!(path = %self.path.display(), incl_len, "pcap record exceeds buffer capacity, skipping");
            let mut sink = vec![0u8; incl_len];
            self.reader.read_exact(&mut sink).ok();
            return None;
        }

        if self.reader.read_exact(&mut buf[..incl_len]).is_err() {
            return None;
        }
        Some(incl_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_minimal_pcap(path: &Path, frames: &[&[u8]]) {
        let mut file = File::create(path).unwrap();
        file.write_all(&PCAP_MAGIC_LE.to_le_bytes()).unwrap();
        file.write_all(&2u16.to_le_bytes()).unwrap();
        file.write_all(&4u16.to_le_bytes()).unwrap();
        file.write_all(&0i32.to_le_bytes()).unwrap();
        file.write_all(&0u32.to_le_bytes()).unwrap();
        file.write_all(&65535u32.to_le_bytes()).unwrap();
        file.write_all(&1u32.to_le_bytes()).unwrap();
        for frame in frames {
            file.write_all(&0u32.to_le_bytes()).unwrap();
            file.write_all(&0u32.to_le_bytes()).unwrap();
            file.write_all(&(frame.len() as u32).to_le_bytes()).unwrap();
            file.write_all(&(frame.len() as u32).to_le_bytes()).unwrap();
            file.write_all(frame).unwrap();
        }
    }

    #[test]
    fn replays_frames_in_order_then_ends() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("upe_test_{}.pcap", std::process::id()));
        write_minimal_pcap(&path, &[&[1, 2, 3], &[4, 5]]);

        let mut replay = PcapReplay::open(&path).unwrap();
        let mut buf = [0u8; BUFFER_CAPACITY];

        let n1 = replay.recv(&mut buf, Duration::ZERO).unwrap();
        assert_eq!(&buf[..n1], &[1, 2, 3]);

        let n2 = replay.recv(&mut buf, Duration::ZERO).unwrap();
        assert_eq!(&buf[..n2], &[4, 5]);

        assert!(replay.recv(&mut buf, Duration::ZERO).is_none());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_file_with_bad_magic() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("upe_bad_{}.pcap", std::process::id()));
        std::fs::write(&path, [0u8; 24]).unwrap();
        assert!(matches!(PcapReplay::open(&path), Err(NetError::PcapMalformed(_))));
        std::fs::remove_file(&path).ok();
    }
}
