//! Symmetric flow hash for software receive-side scaling.
use crate::parser::{FlowKey, IpAddrKey};

/// Computes a 32-bit hash of `key` that is invariant under swapping the
/// source and destination endpoints, so both directions of a flow land on
/// the same worker ring.
///
/// XOR-folds every 32-bit word of both addresses together before folding in
/// the ports and protocol; because XOR is commutative, a src/dst swap is
/// absorbed entirely. Do not hash each endpoint separately and then combine
/// them asymmetrically (e.g. with subtraction or concatenation) — that would
/// break the symmetry property.
#[must_use]
pub fn flow_hash(key: &FlowKey) -> u32 {
    let addr_fold = fold_addr(key.src_ip) ^ fold_addr(key.dst_ip);
    addr_fold ^ u32::from(key.src_port) ^ u32::from(key.dst_port) ^ u32::from(key.protocol)
}

fn fold_addr(addr: IpAddrKey) -> u32 {
    match addr {
        IpAddrKey::V4(a) => a,
        IpAddrKey::V6(bytes) => {
            let mut acc = 0u32;
            for word in bytes.chunks_exact(4) {
                acc ^= u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
            }
            acc
        }
    }
}

/// Selects a ring index for `key` via `flow_hash(key) & (ring_count - 1)`.
///
/// `ring_count` must be a power of two.
#[must_use]
pub fn ring_index(key: &FlowKey, ring_count: usize) -> usize {
    debug_assert!(ring_count.is_power_of_two());
    (flow_hash(key) as usize) & (ring_count - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{PROTO_TCP};

    fn key(src_ip: u32, src_port: u16, dst_ip: u32, dst_port: u16) -> FlowKey {
        FlowKey {
            ip_version: 4,
            src_ip: IpAddrKey::V4(src_ip),
            dst_ip: IpAddrKey::V4(dst_ip),
            src_port,
            dst_port,
            protocol: PROTO_TCP,
        }
    }

    #[test]
    fn s6_symmetry_and_sensitivity() {
        let a = key(0x0A800001, 12121, 0x0A800002, 443);
        let b = key(0x0A800002, 443, 0x0A800001, 12121);
        assert_eq!(flow_hash(&a), flow_hash(&b));

        let mut c = a;
        c.src_ip = IpAddrKey::V4(0x0A800003);
        assert_ne!(flow_hash(&a), flow_hash(&c));
    }

    #[test]
    fn symmetry_holds_for_ipv6() {
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src[15] = 1;
        dst[15] = 2;
        let a = FlowKey {
            ip_version: 6,
            src_ip: IpAddrKey::V6(src),
            dst_ip: IpAddrKey::V6(dst),
            src_port: 111,
            dst_port: 222,
            protocol: PROTO_TCP,
        };
        let b = a.swap_endpoints();
        assert_eq!(flow_hash(&a), flow_hash(&b));
    }

    #[test]
    fn ring_index_masks_correctly() {
        let k = key(1, 1, 2, 2);
        let idx = ring_index(&k, 8);
        assert!(idx < 8);
    }
}
