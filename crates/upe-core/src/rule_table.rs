//! Priority-ordered linear rule classifier over 5-tuple + prefix masks.
use crate::parser::{FlowKey, IpAddrKey};

/// What to do with a packet that matches a [`Rule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Drop,
    Fwd { out_ifindex: u32 },
}

/// An address plus its prefix mask, both tagged by IP version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskedAddr {
    V4 { addr: u32, mask: u32 },
    V6 { addr: [u8; 16], mask: [u8; 16] },
}

impl MaskedAddr {
    /// A wildcard (zero mask, zero address) of the given version.
    #[must_use]
    pub fn wildcard(ip_version: u8) -> Self {
        if ip_version == 6 {
            MaskedAddr::V6 { addr: [0; 16], mask: [0; 16] }
        } else {
            MaskedAddr::V4 { addr: 0, mask: 0 }
        }
    }

    /// Builds a masked address from an address and CIDR prefix length,
    /// normalizing the address to zero when the mask is zero (prefix 0).
    #[must_use]
    pub fn from_prefix_v4(addr: u32, prefix: u8) -> Self {
        let mask = ipv4_mask_from_prefix(prefix);
        MaskedAddr::V4 { addr: addr & mask, mask }
    }

    #[must_use]
    pub fn from_prefix_v6(addr: [u8; 16], prefix: u8) -> Self {
        let mask = ipv6_mask_from_prefix(prefix);
        let mut masked = [0u8; 16];
        for i in 0..16 {
            masked[i] = addr[i] & mask[i];
        }
        MaskedAddr::V6 { addr: masked, mask }
    }

    fn matches(&self, key: IpAddrKey) -> bool {
        match (self, key) {
            (MaskedAddr::V4 { addr, mask }, IpAddrKey::V4(k)) => (k & mask) == *addr,
            (MaskedAddr::V6 { addr, mask }, IpAddrKey::V6(k)) => {
                (0..16).all(|i| (k[i] & mask[i]) == addr[i])
            }
            _ => false,
        }
    }
}

/// IPv4 prefix → bitmask: `0xFFFFFFFF << (32 - p)` for `p` in `1..32`, all-ones
/// at `p == 32`, zero at `p == 0`. The shift-by-32 case is avoided explicitly
/// because it is undefined behavior for a 32-bit shift in the source this
/// table's algebra is modeled on.
#[must_use]
pub fn ipv4_mask_from_prefix(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        32.. => u32::MAX,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

/// IPv6 prefix → 16-byte bitmask: whole `0xFF` bytes for `prefix / 8`, one
/// partial byte for the remaining bits, zero bytes after.
#[must_use]
pub fn ipv6_mask_from_prefix(prefix: u8) -> [u8; 16] {
    let prefix = prefix.min(128) as usize;
    let mut mask = [0u8; 16];
    let full_bytes = prefix / 8;
    let remaining_bits = prefix % 8;
    for b in mask.iter_mut().take(full_bytes) {
        *b = 0xFF;
    }
    if remaining_bits > 0 && full_bytes < 16 {
        mask[full_bytes] = 0xFFu8 << (8 - remaining_bits);
    }
    mask
}

/// A classifier rule. `rule_id` is assigned at insertion and is immutable
/// afterward; ties at equal priority are broken by insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub priority: u32,
    pub rule_id: u32,
    pub ip_version: Option<u8>,
    pub src: MaskedAddr,
    pub dst: MaskedAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub action: Action,
}

impl Rule {
    fn matches(&self, key: &FlowKey) -> bool {
        if let Some(v) = self.ip_version {
            if v != key.ip_version {
                return false;
            }
        }
        if self.protocol != 0 && self.protocol != key.protocol {
            return false;
        }
        if self.src_port != 0 && self.src_port != key.src_port {
            return false;
        }
        if self.dst_port != 0 && self.dst_port != key.dst_port {
            return false;
        }
        if !self.src.matches(key.src_ip) {
            return false;
        }
        self.dst.matches(key.dst_ip)
    }
}

/// Spec for a rule to be added, before `rule_id` is assigned.
#[derive(Debug, Clone, Copy)]
pub struct RuleSpec {
    pub priority: u32,
    pub ip_version: Option<u8>,
    pub src: MaskedAddr,
    pub dst: MaskedAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub action: Action,
}

/// Priority-ordered rule table. Mutated only at startup; read-only on the
/// datapath (matches `spec.md` §3's "Mutated at startup only").
#[derive(Debug, Default)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    #[must_use]
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Appends a rule and re-sorts the table by `(priority asc, rule_id asc)`.
    pub fn add(&mut self, spec: RuleSpec) -> u32 {
        let rule_id = self.rules.len() as u32;
        self.rules.push(Rule {
            priority: spec.priority,
            rule_id,
            ip_version: spec.ip_version,
            src: spec.src,
            dst: spec.dst,
            src_port: spec.src_port,
            dst_port: spec.dst_port,
            protocol: spec.protocol,
            action: spec.action,
        });
        self.rules.sort_by_key(|r| (r.priority, r.rule_id));
        rule_id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns the highest-priority rule (lowest `(priority, rule_id)`) whose
    /// predicate holds for `key`, scanning in table order.
    #[must_use]
    pub fn match_key(&self, key: &FlowKey) -> Option<&Rule> {
        self.rules.iter().find(|r| r.matches(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::PROTO_TCP;

    fn key() -> FlowKey {
        FlowKey {
            ip_version: 4,
            src_ip: IpAddrKey::V4(0x0A000001),
            dst_ip: IpAddrKey::V4(0x0A000002),
            src_port: 1000,
            dst_port: 80,
            protocol: PROTO_TCP,
        }
    }

    fn wildcard_rule(priority: u32, action: Action) -> RuleSpec {
        RuleSpec {
            priority,
            ip_version: None,
            src: MaskedAddr::wildcard(4),
            dst: MaskedAddr::wildcard(4),
            src_port: 0,
            dst_port: 0,
            protocol: 0,
            action,
        }
    }

    #[test]
    fn s2_rule_ordering() {
        let mut table = RuleTable::new();
        table.add(wildcard_rule(100, Action::Drop));
        table.add(wildcard_rule(10, Action::Fwd { out_ifindex: 1 }));
        table.add(wildcard_rule(66, Action::Drop));

        let matched = table.match_key(&key()).unwrap();
        assert_eq!(matched.priority, 10);
        assert_eq!(matched.action, Action::Fwd { out_ifindex: 1 });
    }

    #[test]
    fn wildcard_matches_any_address() {
        let mut table = RuleTable::new();
        table.add(wildcard_rule(1, Action::Drop));
        assert!(table.match_key(&key()).is_some());
    }

    #[test]
    fn prefix_mask_match() {
        let mut table = RuleTable::new();
        table.add(RuleSpec {
            priority: 1,
            ip_version: Some(4),
            src: MaskedAddr::from_prefix_v4(0x0A000000, 24),
            dst: MaskedAddr::wildcard(4),
            src_port: 0,
            dst_port: 0,
            protocol: 0,
            action: Action::Drop,
        });
        assert!(table.match_key(&key()).is_some());

        let mut other = key();
        other.src_ip = IpAddrKey::V4(0x0B000001);
        assert!(table.match_key(&other).is_none());
    }

    #[test]
    fn ipv4_prefix_masks() {
        assert_eq!(ipv4_mask_from_prefix(0), 0);
        assert_eq!(ipv4_mask_from_prefix(32), u32::MAX);
        assert_eq!(ipv4_mask_from_prefix(24), 0xFFFF_FF00);
    }

    #[test]
    fn ipv6_prefix_masks() {
        let mask = ipv6_mask_from_prefix(20);
        assert_eq!(mask[0], 0xFF);
        assert_eq!(mask[1], 0xFF);
        assert_eq!(mask[2], 0xF0);
        assert_eq!(mask[3], 0);
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let mut table = RuleTable::new();
        let first = table.add(wildcard_rule(5, Action::Drop));
        let second = table.add(wildcard_rule(5, Action::Fwd { out_ifindex: 9 }));
        assert!(first < second);
        let matched = table.match_key(&key()).unwrap();
        assert_eq!(matched.rule_id, first);
    }
}
