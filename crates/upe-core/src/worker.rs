//! The worker pipeline: pops bursts, handles control packets, parses,
//! classifies, rewrites, batches, and emits TX.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::buffer::BufferHandle;
use crate::checksum::recompute_ipv4_checksum;
use crate::neighbor::{L1Cache, MacAddr, NeighborTable};
use crate::parser::{self, FlowKey, IpAddrKey, ETHERTYPE_ARP, PROTO_ICMPV6};
use crate::pool::PoolCache;
use crate::ring::Ring;
use crate::rule_table::{Action, RuleTable};
use crate::stats::{RuleStatsTable, WorkerStats};
use crate::tx::FrameSender;

/// Packets popped from the ring and frames sent to TX in one shot.
pub const BURST_SIZE: usize = 32;
const IDLE_SLEEP: Duration = Duration::from_micros(1);

const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETH_HEADER_LEN: usize = 14;
const IPV6_HEADER_LEN: usize = 40;
const ICMPV6_NDP_FIXED_LEN: usize = 24; // type/code/cksum(4) + reserved/flags(4) + target(16)
const ND_SOL: u8 = 135;
const ND_ADV: u8 = 136;
const ND_OPT_SOURCE_LL: u8 = 1;
const ND_OPT_TARGET_LL: u8 = 2;

enum ControlPacket {
    Arp,
    Icmpv6Ndp,
}

fn detect_control(frame: &[u8]) -> Option<ControlPacket> {
    let ethertype = parser::peek_ethertype(frame).ok()?;
    if ethertype == ETHERTYPE_ARP {
        return Some(ControlPacket::Arp);
    }
    if ethertype == ETHERTYPE_IPV6 {
        let l3 = frame.get(ETH_HEADER_LEN..)?;
        if l3.len() >= IPV6_HEADER_LEN && l3[6] == PROTO_ICMPV6 {
            let icmp = l3.get(IPV6_HEADER_LEN..)?;
            if icmp.len() >= 4 && matches!(icmp[0], ND_SOL | ND_ADV) {
                return Some(ControlPacket::Icmpv6Ndp);
            }
        }
    }
    None
}

/// One worker's processing loop over its dedicated RX ring.
///
/// Owns no mutable state shared with any other worker: its ring, TX batch,
/// and L1 caches are private; the rule table and neighbor tables are
/// read-mostly shared references.
pub struct Worker<S: FrameSender> {
    ring: Arc<Ring<BufferHandle>>,
    cache: PoolCache,
    rule_table: Arc<RuleTable>,
    arp_table: Arc<NeighborTable<u32>>,
    ndp_table: Arc<NeighborTable<[u8; 16]>>,
    rule_stats: Arc<RuleStatsTable>,
    stats: Arc<WorkerStats>,
    sender: S,
    own_mac: MacAddr,
    stop_flag: Arc<AtomicBool>,
    arp_l1: L1Cache<u32>,
    ndp_l1: L1Cache<[u8; 16]>,
    tx_batch: Vec<BufferHandle>,
}

impl<S: FrameSender> Worker<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ring: Arc<Ring<BufferHandle>>,
        cache: PoolCache,
        rule_table: Arc<RuleTable>,
        arp_table: Arc<NeighborTable<u32>>,
        ndp_table: Arc<NeighborTable<[u8; 16]>>,
        rule_stats: Arc<RuleStatsTable>,
        stats: Arc<WorkerStats>,
        sender: S,
        own_mac: MacAddr,
        stop_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            ring,
            cache,
            rule_table,
            arp_table,
            ndp_table,
            rule_stats,
            stats,
            sender,
            own_mac,
            stop_flag,
            arp_l1: L1Cache::new(),
            ndp_l1: L1Cache::new(),
            tx_batch: Vec::with_capacity(BURST_SIZE),
        }
    }

    /// Runs BURST_WAIT → PROCESS → DRAIN_TX until the global stop flag is set
    /// and the ring has drained to empty.
    pub fn run(&mut self) {
        let mut burst = [BufferHandle::default(); BURST_SIZE];
        loop {
            let n = self.ring.pop_burst(&mut burst);
            if n == 0 {
                if self.stop_flag.load(Ordering::Relaxed) && self.ring.is_empty() {
                    break;
                }
                thread::sleep(IDLE_SLEEP);
                continue;
            }

            for &handle in &burst[..n] {
                self.stats.inc_in();
                self.process_packet(handle);
            }
            self.drain_tx();
        }
        self.drain_tx();
    }

    fn process_packet(&mut self, handle: BufferHandle) {
        // SAFETY: the worker holds exclusive ownership of `handle`, having
        // just popped it from its dedicated consumer-side ring.
        let control = detect_control(unsafe { self.cache.pool().get(handle) }.as_slice());
        match control {
            Some(ControlPacket::Arp) => {
                self.learn_arp(handle);
                self.free(handle);
                return;
            }
            Some(ControlPacket::Icmpv6Ndp) => {
                self.learn_ndp(handle);
                self.free(handle);
                return;
            }
            None => {}
        }

        let key = parser::parse_flow_key(unsafe { self.cache.pool().get(handle) }.as_slice());
        let key = match key {
            Ok(key) => {
                self.stats.inc_parsed();
                key
            }
            Err(_) => {
                self.stats.add_dropped(1);
                self.free(handle);
                return;
            }
        };

        let rule = match self.rule_table.match_key(&key) {
            Some(rule) => {
                self.stats.inc_matched();
                *rule
            }
            None => {
                self.stats.add_dropped(1);
                self.free(handle);
                return;
            }
        };

        let frame_len = unsafe { self.cache.pool().get(handle) }.len();
        self.rule_stats.record(rule.rule_id, frame_len as u64);

        match rule.action {
            Action::Drop => {
                self.stats.add_dropped(1);
                self.free(handle);
            }
            Action::Fwd { out_ifindex } => {
                if self.forward(handle, &key, out_ifindex) {
                    self.tx_batch.push(handle);
                } else {
                    self.stats.add_dropped(1);
                    self.free(handle);
                }
            }
        }
    }

    /// L3 rewrite (TTL/hop_limit decrement, IPv4 checksum recompute) and L2
    /// destination-MAC rewrite. Returns `false` if the packet must be
    /// dropped (TTL/hop_limit exhausted).
    fn forward(&mut self, handle: BufferHandle, key: &FlowKey, _out_ifindex: u32) -> bool {
        let survives = {
            // SAFETY: exclusive ownership, as above.
            let buf = unsafe { self.cache.pool().get_mut(handle) };
            let frame = buf.as_mut_slice();
            if frame.len() < ETH_HEADER_LEN {
                false
            } else {
                let l3 = &mut frame[ETH_HEADER_LEN..];
                match key.ip_version {
                    4 => {
                        if l3.len() < 20 || l3[8] <= 1 {
                            false
                        } else {
                            l3[8] -= 1;
                            let ihl = usize::from(l3[0] & 0x0F) * 4;
                            if ihl < 20 || ihl > l3.len() {
                                false
                            } else {
                                recompute_ipv4_checksum(&mut l3[..ihl]);
                                true
                            }
                        }
                    }
                    6 => {
                        if l3.len() < IPV6_HEADER_LEN || l3[7] <= 1 {
                            false
                        } else {
                            l3[7] -= 1;
                            true
                        }
                    }
                    _ => false,
                }
            }
        };
        if !survives {
            return false;
        }

        // Resolved with a fully released borrow of `self.cache`, since
        // `resolve_mac` takes `&mut self` for its L1 cache.
        if let Some(mac) = self.resolve_mac(key) {
            // SAFETY: exclusive ownership, as above.
            let buf = unsafe { self.cache.pool().get_mut(handle) };
            let frame = buf.as_mut_slice();
            frame[0..6].copy_from_slice(&mac);
            frame[6..12].copy_from_slice(&self.own_mac);
        }
        true
    }

    fn resolve_mac(&mut self, key: &FlowKey) -> Option<MacAddr> {
        match key.dst_ip {
            IpAddrKey::V4(ip) => {
                if let Some(mac) = self.arp_l1.get(ip) {
                    return Some(mac);
                }
                let mac = self.arp_table.get(ip);
                if let Some(mac) = mac {
                    self.arp_l1.set(ip, mac);
                }
                mac
            }
            IpAddrKey::V6(ip) => {
                if let Some(mac) = self.ndp_l1.get(ip) {
                    return Some(mac);
                }
                let mac = self.ndp_table.get(ip);
                if let Some(mac) = mac {
                    self.ndp_l1.set(ip, mac);
                }
                mac
            }
        }
    }

    fn learn_arp(&mut self, handle: BufferHandle) {
        // SAFETY: exclusive ownership, as above.
        let buf = unsafe { self.cache.pool().get(handle) };
        let frame = buf.as_slice();
        if frame.len() < ETH_HEADER_LEN + 28 {
            return;
        }
        let body = &frame[ETH_HEADER_LEN..ETH_HEADER_LEN + 28];
        let hw_type = u16::from_be_bytes([body[0], body[1]]);
        let proto_type = u16::from_be_bytes([body[2], body[3]]);
        let hlen = body[4];
        let plen = body[5];
        if hw_type != 1 || proto_type != 0x0800 || hlen != 6 || plen != 4 {
            return;
        }
        let mut sender_hw = [0u8; 6];
        sender_hw.copy_from_slice(&body[8..14]);
        let sender_ip = u32::from_be_bytes([body[14], body[15], body[16], body[17]]);
        self.arp_table.update(sender_ip, sender_hw);
    }

    fn learn_ndp(&mut self, handle: BufferHandle) {
        // SAFETY: exclusive ownership, as above.
        let buf = unsafe { self.cache.pool().get(handle) };
        let frame = buf.as_slice();
        if frame.len() < ETH_HEADER_LEN + IPV6_HEADER_LEN {
            return;
        }
        let l3 = &frame[ETH_HEADER_LEN..];
        let ip6_src: [u8; 16] = l3[8..24].try_into().expect("16-byte slice");
        let Some(icmp) = l3.get(IPV6_HEADER_LEN..) else {
            return;
        };
        if icmp.len() < ICMPV6_NDP_FIXED_LEN {
            return;
        }
        let icmp_type = icmp[0];
        let target: [u8; 16] = icmp[8..24].try_into().expect("16-byte slice");

        let mut opt_off = ICMPV6_NDP_FIXED_LEN;
        while opt_off + 8 <= icmp.len() {
            let opt_type = icmp[opt_off];
            let opt_len_units = icmp[opt_off + 1];
            if opt_len_units == 0 {
                break;
            }
            let opt_bytes = usize::from(opt_len_units) * 8;
            if opt_off + opt_bytes > icmp.len() {
                break;
            }
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&icmp[opt_off + 2..opt_off + 8]);
            match (icmp_type, opt_type) {
                (ND_SOL, ND_OPT_SOURCE_LL) => self.ndp_table.update(ip6_src, mac),
                (ND_ADV, ND_OPT_TARGET_LL) => self.ndp_table.update(target, mac),
                _ => {}
            }
            opt_off += opt_bytes;
        }
    }

    fn free(&mut self, handle: BufferHandle) {
        self.cache.free(handle);
    }

    fn drain_tx(&mut self) {
        if self.tx_batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.tx_batch);
        let pool = Arc::clone(self.cache.pool());
        // SAFETY: every handle in `batch` is still exclusively owned by this
        // worker; none has been freed since it was pushed.
        let frames: Vec<&[u8]> = batch
            .iter()
            .map(|&h| unsafe { pool.get(h) }.as_slice())
            .collect();

        let sent = self.sender.send_batch(&frames);
        self.stats.add_forwarded(sent as u64);
        let shortfall = batch.len() - sent.min(batch.len());
        self.stats.add_dropped(shortfall as u64);
        drop(frames);

        for &handle in &batch {
            self.free(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::rule_table::{MaskedAddr, RuleSpec, RuleTable};
    use std::sync::Mutex;

    struct CollectingSender {
        sent_count: Mutex<usize>,
    }

    impl FrameSender for CollectingSender {
        fn send_batch(&self, frames: &[&[u8]]) -> usize {
            *self.sent_count.lock().unwrap() += frames.len();
            frames.len()
        }
    }

    fn udp_frame(ttl: u8) -> Vec<u8> {
        let mut frame = vec![0u8; 14];
        frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[8] = ttl;
        ip[9] = 17; // UDP
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);
        let mut udp = vec![0u8; 8];
        udp[0..2].copy_from_slice(&1111u16.to_be_bytes());
        udp[2..4].copy_from_slice(&2222u16.to_be_bytes());
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&udp);
        frame
    }

    fn build_worker(
        sender: CollectingSender,
        action: Action,
    ) -> (Worker<CollectingSender>, Arc<WorkerStats>, Arc<BufferPool>) {
        let pool = Arc::new(BufferPool::new(8).unwrap());
        let mut cache = PoolCache::new(Arc::clone(&pool));
        let ring = Arc::new(Ring::<BufferHandle>::new(4).unwrap());

        let mut table = RuleTable::new();
        table.add(RuleSpec {
            priority: 1,
            ip_version: Some(4),
            src: MaskedAddr::wildcard(4),
            dst: MaskedAddr::wildcard(4),
            src_port: 0,
            dst_port: 0,
            protocol: 0,
            action,
        });

        let handle = cache.alloc().unwrap();
        unsafe {
            pool.get_mut(handle).fill(&udp_frame(64), 0);
        }
        ring.push_burst(&[handle]);

        let stats = Arc::new(WorkerStats::new());
        let worker = Worker::new(
            ring,
            cache,
            Arc::new(table),
            Arc::new(NeighborTable::new(16).unwrap()),
            Arc::new(NeighborTable::new(16).unwrap()),
            Arc::new(RuleStatsTable::new(1)),
            Arc::clone(&stats),
            sender,
            [0xAA; 6],
            Arc::new(AtomicBool::new(true)),
        );
        (worker, stats, pool)
    }

    #[test]
    fn drop_action_frees_buffer_without_sending() {
        let sender = CollectingSender { sent_count: Mutex::new(0) };
        let (mut worker, stats, _pool) = build_worker(sender, Action::Drop);
        worker.run();
        let snap = stats.snapshot();
        assert_eq!(snap.pkts_forwarded, 0);
        assert_eq!(snap.pkts_dropped, 1);
    }

    #[test]
    fn forward_action_sends_and_credits_forwarded() {
        let sender = CollectingSender { sent_count: Mutex::new(0) };
        let (mut worker, stats, _pool) = build_worker(sender, Action::Fwd { out_ifindex: 1 });
        worker.run();
        let snap = stats.snapshot();
        assert_eq!(snap.pkts_forwarded, 1);
        assert_eq!(snap.pkts_dropped, 0);
    }

    #[test]
    fn ttl_expiry_drops_instead_of_forwarding() {
        let pool = Arc::new(BufferPool::new(4).unwrap());
        let mut cache = PoolCache::new(Arc::clone(&pool));
        let ring = Arc::new(Ring::<BufferHandle>::new(4).unwrap());
        let mut table = RuleTable::new();
        table.add(RuleSpec {
            priority: 1,
            ip_version: Some(4),
            src: MaskedAddr::wildcard(4),
            dst: MaskedAddr::wildcard(4),
            src_port: 0,
            dst_port: 0,
            protocol: 0,
            action: Action::Fwd { out_ifindex: 1 },
        });
        let handle = cache.alloc().unwrap();
        unsafe {
            pool.get_mut(handle).fill(&udp_frame(1), 0);
        }
        ring.push_burst(&[handle]);

        let stats = Arc::new(WorkerStats::new());
        let sender = CollectingSender { sent_count: Mutex::new(0) };
        let mut worker = Worker::new(
            ring,
            cache,
            Arc::new(table),
            Arc::new(NeighborTable::new(16).unwrap()),
            Arc::new(NeighborTable::new(16).unwrap()),
            Arc::new(RuleStatsTable::new(1)),
            Arc::clone(&stats),
            sender,
            [0xAA; 6],
            Arc::new(AtomicBool::new(true)),
        );
        worker.run();
        let snap = stats.snapshot();
        assert_eq!(snap.pkts_forwarded, 0);
        assert_eq!(snap.pkts_dropped, 1);
    }

    #[test]
    fn arp_control_packet_learns_and_is_not_classified() {
        let pool = Arc::new(BufferPool::new(4).unwrap());
        let mut cache = PoolCache::new(Arc::clone(&pool));
        let ring = Arc::new(Ring::<BufferHandle>::new(4).unwrap());

        let mut frame = vec![0u8; 14 + 28];
        frame[12..14].copy_from_slice(&ETHERTYPE_ARP.to_be_bytes());
        let body = &mut frame[14..];
        body[0..2].copy_from_slice(&1u16.to_be_bytes());
        body[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
        body[4] = 6;
        body[5] = 4;
        body[8..14].copy_from_slice(&[0x02, 1, 2, 3, 4, 5]);
        body[14..18].copy_from_slice(&[10, 0, 0, 9]);

        let handle = cache.alloc().unwrap();
        unsafe {
            pool.get_mut(handle).fill(&frame, 0);
        }
        ring.push_burst(&[handle]);

        let arp_table = Arc::new(NeighborTable::new(16).unwrap());
        let stats = Arc::new(WorkerStats::new());
        let sender = CollectingSender { sent_count: Mutex::new(0) };
        let mut worker = Worker::new(
            ring,
            cache,
            Arc::new(RuleTable::new()),
            Arc::clone(&arp_table),
            Arc::new(NeighborTable::new(16).unwrap()),
            Arc::new(RuleStatsTable::new(0)),
            Arc::clone(&stats),
            sender,
            [0xAA; 6],
            Arc::new(AtomicBool::new(true)),
        );
        worker.run();

        assert_eq!(arp_table.get(0x0A000009), Some([0x02, 1, 2, 3, 4, 5]));
        let snap = stats.snapshot();
        assert_eq!(snap.pkts_parsed, 0);
        assert_eq!(snap.pkts_dropped, 0);
    }
}
