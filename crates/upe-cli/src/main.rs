//! The `upe` binary: wires RX dispatch, the worker pool, and the stats
//! thread together, installs the signal handler, and initializes tracing.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;

use upe_config::{Args, ParsedAction};
use upe_core::dispatch::{Dispatcher, FrameSource};
use upe_core::rule_table::Action;
use upe_core::tx::FrameSender;
use upe_core::{
    BufferHandle, BufferPool, NeighborTable, PoolCache, Ring, RuleSpec, RuleStatsTable, RuleTable,
    Worker, WorkerStats,
};
use upe_net::{AfPacketSender, LiveCapture, PcapReplay};

const POOL_CAPACITY: usize = 65_536;
const RING_CAPACITY: usize = 4096;
const NEIGHBOR_TABLE_CAPACITY: usize = 4096;
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Either a live `AF_PACKET` capture or an offline pcap replay, unified
/// behind one [`FrameSource`] so the dispatch thread doesn't need to be
/// generic over which one it got.
enum AnySource {
    Live(LiveCapture),
    Replay(PcapReplay),
}

impl FrameSource for AnySource {
    fn recv(&mut self, buf: &mut [u8; upe_core::BUFFER_CAPACITY], poll_timeout: Duration) -> Option<usize> {
        match self {
            AnySource::Live(s) => s.recv(buf, poll_timeout),
            AnySource::Replay(s) => s.recv(buf, poll_timeout),
        }
    }
}

/// Either a real bound egress socket or a no-op sink, used when the engine
/// is started without `--out-iface` and the loaded rule table has no `fwd`
/// rule to require one.
enum AnySender {
    Real(AfPacketSender),
    Null,
}

impl FrameSender for AnySender {
    fn send_batch(&self, frames: &[&[u8]]) -> usize {
        match self {
            AnySender::Real(s) => s.send_batch(frames),
            AnySender::Null => 0,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse_args();

    tracing_subscriber::fmt().with_max_level(args.tracing_level()).init();

    let worker_count = args.workers.max(1).next_power_of_two();
    if worker_count != args.workers {
        tracing::warn!(
            requested = args.workers,
            used = worker_count,
            "rounding worker count up to the next power of two"
        );
    }

    let rule_table = build_rule_table(&args)?;
    let rule_count = rule_table.len();
    let rule_table = Arc::new(rule_table);

    let own_mac = match &args.out_iface {
        Some(iface) => upe_net::hardware_address(iface).context("reading egress interface MAC")?,
        None => {
            tracing::warn!("no --out-iface given; forwarded frames keep their original Ethernet source MAC");
            [0u8; 6]
        }
    };

    upe_core::tsc::calibrate();

    let pool = Arc::new(BufferPool::new(POOL_CAPACITY)?);
    let arp_table = Arc::new(NeighborTable::new(NEIGHBOR_TABLE_CAPACITY)?);
    let ndp_table = Arc::new(NeighborTable::new(NEIGHBOR_TABLE_CAPACITY)?);
    let stop_flag = Arc::new(AtomicBool::new(false));

    {
        let stop_flag = Arc::clone(&stop_flag);
        ctrlc::set_handler(move || {
            tracing::info!("signal received, stopping");
            stop_flag.store(true, Ordering::Relaxed);
        })
        .context("installing SIGINT/SIGTERM handler")?;
    }

    let rings: Vec<Arc<Ring<BufferHandle>>> = (0..worker_count)
        .map(|_| Ring::new(RING_CAPACITY).map(Arc::new))
        .collect::<Result<_, _>>()?;

    let dispatch_join = spawn_dispatcher(&args, Arc::clone(&pool), rings.clone(), Arc::clone(&stop_flag))?;

    let sender = Arc::new(match &args.out_iface {
        Some(iface) => AnySender::Real(AfPacketSender::new(iface)?),
        None => AnySender::Null,
    });

    let mut worker_joins = Vec::with_capacity(worker_count);
    let mut worker_stats = Vec::with_capacity(worker_count);
    let mut worker_rule_stats = Vec::with_capacity(worker_count);
    for (idx, ring) in rings.into_iter().enumerate() {
        let cache = PoolCache::new(Arc::clone(&pool));
        let stats = Arc::new(WorkerStats::new());
        worker_stats.push(Arc::clone(&stats));
        let rule_stats = Arc::new(RuleStatsTable::new(rule_count));
        worker_rule_stats.push(Arc::clone(&rule_stats));
        let sender = Arc::clone(&sender);

        let rule_table = Arc::clone(&rule_table);
        let arp_table = Arc::clone(&arp_table);
        let ndp_table = Arc::clone(&ndp_table);
        let stop_flag = Arc::clone(&stop_flag);
        let pin_cores = args.pin_cores;

        let handle = thread::Builder::new()
            .name(format!("upe-worker-{idx}"))
            .spawn(move || {
                if pin_cores {
                    if let Err(e) = upe_net::pin_current_thread(idx + 1) {
                        tracing::warn!(worker = idx, error = %e, "failed to pin worker thread");
                    }
                }
                let mut worker =
                    Worker::new(ring, cache, rule_table, arp_table, ndp_table, rule_stats, stats, sender, own_mac, stop_flag);
                worker.run();
            })
            .with_context(|| format!("spawning worker thread {idx}"))?;
        worker_joins.push(handle);
    }

    run_stats_loop(&args, &stop_flag, &worker_stats, &worker_rule_stats, rule_count);

    dispatch_join.join().expect("dispatch thread panicked");
    for handle in worker_joins {
        handle.join().expect("worker thread panicked");
    }

    Ok(())
}

fn build_rule_table(args: &Args) -> anyhow::Result<RuleTable> {
    let mut table = RuleTable::new();
    let Some(path) = &args.rules else {
        tracing::warn!("no --rules file given; every packet will miss the (empty) rule table");
        return Ok(table);
    };

    let parsed = upe_config::load_rules(path)?;
    for rule in parsed {
        let action = match rule.action {
            ParsedAction::Drop => Action::Drop,
            ParsedAction::Fwd { out_iface } => {
                if args.out_iface.is_none() {
                    anyhow::bail!("rule file has a fwd rule but --out-iface was not given");
                }
                let out_ifindex = upe_net::interface_index(&out_iface)
                    .with_context(|| format!("resolving out_iface {out_iface:?} from rule file"))?;
                Action::Fwd { out_ifindex }
            }
        };
        table.add(RuleSpec {
            priority: rule.priority,
            ip_version: rule.ip_version,
            src: rule.src,
            dst: rule.dst,
            src_port: rule.src_port,
            dst_port: rule.dst_port,
            protocol: rule.protocol,
            action,
        });
    }

    tracing::info!(rules = table.len(), path = %path.display(), "rule table loaded");
    Ok(table)
}

fn spawn_dispatcher(
    args: &Args,
    pool: Arc<BufferPool>,
    rings: Vec<Arc<Ring<BufferHandle>>>,
    stop_flag: Arc<AtomicBool>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    let cache = PoolCache::new(pool);
    let source = match (&args.iface, &args.pcap) {
        (Some(iface), _) => AnySource::Live(LiveCapture::new(iface)?),
        (None, Some(path)) => AnySource::Replay(PcapReplay::open(path)?),
        (None, None) => unreachable!("clap enforces iface xor pcap"),
    };

    let pin_cores = args.pin_cores;
    let handle = thread::Builder::new()
        .name("upe-dispatch".to_string())
        .spawn(move || {
            if pin_cores {
                if let Err(e) = upe_net::pin_current_thread(0) {
                    tracing::warn!(error = %e, "failed to pin dispatch thread");
                }
            }
            let mut dispatcher = Dispatcher::new(source, cache, rings, stop_flag);
            dispatcher.run();
        })
        .context("spawning dispatch thread")?;
    Ok(handle)
}

fn run_stats_loop(
    args: &Args,
    stop_flag: &Arc<AtomicBool>,
    worker_stats: &[Arc<WorkerStats>],
    worker_rule_stats: &[Arc<RuleStatsTable>],
    rule_count: usize,
) {
    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));

    loop {
        thread::sleep(STATS_INTERVAL);

        for (idx, stats) in worker_stats.iter().enumerate() {
            let snap = stats.snapshot();
            tracing::info!(
                worker = idx,
                pkts_in = snap.pkts_in,
                pkts_parsed = snap.pkts_parsed,
                pkts_matched = snap.pkts_matched,
                pkts_forwarded = snap.pkts_forwarded,
                pkts_dropped = snap.pkts_dropped,
                "worker stats"
            );
        }
        for rule_id in 0..rule_count {
            let (packets, bytes) = worker_rule_stats.iter().fold((0u64, 0u64), |(p, b), t| {
                let (wp, wb) = t.snapshot(rule_id as u32);
                (p + wp, b + wb)
            });
            if packets > 0 {
                tracing::debug!(rule_id, packets, bytes, "rule stats");
            }
        }

        if stop_flag.load(Ordering::Relaxed) {
            break;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                tracing::info!("duration elapsed, stopping");
                stop_flag.store(true, Ordering::Relaxed);
                break;
            }
        }
    }
}

