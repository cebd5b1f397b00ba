//! Datapath core of the userspace packet engine: buffer pool, SPSC rings,
//! parser, flow hash, rule classifier, neighbor tables, checksum helpers,
//! and the per-worker pipeline that ties them together.
//!
//! Everything in this crate is free of syscalls; capture and raw-socket send
//! live in `upe-net`, and CLI/rule-file parsing live in `upe-config`.

mod backoff;
mod invariants;

pub mod buffer;
pub mod checksum;
pub mod dispatch;
pub mod error;
pub mod flow_hash;
pub mod neighbor;
pub mod parser;
pub mod pool;
pub mod ring;
pub mod rule_table;
pub mod stats;
pub mod tsc;
pub mod tx;
pub mod worker;

pub use buffer::{BufferHandle, PacketBuffer, BUFFER_CAPACITY};
pub use dispatch::{Dispatcher, FrameSource};
pub use error::CoreError;
pub use flow_hash::{flow_hash, ring_index};
pub use neighbor::{L1Cache, MacAddr, NeighborTable};
pub use parser::{parse_flow_key, peek_ethertype, FlowKey, IpAddrKey, ParseError};
pub use pool::{BufferPool, PoolCache};
pub use ring::Ring;
pub use rule_table::{Action, MaskedAddr, Rule, RuleSpec, RuleTable};
pub use stats::{RuleStatsTable, WorkerStats, WorkerStatsSnapshot};
pub use tx::FrameSender;
pub use worker::Worker;
