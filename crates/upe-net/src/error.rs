use thiserror::Error;

/// Failures from the raw-socket/interface/affinity layer. Startup-only;
/// never returned from a per-packet path.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("interface {0:?} not found")]
    InterfaceNotFound(String),

    #[error("socket({0}) failed: {1}")]
    SocketCreation(&'static str, std::io::Error),

    #[error("bind to interface {0:?} failed: {1}")]
    Bind(String, std::io::Error),

    #[error("failed to open pcap file {0:?}: {1}")]
    PcapOpen(std::path::PathBuf, std::io::Error),

    #[error("pcap file {0:?} is truncated or malformed")]
    PcapMalformed(std::path::PathBuf),

    #[error("core id {core_id} out of range [0, {num_cores})")]
    CoreOutOfRange { core_id: usize, num_cores: usize },

    #[error("sched_setaffinity failed: {0}")]
    Affinity(std::io::Error),
}
