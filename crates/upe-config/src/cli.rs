//! Command-line surface, per `spec.md` §6.
use std::path::PathBuf;

use clap::Parser;

/// Userspace packet engine: multi-threaded L2/L3 packet switch and filter.
#[derive(Debug, Parser)]
#[command(name = "upe", version, about)]
#[command(group(
    clap::ArgGroup::new("source")
        .args(["iface", "pcap"])
        .required(true)
))]
pub struct Args {
    /// Live interface to capture from.
    #[arg(long)]
    pub iface: Option<String>,

    /// Offline pcap file to replay instead of live capture.
    #[arg(long)]
    pub pcap: Option<PathBuf>,

    /// Interface frames are forwarded out of.
    #[arg(long)]
    pub out_iface: Option<String>,

    /// INI rule file (`spec.md` §6). With none given, every packet is
    /// dropped: no rule matches an empty table.
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// 0 = WARN, 1 = INFO, 2 = DEBUG.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub verbose: u8,

    /// Run for this many seconds, then stop as if SIGTERM was received.
    /// 0 (the default) means run until a signal arrives.
    #[arg(long, default_value_t = 0)]
    pub duration: u64,

    /// Number of worker threads.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Pin the capture thread and each worker to a distinct CPU core.
    #[arg(long, default_value_t = false)]
    pub pin_cores: bool,
}

impl Args {
    /// Parses `std::env::args()`, exiting with code 2 on a bad argument
    /// combination (`spec.md` §6). A thin wrapper so callers don't need
    /// `clap` as a direct dependency just to invoke [`clap::Parser::parse`].
    #[must_use]
    pub fn parse_args() -> Self {
        <Self as Parser>::parse()
    }

    #[must_use]
    pub fn tracing_level(&self) -> tracing::Level {
        match self.verbose {
            0 => tracing::Level::WARN,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::INFO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_iface_or_pcap() {
        let result = Args::try_parse_from(["upe"]);
        assert!(result.is_err());
    }

    #[test]
    fn accepts_iface_alone() {
        let args = Args::try_parse_from(["upe", "--iface", "eth0"]).unwrap();
        assert_eq!(args.iface.as_deref(), Some("eth0"));
        assert_eq!(args.verbose, 1);
        assert_eq!(args.duration, 0);
    }

    #[test]
    fn rejects_verbose_out_of_range() {
        let result = Args::try_parse_from(["upe", "--iface", "eth0", "--verbose", "3"]);
        assert!(result.is_err());
    }
}
