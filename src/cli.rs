//! The `clap`-derived command-line surface. Argument parsing only; the
//! actual work is delegated to the library so it stays independently
//! testable.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::pcap::Protocol;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to a YAML configuration file. Falls back to a built-in
    /// default analyzer set when omitted.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the fan-out driver against a pcap file (or stdin, with `-`),
    /// streaming decoded records as line-delimited JSON to stdout.
    Analyze {
        /// Path to the pcap file, or `-` to read from stdin.
        pcap: PathBuf,
    },

    /// Build a time index over a pcap file and emit it as JSON.
    Index {
        /// Path to the pcap file.
        pcap: PathBuf,

        /// Maximum number of envelope slots kept per section.
        #[arg(short = 'n', long, default_value_t = 256)]
        limit: usize,

        /// Write the index here instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Search a root store for packets of one flow and write the
    /// resulting pcap bytes to stdout.
    Search {
        /// Root store directory.
        #[arg(long)]
        root: PathBuf,

        /// Span start, in nanoseconds since the Unix epoch.
        #[arg(long)]
        span_start_ns: u64,

        /// Span duration, in nanoseconds.
        #[arg(long)]
        span_duration_ns: u64,

        #[arg(long, value_enum)]
        proto: CliProtocol,

        #[arg(long)]
        src_ip: IpAddr,

        #[arg(long, default_value_t = 0)]
        src_port: u16,

        #[arg(long)]
        dst_ip: IpAddr,

        #[arg(long, default_value_t = 0)]
        dst_port: u16,
    },

    /// Add a pcap file to a root store.
    Add {
        pcap: PathBuf,

        #[arg(long)]
        root: PathBuf,

        #[arg(short = 'n', long, default_value_t = 256)]
        limit: usize,
    },

    /// Remove every root-store entry pointing at a pcap file.
    Delete {
        pcap: PathBuf,

        #[arg(long)]
        root: PathBuf,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl From<CliProtocol> for Protocol {
    fn from(value: CliProtocol) -> Self {
        match value {
            CliProtocol::Tcp => Self::Tcp,
            CliProtocol::Udp => Self::Udp,
            CliProtocol::Icmp => Self::Icmp,
        }
    }
}
