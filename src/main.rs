#![deny(clippy::all, clippy::cargo, clippy::nursery, clippy::must_use_candidate)]
// now allow a few rules which are denied by the above's statement
#![allow(clippy::multiple_crate_versions)]
#![deny(missing_debug_implementations)]
#![deny(rustdoc::all)]

//! pcapfan

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use pcapfan::analyzer::{active_configs, run_pipeline};
use pcapfan::cli::{Cli, Command};
use pcapfan::config::RootConfig;
use pcapfan::display::NullDisplay;
use pcapfan::pcap::{create_index, Protocol, SearchRequest};
use pcapfan::root::Root;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global tracing subscriber")?;
    tracing_log::LogTracer::init()?;

    match args.command {
        Command::Analyze { pcap } => run_analyze(&args.config, &pcap).await,
        Command::Index { pcap, limit, out } => run_index(&pcap, limit, out.as_deref()),
        Command::Search {
            root,
            span_start_ns,
            span_duration_ns,
            proto,
            src_ip,
            src_port,
            dst_ip,
            dst_port,
        } => {
            run_search(
                &root,
                span_start_ns,
                span_duration_ns,
                proto.into(),
                src_ip,
                src_port,
                dst_ip,
                dst_port,
            )
            .await
        }
        Command::Add { pcap, root, limit } => run_add(&pcap, &root, limit),
        Command::Delete { pcap, root } => run_delete(&pcap, &root),
    }
}

async fn run_analyze(config_path: &Option<std::path::PathBuf>, pcap: &std::path::Path) -> Result<()> {
    let config = match config_path {
        Some(path) => RootConfig::load(path)?,
        None => RootConfig::default_config(),
    };
    let analyzers = active_configs(config.analyzers)?;

    let (tx, mut rx) = mpsc::channel::<pcapfan::record::Record>(16);
    let sink_task = tokio::spawn(async move {
        let stdout = std::io::stdout();
        while let Some(record) = rx.recv().await {
            let mut lock = stdout.lock();
            let _ = writeln!(lock, "{}", record.canonical_string());
        }
    });

    let run_result = if pcap.as_os_str() == "-" {
        run_pipeline(tokio::io::stdin(), analyzers, HashMap::new(), tx, Arc::new(NullDisplay), None).await
    } else {
        let file = tokio::fs::File::open(pcap).await.context("opening pcap file")?;
        run_pipeline(file, analyzers, HashMap::new(), tx, Arc::new(NullDisplay), None).await
    };

    sink_task.await.context("record sink task panicked")?;
    run_result.context("fan-out pipeline failed")
}

fn run_index(pcap: &std::path::Path, limit: usize, out: Option<&std::path::Path>) -> Result<()> {
    let file = std::fs::File::open(pcap).context("opening pcap file")?;
    let index = create_index(file, limit).context("building index")?;
    let json = serde_json::to_vec_pretty(&index)?;
    match out {
        Some(path) => std::fs::write(path, json).context("writing index")?,
        None => std::io::stdout().write_all(&json)?,
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_search(
    root: &std::path::Path,
    span_start_ns: u64,
    span_duration_ns: u64,
    protocol: Protocol,
    src_ip: std::net::IpAddr,
    src_port: u16,
    dst_ip: std::net::IpAddr,
    dst_port: u16,
) -> Result<()> {
    let store = Root::open(root)?;
    let request = SearchRequest {
        span_lo_ns: span_start_ns,
        span_hi_ns: span_start_ns.saturating_add(span_duration_ns),
        protocol,
        src_ip,
        src_port,
        dst_ip,
        dst_port,
    };
    let (tx, mut rx) = mpsc::channel(4);
    let search_task = tokio::spawn(async move { store.search(request, tx).await });
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    while let Some(bytes) = rx.recv().await {
        lock.write_all(&bytes)?;
    }
    search_task.await.context("search task panicked")?.context("root search failed")
}

fn run_add(pcap: &std::path::Path, root: &std::path::Path, limit: usize) -> Result<()> {
    let store = Root::open(root)?;
    let entry_path = store.add(pcap, limit)?;
    info!(entry = %entry_path.display(), "added pcap to root");
    Ok(())
}

fn run_delete(pcap: &std::path::Path, root: &std::path::Path) -> Result<()> {
    let store = Root::open(root)?;
    let removed = store.delete(pcap)?;
    info!(removed, "removed root entries");
    Ok(())
}
