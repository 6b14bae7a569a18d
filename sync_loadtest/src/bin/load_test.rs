//! Load test runner.
//!
//! Usage:
//!   cargo run -p sync_loadtest --bin load_test -- [--players 100] [--duration 60]
//!       [--server 127.0.0.1:40000] [--ramp-up 10] [--ramp-down 10]
//!       [--output load-test-results] [--config sync.json]
//!
//! `--server local` runs against an in-process world instead of a socket.
//! Exits 0 when the run completes and 1 when it cannot start.

use std::path::PathBuf;

use anyhow::Context;
use sync_loadtest::{write_summary, LoadTestHarness, LoadTestSummary};
use sync_server::{world::WorldConfig, LocalTransport, WorldHandle};
use sync_shared::{config::SyncConfig, transport::TcpTransport};
use tokio::net::TcpStream;
use tracing::{error, info};

const LOCAL_SERVER: &str = "local";

fn parse_args() -> anyhow::Result<SyncConfig> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = SyncConfig::default();
    // The config file is applied first so flags override it.
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        let path = args.get(pos + 1).context("--config needs a path")?;
        config = SyncConfig::load(&PathBuf::from(path))?;
    }

    let lt = &mut config.load_test;
    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--players", Some(v)) => lt.max_concurrent_players = v.parse().context("--players")?,
            ("--duration", Some(v)) => lt.test_duration_secs = v.parse().context("--duration")?,
            ("--ramp-up", Some(v)) => lt.ramp_up_secs = v.parse().context("--ramp-up")?,
            ("--ramp-down", Some(v)) => lt.ramp_down_secs = v.parse().context("--ramp-down")?,
            ("--server", Some(v)) => lt.server_url = v.clone(),
            ("--output", Some(v)) => lt.output_dir = v.clone(),
            ("--config", Some(_)) => {}
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    match run().await {
        Ok(summary) => print_summary(&summary),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Load test could not start");
            std::process::exit(1);
        }
    }
}

async fn run() -> anyhow::Result<LoadTestSummary> {
    let config = parse_args().context("parse arguments")?;
    let lt = config.load_test.clone();
    let output = PathBuf::from(&lt.output_dir);

    let summary = if lt.server_url == LOCAL_SERVER {
        let world = WorldHandle::new(WorldConfig {
            chunk_size: config.chunks.chunk_size,
            ..Default::default()
        });
        info!("Running against an in-process world");
        LoadTestHarness::new(lt, move |_: u32| LocalTransport::new(world.clone()))
            .with_connection_config(config.connection.clone())
            .with_chunk_size(config.chunks.chunk_size)
            .start_load_test()
            .await?
    } else {
        TcpStream::connect(&lt.server_url)
            .await
            .with_context(|| format!("reach {}", lt.server_url))?;
        let addr = lt.server_url.clone();
        LoadTestHarness::new(lt, move |_: u32| TcpTransport::new(addr.clone()))
            .with_connection_config(config.connection.clone())
            .with_chunk_size(config.chunks.chunk_size)
            .start_load_test()
            .await?
    };

    let path = write_summary(&summary, &output)?;
    println!("Results saved to {}", path.display());
    Ok(summary)
}

fn print_summary(s: &LoadTestSummary) {
    println!();
    println!("====================================");
    println!("Load Test Summary");
    println!("====================================");
    println!("Players created:   {}", s.total_players_created);
    println!("Peak concurrent:   {}", s.peak_concurrent_players);
    println!("Success rate:      {:.1}%", s.success_rate * 100.0);
    println!("Movements/s:       {:.1}", s.movements_per_second);
    println!("Chunk crossings:   {}", s.partition_crossings);
    println!("Latency avg:       {:.1} ms", s.average_latency);
    if let (Some(min), Some(max)) = (s.min_latency, s.max_latency) {
        println!("Latency min/max:   {min} / {max} ms");
    }
    println!("Errors:            {} ({:.2} per session)", s.errors, s.error_rate);
    println!("Elapsed:           {:.1}s", s.elapsed_secs);
}
