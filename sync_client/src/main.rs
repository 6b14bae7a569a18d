//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p sync_client --bin client -- [--server 127.0.0.1:40000] [--token dev] [--name Pilot] [--config sync.json]
//!
//! The client connects, authenticates, and walks in a circle so chunks
//! stream in and out. Console commands:
//!   status          - Show session and chunk stats
//!   move <x> <y>    - Jump the local player to a position
//!   drop            - Drop the transport (reconnect follows)
//!   test            - Run one reconnection test
//!   stress <n>      - Run n reconnection tests
//!   report          - Print a performance report for the last 5 minutes
//!   quit            - Disconnect and exit

use std::env;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sync_client::{
    client::GameClient,
    connection::static_credential,
    monitor::{MetricSource, PerformanceMonitor, ProcessMemory},
    tester::ConnectionTester,
};
use sync_shared::{config::SyncConfig, math::Vec2, render::NullScene, transport::TcpTransport};
use tokio::sync::mpsc;
use tracing::{info, warn};

const WALK_STEP: Duration = Duration::from_millis(200);
const WALK_RADIUS: f32 = 1_500.0;
const REPORT_WINDOW: Duration = Duration::from_secs(300);

struct Args {
    config: SyncConfig,
    token: String,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut server = None;
    let mut name = None;
    let mut token = "dev-token".to_string();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                config_path = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--server" if i + 1 < args.len() => {
                server = Some(args[i + 1].clone());
                i += 2;
            }
            "--token" if i + 1 < args.len() => {
                token = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                name = Some(args[i + 1].clone());
                i += 2;
            }
            _ => i += 1,
        }
    }

    let mut config = match config_path {
        Some(path) => SyncConfig::load(&path)?,
        None => SyncConfig::default(),
    };
    if let Some(server) = server {
        config.server_addr = server;
    }
    if let Some(name) = name {
        config.player_name = name;
    }
    Ok(Args { config, token })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args { config, token } = parse_args().context("parse arguments")?;
    info!(server = %config.server_addr, name = %config.player_name, "Starting client");

    let client = GameClient::spawn(
        &config,
        TcpTransport::new(config.server_addr.clone()),
        static_credential(token),
        NullScene::default(),
    );
    client.connect().await.context("connect")?;

    let tester = ConnectionTester::new(client.clone(), config.tester.clone());
    if config.tester.automated {
        tester.start_automated();
    }

    let monitor = PerformanceMonitor::new(config.monitor.clone());
    let sources: Vec<Arc<dyn MetricSource>> = vec![
        Arc::new(ProcessMemory),
        Arc::new(client.clone()),
        Arc::new(tester.clone()),
    ];
    monitor.setup(sources);
    monitor.start_monitoring();
    let mut alerts = monitor.subscribe_alerts();
    tokio::spawn(async move {
        while let Ok(alert) = alerts.recv().await {
            println!("[alert] {:?} {}", alert.severity, alert.message);
        }
    });

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Client started. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut walk = tokio::time::interval(WALK_STEP);
    let mut angle: f32 = 0.0;

    loop {
        tokio::select! {
            _ = walk.tick() => {
                angle += 0.02;
                let pos = Vec2::new(WALK_RADIUS * angle.cos(), WALK_RADIUS * angle.sin());
                if client.move_to(pos).await.is_err() {
                    warn!("Client task stopped");
                    break;
                }
            }
            line = console_rx.recv() => {
                let Some(line) = line else { break };
                if !exec_console(&line, &client, &tester, &monitor).await? {
                    break;
                }
            }
        }
    }

    tester.stop_automated();
    monitor.stop_monitoring();
    client.shutdown().await;
    Ok(())
}

/// Runs one console command. Returns `false` when the client should exit.
async fn exec_console(
    line: &str,
    client: &GameClient,
    tester: &ConnectionTester,
    monitor: &PerformanceMonitor,
) -> anyhow::Result<bool> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["status"] => {
            let stats = client.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        ["move", x, y] => match (x.parse::<f32>(), y.parse::<f32>()) {
            (Ok(x), Ok(y)) => client.move_to(Vec2::new(x, y)).await?,
            _ => println!("Usage: move <x> <y>"),
        },
        ["drop"] => client.force_drop("console").await?,
        ["test"] => {
            match tester.run_reconnection_test(tester.default_options()).await {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(e) => println!("Test not run: {e}"),
            }
        }
        ["stress", n] => match n.parse::<usize>() {
            Ok(n) => match tester.run_stress_test(n).await {
                Ok(result) => println!(
                    "{}/{} passed, average reconnect {:?} ms",
                    result.passed, result.iterations, result.average_reconnect_ms
                ),
                Err(e) => println!("Stress test not run: {e}"),
            },
            Err(_) => println!("Usage: stress <n>"),
        },
        ["report"] => {
            let report = monitor.generate_report(REPORT_WINDOW);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        ["quit"] | ["exit"] => return Ok(false),
        _ => println!("Unknown command: {line}"),
    }
    Ok(true)
}
