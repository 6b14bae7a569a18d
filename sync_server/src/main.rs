//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p sync_server --bin server -- [--addr 127.0.0.1:40000] [--chunk-size 1000] [--seed 24301]
//!
//! Console commands:
//!   status          - Show world stats
//!   kick <player>   - Close the connection of a player
//!   dropall         - Close every connection
//!   refuse | accept - Stop or resume accepting connections
//!   quit            - Shutdown server

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use sync_server::{server::WorldHandle, world::WorldConfig, SyncServer};
use tokio::sync::mpsc;
use tracing::{error, info};

struct Args {
    addr: String,
    world: WorldConfig,
}

fn parse_args() -> Args {
    let mut out = Args {
        addr: "127.0.0.1:40000".to_string(),
        world: WorldConfig::default(),
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                out.addr = args[i + 1].clone();
                i += 2;
            }
            "--chunk-size" if i + 1 < args.len() => {
                out.world.chunk_size = args[i + 1].parse().unwrap_or(out.world.chunk_size);
                i += 2;
            }
            "--seed" if i + 1 < args.len() => {
                out.world.seed = args[i + 1].parse().unwrap_or(out.world.seed);
                i += 2;
            }
            _ => i += 1,
        }
    }
    out
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args { addr, world } = parse_args();
    info!(%addr, chunk_size = world.chunk_size, seed = world.seed, "Starting server");

    let server = SyncServer::bind(&addr, world).await.context("create server")?;
    let local = server.local_addr()?;
    let handle = server.world();
    info!(%local, "Server listening");

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
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

    println!("Server ready. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut accept = tokio::spawn(server.run());
    let mut stdin_open = true;
    loop {
        tokio::select! {
            done = &mut accept => {
                match done {
                    Ok(Err(e)) => error!(error = %format!("{e:#}"), "Listener failed"),
                    Err(e) => error!(error = %e, "Listener task failed"),
                    Ok(Ok(())) => {}
                }
                break;
            }
            line = console_rx.recv(), if stdin_open => {
                let Some(line) = line else {
                    stdin_open = false;
                    continue;
                };
                if !exec_console(&line, &handle) {
                    break;
                }
            }
        }
    }

    handle.drop_all();
    info!("Server stopped");
    Ok(())
}

fn exec_console(line: &str, world: &WorldHandle) -> bool {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["status"] => {
            let stats = world.stats();
            println!(
                "connections: {}  online: {}  known: {}  messages: {}  chunk requests: {}  accepting: {}",
                stats.connections,
                stats.online_players,
                stats.known_players,
                stats.messages,
                stats.chunk_requests,
                world.is_accepting()
            );
        }
        ["kick", player] => {
            if !world.drop_player(player) {
                println!("No connected player {player}");
            }
        }
        ["dropall"] => println!("Dropped {} connections", world.drop_all()),
        ["refuse"] => world.set_accepting(false),
        ["accept"] => world.set_accepting(true),
        ["quit"] | ["exit"] => return false,
        _ => println!("Unknown command: {line}"),
    }
    true
}
