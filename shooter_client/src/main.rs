//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p shooter_client -- [--addr 127.0.0.1:40000] [--name Player] [--config client.json]
//!
//! There is no renderer: the client joins, wanders around with scripted
//! input, fires at whatever it faces and logs what it sees.
//!
//! Console commands:
//!   status              - Show client status
//!   ping                - Measure round trip time
//!   quit                - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Context;
use shooter_client::client::GameClient;
use shooter_client::input::InputState;
use shooter_shared::config::ClientConfig;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct Args {
    config: Option<String>,
    addr: Option<String>,
    name: Option<String>,
}

fn parse_args() -> Args {
    let mut out = Args::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                out.config = Some(args[i + 1].clone());
                i += 2;
            }
            "--addr" if i + 1 < args.len() => {
                out.addr = Some(args[i + 1].clone());
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                out.name = Some(args[i + 1].clone());
                i += 2;
            }
            _ => i += 1,
        }
    }
    out
}

fn load_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut cfg = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
            ClientConfig::from_json_str(&text).with_context(|| format!("parse {path}"))?
        }
        None => ClientConfig::default(),
    };
    if let Some(addr) = &args.addr {
        cfg.server_addr = addr.clone();
    }
    if let Some(name) = &args.name {
        cfg.player_name = name.clone();
    }
    Ok(cfg)
}

/// Scripted input: walk one of eight directions for two seconds at a time,
/// aim where we walk, keep the trigger held.
fn wander(tick: u64, tick_hz: u32) -> InputState {
    let leg = (tick / (2 * tick_hz as u64)) % 8;
    let (up, down, left, right) = match leg {
        0 => (true, false, false, false),
        1 => (true, false, false, true),
        2 => (false, false, false, true),
        3 => (false, true, false, true),
        4 => (false, true, false, false),
        5 => (false, true, true, false),
        6 => (false, false, true, false),
        _ => (true, false, true, false),
    };
    let mut input = InputState {
        up,
        down,
        left,
        right,
        attacking: true,
        ..Default::default()
    };
    input.aim = input.movement().direction().angle();
    input
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = load_config(&parse_args())?;
    info!(server = %cfg.server_addr, name = %cfg.player_name, "Starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;
    info!(player = %client.player_id, "Connected to server");

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

    println!("Client connected. Type 'status' for info, 'quit' to exit.");

    let tick_interval = Duration::from_secs_f32(1.0 / cfg.tick_hz as f32);
    let mut next_tick = tokio::time::Instant::now();
    let mut tick: u64 = 0;

    loop {
        while let Ok(line) = console_rx.try_recv() {
            match line.as_str() {
                "status" => {
                    for l in client.status() {
                        println!("{l}");
                    }
                }
                "ping" => client.ping().await?,
                "quit" | "exit" => {
                    client.disconnect("quit").await?;
                    return Ok(());
                }
                other => warn!(command = other, "Unknown console command"),
            }
        }

        client.send_input(wander(tick, cfg.tick_hz)).await?;
        client.poll(Duration::from_millis(1)).await?;

        if !client.is_connected() {
            println!("Disconnected from server: {:?}", client.state);
            break;
        }

        if tick % (5 * cfg.tick_hz as u64) == 0 {
            let me = client.world.get(client.player_id).map(|o| o.position());
            info!(
                tick,
                objects = client.world.len(),
                position = ?me,
                health = ?client.world.player_data().map(|d| d.health),
                alive = ?client.world.alive_count(),
                "World"
            );
        }

        tick += 1;
        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }

    Ok(())
}
