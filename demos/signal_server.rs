//! Signaling server for live audio broadcasts
//!
//! Run with: cargo run --example signal_server [BIND_ADDR]
//!
//! Examples:
//!   cargo run --example signal_server                    # binds to 0.0.0.0:3000
//!   cargo run --example signal_server localhost          # binds to 127.0.0.1:3000
//!   cargo run --example signal_server 127.0.0.1:3001     # binds to 127.0.0.1:3001
//!
//! Watch the directory from another terminal with:
//!   cargo run --example directory_watch ws://localhost:3000

use std::net::SocketAddr;
use std::time::Duration;

use airwave::protocol::format_duration;
use airwave::{ServerConfig, SignalingServer};

/// Parse bind address from command line argument
///
/// Accepts formats:
/// - "localhost" -> 127.0.0.1:3000
/// - "127.0.0.1" -> 127.0.0.1:3000
/// - "127.0.0.1:3001" -> 127.0.0.1:3001
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    const DEFAULT_PORT: u16 = 3000;

    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: signal_server [BIND_ADDR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to bind to (default: 0.0.0.0:3000)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let bind_addr = match args.get(1) {
        Some(addr_str) => match parse_bind_addr(addr_str) {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        },
        None => SocketAddr::from(([0, 0, 0, 0], 3000)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("airwave=debug".parse()?)
                .add_directive("signal_server=info".parse()?),
        )
        .init();

    let config = ServerConfig::with_addr(bind_addr).stats_interval(Duration::from_secs(60));

    println!("Starting signaling server on ws://{}", config.bind_addr);
    println!();

    let server = SignalingServer::new(config);
    let mut stats = server.stats();

    tokio::spawn(async move {
        while stats.changed().await.is_ok() {
            let s = stats.borrow_and_update().clone();
            tracing::debug!(
                connections = s.active_connections,
                broadcasts = s.active_broadcasts,
                pairings = s.active_pairings,
                uptime = %format_duration(s.uptime),
                "Tick"
            );
        }
    });

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\nShutting down...");
        })
        .await?;

    Ok(())
}
