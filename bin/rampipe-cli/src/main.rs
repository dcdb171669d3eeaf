//! RamPipe CLI - Admin Command Line Interface
//!
//! Sends one request per invocation to the daemon's control socket and
//! prints the response.

use anyhow::Result;
use clap::{Parser, Subcommand};
use rampipe_proto::{PinMode, Request, Response};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

#[derive(Parser, Debug)]
#[command(name = "rampipe")]
#[command(about = "Manage RAM pinning of hot files and directories")]
#[command(version)]
struct Args {
    /// Control socket path
    #[arg(long, default_value = "/run/rampipe.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pin a file or directory into RAM
    Pin {
        /// Path to pin
        path: PathBuf,
        /// Use the overlay strategy (directories only; RAM holds changes
        /// only, not the whole tree)
        #[arg(long, conflicts_with = "move_mode")]
        overlay: bool,
        /// Use the move strategy (full copy in RAM; the default)
        #[arg(long = "move")]
        move_mode: bool,
    },
    /// Sync and unpin a previously pinned path
    Unpin {
        /// Path to unpin
        path: PathBuf,
    },
    /// Show pinned items and their RAM usage
    Status,
    /// Force a sync of all pinned items back to disk
    Sync,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn exchange(socket: &Path, request: &Request) -> Result<Response, String> {
    let mut stream = match UnixStream::connect(socket).await {
        Ok(stream) => stream,
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
            return Err("daemon not running; start with: systemctl start rampiped".to_string());
        }
        Err(e) => return Err(format!("cannot connect to {}: {e}", socket.display())),
    };
    stream
        .write_all(&request.encode())
        .await
        .map_err(|e| format!("cannot send request: {e}"))?;
    stream
        .shutdown()
        .await
        .map_err(|e| format!("cannot send request: {e}"))?;
    let mut reply = Vec::new();
    stream
        .read_to_end(&mut reply)
        .await
        .map_err(|e| format!("cannot read response: {e}"))?;
    Response::decode(&reply)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn print_response(response: &Response) {
    if let Some(data) = &response.status_data {
        if data.items.is_empty() {
            println!("nothing pinned");
            return;
        }
        for (path, item) in &data.items {
            println!("{:<10} {:>10}  {path}", item.backend, format_bytes(item.bytes));
        }
        println!("total: {}", format_bytes(data.total_bytes));
    } else if !response.message.is_empty() {
        println!("{}", response.message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let request = match args.command {
        Commands::Pin { path, overlay, .. } => {
            let mode = if overlay { PinMode::Overlay } else { PinMode::Move };
            Request::pin(path, mode)
        }
        Commands::Unpin { path } => Request::unpin(path),
        Commands::Status => Request::status(),
        Commands::Sync => Request::sync(),
    };

    let outcome = tokio::time::timeout(REQUEST_TIMEOUT, exchange(&args.socket, &request)).await;
    match outcome {
        Ok(Ok(response)) if response.is_success() => {
            print_response(&response);
            Ok(())
        }
        Ok(Ok(response)) => {
            eprintln!("Error: {}", response.message);
            std::process::exit(1);
        }
        Ok(Err(message)) => {
            eprintln!("Error: {message}");
            std::process::exit(2);
        }
        Err(_) => {
            eprintln!("Error: connection timeout");
            std::process::exit(2);
        }
    }
}
