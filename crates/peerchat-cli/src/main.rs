//! PeerChat Command-Line Interface
//!
//! A line-oriented chat client for one-to-one peer messaging. The chat log
//! goes to stdout, diagnostics to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use peerchat_core::crypto::CipherRegistry;
use peerchat_core::{
    launch, Message, NodeConfig, ReconnectConfig, SessionCommand, SessionConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{pick_port, sanitize_username, UserCommand};

/// PeerChat - direct peer-to-peer chat over TCP
#[derive(Parser)]
#[command(name = "peerchat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Username (cut or padded to 5 characters)
    #[arg(short, long, default_value = "")]
    username: String,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on (20000-21000, random otherwise)
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum simultaneous inbound connections
    #[arg(long, default_value = "1")]
    max_inbound: usize,

    /// Give up reconnecting after this many failed sweeps
    #[arg(long)]
    max_retries: Option<u32>,

    /// Connect to ip:port on startup
    #[arg(short, long)]
    connect: Option<String>,

    /// Enable a cipher on startup (e.g. "eg")
    #[arg(short, long)]
    enc: Option<String>,

    /// Number of log lines kept on screen
    #[arg(long, default_value = "30")]
    window: usize,
}

impl Cli {
    fn node_config(&self) -> NodeConfig {
        let mut rng = rand::thread_rng();
        NodeConfig {
            host: self.host.clone(),
            port: pick_port(self.port, &mut rng),
            peer_id: sanitize_username(&self.username, &mut rng),
            max_inbound: self.max_inbound,
            reconnect: ReconnectConfig {
                max_attempts: self.max_retries,
            },
            ..NodeConfig::default()
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            log_window: self.window,
            ..SessionConfig::default()
        }
    }
}

/// Convert a parsed input line into a session command. `None` means quit.
fn to_session_command(command: UserCommand) -> Option<SessionCommand> {
    match command {
        UserCommand::Connect { host, port } => Some(SessionCommand::Connect { host, port }),
        UserCommand::Encrypt(cipher) => Some(SessionCommand::EnableCipher(cipher)),
        UserCommand::Text(text) => Some(SessionCommand::SendText(text)),
        UserCommand::Quit => None,
    }
}

/// Print log entries that are newer than the last one shown.
async fn print_view(mut view: watch::Receiver<Vec<Message>>) {
    let mut last: Option<Message> = None;
    loop {
        {
            let window = view.borrow_and_update();
            let start = last
                .as_ref()
                .and_then(|seen| window.iter().rposition(|m| m == seen))
                .map_or(0, |i| i + 1);
            for message in &window[start..] {
                println!("{message}");
            }
            if let Some(newest) = window.last() {
                last = Some(newest.clone());
            }
        }
        if view.changed().await.is_err() {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout is the chat log
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let node_config = cli.node_config();
    let chat = launch(node_config, cli.session_config(), CipherRegistry::default())
        .await
        .context("Failed to start node")?;

    println!("\nPeerChat started");
    println!("  Username: {}", chat.node.local_id());
    println!("  Listening on {}", chat.node.local_addr());
    println!("\nCommands: !conn ip:port, !enc <cipher>, !quit\n");

    let printer = tokio::spawn(print_view(chat.view.clone()));

    if let Some(cipher) = &cli.enc {
        chat.commands
            .send(SessionCommand::EnableCipher(cipher.clone()))
            .await?;
    }
    if let Some(address) = &cli.connect {
        let (host, port) = commands::parse_address(address).context("Invalid --connect")?;
        chat.commands
            .send(SessionCommand::Connect { host, port })
            .await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read input")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match UserCommand::parse(line) {
                    Ok(command) => match to_session_command(command) {
                        Some(command) => {
                            if chat.commands.send(command).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    Err(e) => eprintln!("[sys] {e:#}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let _ = chat.commands.send(SessionCommand::Shutdown).await;
    let session = chat.session_task.await.context("Session task failed")?;
    chat.node_task
        .await
        .context("Node task failed")?
        .context("Node stopped with an error")?;
    let _ = printer.await;

    if session.discarded() > 0 {
        tracing::info!(count = session.discarded(), "unrecognized payloads discarded");
    }
    Ok(())
}
