//! Entry point for `udp-handshake`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! Configuration starts from [`ServerConfig::from_env`] / [`ClientConfig::from_env`]
//! and CLI flags override it.  `main.rs` owns only process setup (logging,
//! signal handling, argument parsing).

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;

use udp_handshake::{Client, ClientConfig, HandshakeError, RetryPolicy, Server, ServerConfig};

/// Checksummed UDP handshake server and client.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept handshakes and validate sequence numbers.
    Server {
        /// Local address to bind.
        #[arg(short, long)]
        bind: Option<IpAddr>,
        /// UDP port to listen on.
        #[arg(short, long)]
        port: Option<u16>,
        /// Drop every valid packet without replying.
        #[arg(long)]
        discard: bool,
        /// Cap on concurrently running packet handlers (0 = unbounded).
        #[arg(long)]
        max_in_flight: Option<usize>,
        /// Forget peers idle for this many seconds.
        #[arg(long)]
        idle_secs: Option<u64>,
    },
    /// Handshake with a server.
    Client {
        /// Server address.
        #[arg(short, long)]
        server: Option<IpAddr>,
        /// Server UDP port.
        #[arg(short, long)]
        port: Option<u16>,
        /// Per-reply timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Sequence number of the first SYN.
        #[arg(long, conflicts_with = "random_isn")]
        initial_seq: Option<u32>,
        /// Pick a random first sequence number.
        #[arg(long)]
        random_isn: bool,
        #[command(subcommand)]
        action: Action,
    },
}

#[derive(Subcommand)]
enum Action {
    /// Perform the handshake, re-initiating on failure.
    Connect {
        #[arg(short, long, default_value_t = 1)]
        attempts: u32,
    },
    /// Handshake, then send each message as a data packet.
    Send {
        #[arg(required = true)]
        messages: Vec<String>,
    },
    /// Send tampered packets and resend on every NACK.
    Corrupt {
        #[arg(long, default_value_t = 5)]
        max_attempts: u32,
        /// Initial pause between resends in milliseconds.
        #[arg(long, default_value_t = 500)]
        backoff_ms: u64,
        /// Ignore every reply and keep resending.
        #[arg(long)]
        discard_replies: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides the default level.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            bind,
            port,
            discard,
            max_in_flight,
            idle_secs,
        } => {
            let mut config = ServerConfig::from_env();
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if let Some(port) = port {
                config.port = port;
            }
            config.discard_mode |= discard;
            if let Some(n) = max_in_flight {
                config.max_in_flight = (n > 0).then_some(n);
            }
            if let Some(secs) = idle_secs {
                config.session_idle_timeout = Some(Duration::from_secs(secs));
            }
            run_server(config).await
        }
        Mode::Client {
            server,
            port,
            timeout_ms,
            initial_seq,
            random_isn,
            action,
        } => {
            let mut config = ClientConfig::from_env();
            if let Some(server) = server {
                config.server_addr = server;
            }
            if let Some(port) = port {
                config.server_port = port;
            }
            if let Some(ms) = timeout_ms {
                config.recv_timeout = Duration::from_millis(ms);
            }
            if let Some(seq) = initial_seq {
                config.initial_sequence = seq;
            }
            if random_isn {
                config.initial_sequence = rand::rng().random();
            }
            run_client(config, action).await
        }
    }
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let server = Server::bind(&config).await?;
    let dispatcher = server.dispatcher();

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("[server] cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    for session in dispatcher.sessions().snapshot() {
        log::info!(
            "[server] {} {} expected_seq={} last_ack_sent={}",
            session.peer,
            session.state,
            session.expected_seq,
            session.last_ack_sent
        );
    }
    match dispatcher.metrics() {
        Ok(m) => log::info!("[server] {:?}", *m),
        Err(_) => log::warn!("[server] metrics unavailable"),
    }
    Ok(())
}

async fn run_client(config: ClientConfig, action: Action) -> Result<()> {
    let mut client = Client::open(&config)
        .await
        .with_context(|| format!("opening client for {}", config.server()))?;
    log::info!(
        "[client] {} → {} starting at seq={}",
        client.local_addr(),
        client.peer(),
        client.next_sequence_number()
    );

    match action {
        Action::Connect { attempts } => {
            let confirmation = connect(&mut client, attempts.max(1)).await?;
            println!("{confirmation}");
        }
        Action::Send { messages } => {
            let confirmation = connect(&mut client, 1).await?;
            println!("{confirmation}");
            for message in messages {
                let reply = client
                    .send(message.as_bytes())
                    .await
                    .with_context(|| format!("sending {message:?}"))?;
                println!("{reply}");
            }
        }
        Action::Corrupt {
            max_attempts,
            backoff_ms,
            discard_replies,
        } => {
            client.set_discard_replies(discard_replies);
            let policy = RetryPolicy {
                max_attempts,
                initial_backoff: Duration::from_millis(backoff_ms),
                ..RetryPolicy::default()
            };
            match client.send_manipulated(policy).await {
                Ok(report) => println!("accepted: {report:?}"),
                Err(e @ HandshakeError::RetriesExhausted { .. }) => {
                    println!("{e}");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

async fn connect(client: &mut Client, attempts: u32) -> Result<String> {
    for attempt in 1..=attempts {
        match client.initiate().await {
            Ok(confirmation) => return Ok(confirmation),
            Err(e) if attempt < attempts => {
                log::info!("[client] attempt {attempt}/{attempts} failed: {e}; retrying");
            }
            Err(e) => return Err(e).context("handshake failed"),
        }
    }
    bail!("no handshake attempts were made")
}
