use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quux::config::parse_level;
use quux::observability::init_tracing;
use quux::prelude::*;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "quuxd")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Overrides `logging.level` from the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print per-peer statistics as JSON when a stream completes
    #[arg(long)]
    stats: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Echo every stream back to its sender
    Server {
        #[arg(short, long, default_value = "0.0.0.0:9999")]
        bind: SocketAddr,
    },

    /// Send one message and print the echo
    Client {
        #[arg(short, long)]
        endpoint: SocketAddr,

        #[arg(short, long, default_value = "ping")]
        message: String,

        /// Seconds to wait for the echo
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => EngineConfig::load_from_env().context("Invalid QUUX_* environment configuration")?,
    };
    let level = cli.log_level.as_deref().map(parse_level).unwrap_or_else(|| config.tracing_level());
    init_tracing(level);

    info!("quuxd v{} starting", quux::VERSION);

    let mut engine = Engine::new(config)?;
    engine.init_loop()?;

    match cli.command {
        Commands::Server { bind } => run_server(&mut engine, bind, cli.stats),
        Commands::Client {
            endpoint,
            message,
            timeout,
        } => run_client(&mut engine, endpoint, message, Duration::from_secs(timeout), cli.stats),
    }
}

fn accept_echo_streams(engine: &mut Engine, peer: PeerHandle, stats: bool) {
    while let Ok(stream) = engine.accept(peer, echo, move |engine, stream| {
        echo(engine, stream);
        if stats && engine.write_is_closed(stream) {
            print_stats(engine, stream.peer());
        }
    }) {
        if let Err(e) = engine.set_stream_context(stream, Vec::<u8>::new()) {
            warn!("Cannot track stream {}: {}", stream, e);
        }
        echo(engine, stream);
    }
}

fn run_server(engine: &mut Engine, bind: SocketAddr, stats: bool) -> Result<()> {
    let listener = engine.listen(bind, move |engine, peer| {
        accept_echo_streams(engine, peer, stats);
        let later = move |engine: &mut Engine, peer: PeerHandle| accept_echo_streams(engine, peer, stats);
        if let Err(e) = engine.set_peer_acceptable(peer, later) {
            warn!("Cannot watch {} for new streams: {}", peer, e);
        }
    })?;

    info!(
        "Echo server listening on {}",
        engine.listener_local_addr(listener).unwrap_or(bind)
    );
    engine.run()?;
    Ok(())
}

/// Move whatever is readable back out, holding the remainder while the
/// stream is blocked on writing
fn echo(engine: &mut Engine, stream: StreamHandle) {
    let mut buf = [0u8; 4096];
    loop {
        let mut pending = engine
            .stream_context_mut::<Vec<u8>>(stream)
            .map(std::mem::take)
            .unwrap_or_default();
        while !pending.is_empty() {
            match engine.write(stream, &pending) {
                Ok(0) | Err(_) => break,
                Ok(written) => {
                    pending.drain(..written);
                }
            }
        }
        let blocked = !pending.is_empty();
        if let Some(slot) = engine.stream_context_mut::<Vec<u8>>(stream) {
            *slot = pending;
        }
        if blocked {
            return;
        }

        let read = engine.read(stream, &mut buf);
        if read == 0 {
            break;
        }
        if let Some(slot) = engine.stream_context_mut::<Vec<u8>>(stream) {
            slot.extend_from_slice(&buf[..read]);
        }
    }

    if engine.read_is_closed(stream) && !engine.write_is_closed(stream) {
        engine.write_close(stream);
    }
}

struct Exchange {
    outgoing: Vec<u8>,
    received: Vec<u8>,
    done: bool,
}

fn run_client(engine: &mut Engine, endpoint: SocketAddr, message: String, timeout: Duration, stats: bool) -> Result<()> {
    let exchange = Rc::new(RefCell::new(Exchange {
        outgoing: message.into_bytes(),
        received: Vec::new(),
        done: false,
    }));

    let peer = engine.open(endpoint, |_, _| {})?;
    let sender = exchange.clone();
    let receiver = exchange.clone();
    let stream = engine.connect(
        peer,
        move |engine, stream| send(engine, stream, &mut sender.borrow_mut()),
        move |engine, stream| {
            let mut exchange = receiver.borrow_mut();
            let mut buf = [0u8; 4096];
            loop {
                let read = engine.read(stream, &mut buf);
                if read == 0 {
                    break;
                }
                exchange.received.extend_from_slice(&buf[..read]);
            }
            if engine.read_is_closed(stream) && !exchange.done {
                exchange.done = true;
                if stats {
                    print_stats(engine, stream.peer());
                }
                engine.break_loop();
            }
        },
    )?;
    send(engine, stream, &mut exchange.borrow_mut());

    engine.loop_with_timeout(Some(timeout))?;

    let exchange = exchange.borrow();
    anyhow::ensure!(exchange.done, "No echo from {} within {:?}", endpoint, timeout);
    println!("{}", String::from_utf8_lossy(&exchange.received));
    engine.close();
    Ok(())
}

fn send(engine: &mut Engine, stream: StreamHandle, exchange: &mut Exchange) {
    while !exchange.outgoing.is_empty() {
        match engine.write(stream, &exchange.outgoing) {
            Ok(0) | Err(_) => return,
            Ok(written) => {
                exchange.outgoing.drain(..written);
            }
        }
    }
    if !engine.write_is_closed(stream) {
        engine.write_close(stream);
    }
}

fn print_stats(engine: &Engine, peer: PeerHandle) {
    let Some(stats) = engine.peer_stats(peer) else {
        return;
    };
    match serde_json::to_string(&stats) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("Cannot serialise statistics: {}", e),
    }
}
