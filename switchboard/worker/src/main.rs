//! Switchboard worker
//!
//! Runs one dispatch worker with an echo actor, optionally handing accepted
//! connections to worker threads over fd handoff links.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tracing::{info, warn};

use switchboard_worker::constants::{DEFAULT_LISTEN_ADDR, MAX_WORKER_INDEX};
use switchboard_worker::structured_logging::{init_worker_tracing, worker_span};
use switchboard_worker::{
    Actor, ChannelClosed, CodecKind, Dispatcher, DispatcherConfig, Envelope, Identity, ListenMode, WorkerConfig,
};

#[derive(Parser)]
#[command(name = "switchboard-worker")]
#[command(about = "Connection dispatch worker")]
struct Args {
    /// Enable development logging to the default log file
    #[arg(long, global = true)]
    dev_log: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run a worker that echoes every message back to its sender
    Serve {
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        listen: Option<SocketAddr>,

        #[arg(long, value_enum)]
        codec: Option<CodecKind>,

        /// Accept attempts allowed per source address per window (0 disables)
        #[arg(long)]
        flood_threshold: Option<u32>,

        /// Idle timeout in seconds (0 disables)
        #[arg(long)]
        idle_timeout: Option<u64>,

        #[arg(long)]
        worker_index: Option<u32>,

        /// Hand accepted connections to this many worker threads
        #[arg(long, default_value = "0")]
        workers: u32,
    },

    /// Parse an identity and print its parts
    Probe { identity: String },
}

/// Replies to every message with the message itself
struct Echo;

impl Actor for Echo {
    fn on_message(&mut self, dispatcher: &mut Dispatcher, fd: RawFd, envelope: Envelope) {
        if let Err(e) = dispatcher.send_to(fd, &envelope) {
            warn!(fd, "echo failed: {}", e);
        }
    }

    fn on_channel_closed(&mut self, _dispatcher: &mut Dispatcher, closed: &ChannelClosed) {
        match closed.error() {
            Some(e) => warn!(channel = %closed.channel, "channel lost: {}", e),
            None => info!(channel = %closed.channel, reason = %closed.reason, "channel closed"),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Dropping this guard flushes any buffered dev-log lines.
    let flush_guard = init_worker_tracing(args.dev_log)
        .map_err(|e| anyhow!("failed to initialize tracing: {}", e))?;

    match args.command {
        Command::Serve {
            config,
            listen,
            codec,
            flood_threshold,
            idle_timeout,
            worker_index,
            workers,
        } => {
            let mut worker_config = match &config {
                Some(path) => WorkerConfig::load(path)
                    .with_context(|| format!("failed to load config from {}", path.display()))?,
                None => WorkerConfig::default(),
            };
            worker_config.listen = listen.or(worker_config.listen);
            worker_config.codec = codec.or(worker_config.codec);
            worker_config.flood_threshold = flood_threshold.or(worker_config.flood_threshold);
            worker_config.idle_timeout_secs = idle_timeout.or(worker_config.idle_timeout_secs);
            worker_config.worker_index = worker_index.or(worker_config.worker_index);

            serve(worker_config, workers)?;
        }
        Command::Probe { identity } => {
            let parsed: Identity = identity.parse()?;
            println!("host:         {}", parsed.host);
            println!("port:         {}", parsed.port);
            match parsed.worker_index {
                Some(index) => println!("worker index: {}", index),
                None => println!("worker index: none"),
            }
        }
    }

    std::mem::drop(flush_guard);
    Ok(())
}

fn serve(config: WorkerConfig, workers: u32) -> Result<()> {
    let worker_index = config.worker_index.unwrap_or(0);
    if worker_index.saturating_add(workers) >= MAX_WORKER_INDEX {
        bail!(
            "worker indices {}..={} exceed the limit of {}",
            worker_index,
            worker_index + workers,
            MAX_WORKER_INDEX - 1
        );
    }
    let listen = match config.listen {
        Some(addr) => addr,
        None => DEFAULT_LISTEN_ADDR.parse().context("invalid default listen address")?,
    };
    let codec = config.codec.unwrap_or(CodecKind::Json);
    let dispatcher_config = config.dispatcher_config();

    let mut links = Vec::new();
    let mut handles = Vec::new();
    for offset in 1..=workers {
        let (acceptor_side, worker_side) = UnixStream::pair().context("failed to create control link")?;
        links.push(acceptor_side);

        let thread_config = dispatcher_config.clone();
        let nodes = config.nodes.clone();
        let span = worker_span(worker_index + offset);
        let handle = thread::Builder::new()
            .name(format!("worker-{}", worker_index + offset))
            .spawn(move || -> Result<()> {
                let _entered = span.entered();
                let mut dispatcher = build_dispatcher(thread_config, &nodes)?;
                dispatcher.attach_control(worker_side)?;
                dispatcher.run()?;
                Ok(())
            })
            .context("failed to spawn worker thread")?;
        handles.push(handle);
    }

    let _entered = worker_span(worker_index).entered();
    let mut dispatcher = build_dispatcher(dispatcher_config, &config.nodes)?;
    let mode = if workers > 0 {
        ListenMode::Transfer
    } else {
        ListenMode::Local
    };
    for link in links {
        dispatcher
            .add_worker_link(link)
            .context("failed to configure worker link")?;
    }
    let bound = dispatcher
        .listen(listen, codec, mode)
        .with_context(|| format!("failed to listen on {}", listen))?;
    info!(%bound, ?codec, workers, "worker ready");

    dispatcher.run()?;

    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow!("worker thread panicked"))??;
    }
    Ok(())
}

fn build_dispatcher(config: DispatcherConfig, nodes: &BTreeMap<String, Vec<String>>) -> Result<Dispatcher> {
    let mut dispatcher = Dispatcher::new(config)?;
    dispatcher.set_actor(Box::new(Echo));
    for (node_type, identities) in nodes {
        for identity in identities {
            dispatcher
                .add_node_identity(node_type, identity)
                .with_context(|| format!("invalid identity for node type {}", node_type))?;
        }
    }
    dispatcher.init()?;
    Ok(dispatcher)
}
