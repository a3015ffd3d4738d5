//! Node entry point: parse the CLI/env surface, bootstrap the
//! transport/log-store/metrics collaborators, and run the single-writer
//! driver loop until a shutdown signal arrives (spec §6.2).

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use sraft::config::{Cli, Config};
use sraft::logstore::FileLogStore;
use sraft::metrics::{MetricEvent, MetricsSink, NdjsonMetricsSink, NullMetricsSink};
use sraft::raft::{AdminCommand, Engine, Event};
use sraft::transport::TcpTransport;
use sraft::NodeId;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let debug = cli.debug;
    init_tracing(debug);

    let config = match Config::from_cli(cli) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    if let Err(e) = run(config).await {
        error!(error = %e, "node exited with error");
        std::process::exit(1);
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("SRAFT_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: Config) -> sraft::Result<()> {
    info!(node_id = config.node_id, bind = %config.bind_addr, "starting node");

    let wal_path = std::env::temp_dir().join(format!("sraft-node-{}.wal", config.node_id));
    let log = FileLogStore::open(&wal_path, true)?;

    let other_peers: std::collections::HashMap<_, _> = config
        .peers
        .iter()
        .filter(|(&id, _)| id != config.node_id)
        .map(|(&id, &addr)| (id, addr))
        .collect();
    let (transport, mut inbound) =
        TcpTransport::bind(config.node_id, config.bind_addr, other_peers).await?;

    let metrics: Arc<dyn MetricsSink> = match &config.metrics_path {
        Some(path) => Arc::new(NdjsonMetricsSink::create(path)?),
        None => Arc::new(NullMetricsSink),
    };

    let mut engine = Engine::new(
        config.node_id,
        config.peer_ids(),
        config.knobs.clone(),
        log,
        transport,
        SharedMetricsSink(metrics),
    );

    let (admin_tx, mut admin_rx) = mpsc::unbounded_channel::<AdminCommand>();
    tokio::spawn(stdin_admin_loop(admin_tx));

    let mut shutdown = signal_stream();

    loop {
        let deadline: tokio::time::Instant = engine.timer_deadline().into();
        let epoch = engine.timer_epoch();

        tokio::select! {
            Some(msg) = inbound.recv() => {
                engine.handle(Event::Inbound(msg));
            }
            _ = tokio::time::sleep_until(deadline) => {
                engine.handle(Event::Timer { epoch });
            }
            Some(cmd) = admin_rx.recv() => {
                if let AdminCommand::Shutdown(reply) = cmd {
                    info!("shutdown requested via admin command");
                    let _ = reply.send(());
                    log_final_state(&engine);
                    break;
                }
                engine.handle(Event::Admin(cmd));
            }
            _ = shutdown.recv() => {
                info!("shutdown signal received");
                log_final_state(&engine);
                break;
            }
        }
    }

    Ok(())
}

fn log_final_state<T, L, M>(engine: &Engine<T, L, M>)
where
    T: sraft::transport::Transport,
    L: sraft::logstore::LogStore,
    M: MetricsSink,
{
    let snapshot = engine.snapshot();
    info!(
        role = ?snapshot.role,
        term = snapshot.term,
        commit_index = snapshot.commit_index,
        "final state"
    );
}

/// Reads newline-delimited admin commands from stdin for local testing
/// (spec's admin surface has no external transport of its own — this is
/// a development convenience, not part of the protocol).
async fn stdin_admin_loop(tx: mpsc::UnboundedSender<AdminCommand>) {
    use tokio::io::{AsyncBufReadExt, BufReader};
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line == "shutdown" {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            if tx.send(AdminCommand::Shutdown(reply_tx)).is_err() {
                break;
            }
            let _ = reply_rx.await;
            break;
        } else if line == "status" {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            if tx.send(AdminCommand::DumpState(reply_tx)).is_err() {
                break;
            }
            if let Ok(snapshot) = reply_rx.await {
                println!(
                    "node={} role={:?} term={} commit_index={}",
                    snapshot.id, snapshot.role, snapshot.term, snapshot.commit_index
                );
            }
        } else if let Some(payload) = line.strip_prefix("propose ") {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            if tx
                .send(AdminCommand::Propose(payload.as_bytes().to_vec(), reply_tx))
                .is_err()
            {
                break;
            }
            match reply_rx.await {
                Ok(Ok(index)) => println!("accepted at index {index}"),
                Ok(Err(e)) => println!("rejected: {e}"),
                Err(_) => break,
            }
        }
    }
}

/// Collapses Ctrl-C and SIGTERM into a single one-shot-style receiver.
fn signal_stream() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = tx.send(()).await;
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Adapts an `Arc<dyn MetricsSink>` to `MetricsSink` so `Engine` can own it
/// by value.
struct SharedMetricsSink(Arc<dyn MetricsSink>);

impl MetricsSink for SharedMetricsSink {
    fn record(&self, node_id: NodeId, timestamp_ms: u64, event: MetricEvent) {
        self.0.record(node_id, timestamp_ms, event);
    }
}
