// ===============================
// src/main.rs
// ===============================
//
// Wiring: one session task per stream (QUOTE 5201 / TRADE 5202), one engine
// task that owns all shared state, an optional JSONL recorder, and the
// Prometheus metrics responder. Callers integrate through EngineHandle
// (typed commands + read-only snapshots); this binary just keeps the bridge
// alive and logs a periodic ledger summary.

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};
use tracing::info;

use fix_bridge_rust::config;
use fix_bridge_rust::domain::{EngineSnapshot, Event, StreamKind};
use fix_bridge_rust::engine::{self, Engine, EngineHandle};
use fix_bridge_rust::metrics;
use fix_bridge_rust::orders::TradeCommand;
use fix_bridge_rust::recorder;
use fix_bridge_rust::session::{self, SessionCommand, SessionConfig, SessionEvent};

fn session_config(args: &config::Args, kind: StreamKind) -> SessionConfig {
    SessionConfig {
        kind,
        host: args.host.clone(),
        port: match kind {
            StreamKind::Quote => args.quote_port,
            StreamKind::Trade => args.trade_port,
        },
        sender_comp_id: args.sender_comp_id(),
        username: args.login.clone(),
        password: args.password.clone(),
        heartbeat_secs: args.heartbeat_secs,
        probe_host: args.probe_host.clone(),
        probe_port: args.probe_port,
    }
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt().with_env_filter("info").init();

    // ---- Load config ----
    let args = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    info!(
        host = %args.host,
        broker = %args.broker,
        login = %args.login,
        currency = %args.currency,
        symbols = ?args.symbols,
        quote_port = args.quote_port,
        trade_port = args.trade_port,
        "startup config"
    );

    // ---- Buses ----
    let (ev_tx, ev_rx) = mpsc::channel::<SessionEvent>(4096);
    let (quote_tx, quote_rx) = mpsc::channel::<SessionCommand>(1024);
    let (trade_tx, trade_rx) = mpsc::channel::<SessionCommand>(1024);
    let (cmd_tx, cmd_rx) = mpsc::channel::<TradeCommand>(256);
    let (snap_tx, snap_rx) = watch::channel(EngineSnapshot::default());

    // ---- Recorder (optional) ----
    let rec_tx = args.record_file.clone().map(|path| {
        let (tx, rx) = mpsc::channel::<Event>(8192);
        tokio::spawn(recorder::run(rx, path));
        tx
    });

    // ---- Sessions (one task per stream) ----
    tokio::spawn(session::run(
        session_config(&args, StreamKind::Quote),
        quote_rx,
        ev_tx.clone(),
    ));
    tokio::spawn(session::run(
        session_config(&args, StreamKind::Trade),
        trade_rx,
        ev_tx.clone(),
    ));

    // ---- Engine (single writer for catalog/quotes/ledger) ----
    let eng = Engine::new(
        args.currency.clone(),
        args.client_label.clone(),
        args.symbols.clone(),
    );
    tokio::spawn(engine::run(
        eng,
        ev_rx,
        cmd_rx,
        quote_tx.clone(),
        trade_tx.clone(),
        snap_tx,
        rec_tx,
    ));

    let handle = EngineHandle::new(cmd_tx, snap_rx);

    // ---- Ledger heartbeat + graceful logout on ctrl-c ----
    let mut tick = interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let snap = handle.snapshot();
                info!(
                    positions = snap.positions.len(),
                    orders = snap.orders.len(),
                    quotes = snap.quotes.len(),
                    "ledger snapshot"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down, logging out");
                let _ = quote_tx.send(SessionCommand::Logout).await;
                let _ = trade_tx.send(SessionCommand::Logout).await;
                break;
            }
        }
    }
}
