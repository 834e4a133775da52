// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Session health --------
pub static SESSION_UP: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("fix_session_up", "1 while the session is logged on"),
        &["stream"],
    )
    .unwrap()
});

pub static RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fix_reconnects_total", "reconnect attempts per stream"),
        &["stream"],
    )
    .unwrap()
});

// -------- Message traffic --------
pub static MSGS_IN: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fix_messages_in_total", "decoded inbound messages"),
        &["stream"],
    )
    .unwrap()
});

pub static MSGS_OUT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fix_messages_out_total", "encoded outbound messages"),
        &["stream"],
    )
    .unwrap()
});

pub static PROTO_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "fix_protocol_errors_total",
        "messages dropped for framing/checksum/parse errors",
    )
    .unwrap()
});

// -------- Reconciliation --------
pub static EXECS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("exec_reports_total", "execution reports by exec type"),
        &["exec_type"],
    )
    .unwrap()
});

pub static OPEN_POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_positions", "positions in the ledger").unwrap());

pub static OPEN_ORDERS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_orders", "pending orders in the ledger").unwrap());

pub static SUBSCRIBED_SYMBOLS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("subscribed_symbols", "active market data subscriptions").unwrap()
});

pub static QUOTE_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("quote_updates_total", "market quote updates per symbol"),
        &["symbol"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(SESSION_UP.clone())),
        REGISTRY.register(Box::new(RECONNECTS.clone())),
        REGISTRY.register(Box::new(MSGS_IN.clone())),
        REGISTRY.register(Box::new(MSGS_OUT.clone())),
        REGISTRY.register(Box::new(PROTO_ERRORS.clone())),
        REGISTRY.register(Box::new(EXECS.clone())),
        REGISTRY.register(Box::new(OPEN_POSITIONS.clone())),
        REGISTRY.register(Box::new(OPEN_ORDERS.clone())),
        REGISTRY.register(Box::new(SUBSCRIBED_SYMBOLS.clone())),
        REGISTRY.register(Box::new(QUOTE_UPDATES.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .unwrap_or_else(|e| panic!("metrics bind {} failed: {}", addr, e));
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}
