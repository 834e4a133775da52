// ===============================
// src/config.rs
// ===============================
use dotenvy::dotenv;
use std::env;

/// Runtime configuration, read once at startup and passed into the session
/// and engine constructors. No module-level globals.
#[derive(Clone, Debug)]
pub struct Args {
    // account / venue
    pub host: String,
    pub broker: String, // e.g. "demo.icmarkets"
    pub login: String,
    pub password: String,
    pub currency: String, // account base currency, e.g. "USD"
    pub client_label: String, // Designation (494) stamped on orders

    // transport
    pub quote_port: u16, // default 5201
    pub trade_port: u16, // default 5202
    pub heartbeat_secs: u64,

    // initial spot subscriptions: SYMBOLS=EURUSD,GBPUSD
    pub symbols: Vec<String>,

    // reachability probe used to decide reconnect vs. fatal
    pub probe_host: String,
    pub probe_port: u16,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,
}

impl Args {
    /// SenderCompID (49): broker and login joined with a dot.
    pub fn sender_comp_id(&self) -> String {
        format!("{}.{}", self.broker, self.login)
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

pub fn load() -> Args {
    // Make sure .env is read (FIX_HOST, SYMBOLS, RECORD_FILE, ...).
    let _ = dotenv();

    // ===== Account =====
    let host = env::var("FIX_HOST").expect("FIX_HOST missing");
    let broker = env::var("FIX_BROKER").expect("FIX_BROKER missing");
    let login = env::var("FIX_LOGIN").expect("FIX_LOGIN missing");
    let password = env::var("FIX_PASSWORD").expect("FIX_PASSWORD missing");
    let currency = env_or("FIX_CURRENCY", "USD").to_ascii_uppercase();
    let client_label = env_or("FIX_CLIENT_LABEL", "fix_bridge_rust");

    // ===== Transport =====
    let quote_port = env_parse("FIX_QUOTE_PORT", 5201);
    let trade_port = env_parse("FIX_TRADE_PORT", 5202);
    let heartbeat_secs = env_parse("FIX_HEARTBEAT_SECS", 30);

    // Multi-symbol: SYMBOLS=EURUSD,GBPUSD,XAUUSD
    let symbols: Vec<String> = env::var("SYMBOLS")
        .ok()
        .map(|s| {
            s.split(',')
                .map(|x| x.trim())
                .filter(|x| !x.is_empty())
                .map(|x| x.to_ascii_uppercase())
                .collect()
        })
        .unwrap_or_default();

    // ===== Probe / observability =====
    let probe_host = env_or("PROBE_HOST", "www.google.com");
    let probe_port = env_parse("PROBE_PORT", 80);
    let record_file = env::var("RECORD_FILE").ok();
    let metrics_port = env_parse("METRICS_PORT", 9898);

    Args {
        host,
        broker,
        login,
        password,
        currency,
        client_label,
        quote_port,
        trade_port,
        heartbeat_secs,
        symbols,
        probe_host,
        probe_port,
        record_file,
        metrics_port,
    }
}
