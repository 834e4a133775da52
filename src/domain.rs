// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};

/// Stream kind. One FIX session exists per kind, each with its own socket
/// and its own outgoing sequence counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Quote,
    Trade,
}

impl StreamKind {
    /// Sub-id carried in tags 50/57 of every message on this stream.
    pub fn sub_id(&self) -> &'static str {
        match self {
            StreamKind::Quote => "QUOTE",
            StreamKind::Trade => "TRADE",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Quote => "quote",
            StreamKind::Trade => "trade",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn to_fix(&self) -> &'static str {
        match self {
            Side::Buy => "1",
            Side::Sell => "2",
        }
    }

    pub fn from_fix(v: &str) -> Option<Side> {
        match v {
            "1" => Some(Side::Buy),
            "2" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

impl OrderType {
    pub fn to_fix(&self) -> &'static str {
        match self {
            OrderType::Market => "1",
            OrderType::Limit => "2",
            OrderType::Stop => "3",
        }
    }

    pub fn from_fix(v: &str) -> Option<OrderType> {
        match v {
            "1" => Some(OrderType::Market),
            "2" => Some(OrderType::Limit),
            "3" => Some(OrderType::Stop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Gtd,
}

impl TimeInForce {
    pub fn from_fix(v: &str) -> Option<TimeInForce> {
        match v {
            "1" => Some(TimeInForce::Gtc),
            "3" => Some(TimeInForce::Ioc),
            "6" => Some(TimeInForce::Gtd),
            _ => None,
        }
    }
}

/// OrdStatus (tag 39).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn from_fix(v: &str) -> Option<OrderStatus> {
        match v {
            "0" => Some(OrderStatus::New),
            "1" => Some(OrderStatus::PartiallyFilled),
            "2" => Some(OrderStatus::Filled),
            "4" => Some(OrderStatus::Cancelled),
            "8" => Some(OrderStatus::Rejected),
            "C" => Some(OrderStatus::Expired),
            _ => None,
        }
    }
}

/// ExecType (tag 150).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecType {
    New,
    Canceled,
    Replaced,
    Rejected,
    Expired,
    Trade,
    OrderStatus,
}

impl ExecType {
    pub fn from_fix(v: &str) -> Option<ExecType> {
        match v {
            "0" => Some(ExecType::New),
            "4" => Some(ExecType::Canceled),
            "5" => Some(ExecType::Replaced),
            "8" => Some(ExecType::Rejected),
            "C" => Some(ExecType::Expired),
            "F" => Some(ExecType::Trade),
            "I" => Some(ExecType::OrderStatus),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExecType::New => "new",
            ExecType::Canceled => "canceled",
            ExecType::Replaced => "replaced",
            ExecType::Rejected => "rejected",
            ExecType::Expired => "expired",
            ExecType::Trade => "trade",
            ExecType::OrderStatus => "order_status",
        }
    }
}

/// One tradable instrument from the venue security list. Immutable once
/// loaded; `digits` is the price decimal precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Security {
    pub id: i64,
    pub name: String,
    pub digits: u32,
}

/// Best bid/ask cache entry, last write wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketQuote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub ts_ms: i64,
}

/// Conversion of a position's quote currency into the account currency.
/// `inverse` means the pair is account/quote and the rate must be divided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub pair: String,
    pub inverse: bool,
}

/// An open position, keyed by the venue-assigned position id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub pos_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub cost_price: f64,
    pub digits: u32,
    pub convert: Option<Conversion>,
    /// Client order id that opened the position, when known.
    pub cl_ord_id: Option<String>,
}

/// An open order, keyed by the venue-assigned order id. `cl_ord_id` is
/// client-generated and never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub cl_ord_id: String,
    pub pos_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: f64,
    pub filled_qty: f64,
    pub leaves_qty: f64,
    pub status: OrderStatus,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: Option<TimeInForce>,
    pub digits: u32,
}

/// Parsed ExecutionReport (35=8) fields the ledger cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecReport {
    pub exec_type: ExecType,
    pub order_id: Option<String>,
    pub cl_ord_id: Option<String>,
    pub pos_id: Option<String>,
    pub symbol: Option<String>,
    pub digits: u32,
    pub side: Option<Side>,
    pub order_type: Option<OrderType>,
    pub qty: f64,
    pub cum_qty: f64,
    pub leaves_qty: f64,
    pub status: Option<OrderStatus>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: Option<TimeInForce>,
    pub text: Option<String>,
}

/// Parsed PositionReport (35=AP).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionReport {
    pub pos_id: String,
    pub symbol: String,
    pub digits: u32,
    pub side: Side,
    pub quantity: f64,
    pub cost_price: f64,
    /// TotalNumPosReports (727): size of the full-refresh batch this report
    /// belongs to, 0 when the venue does not send it.
    pub total_reports: usize,
}

/// Events written to the JSONL recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Quote(MarketQuote),
    Exec(ExecReport),
    Position(Position),
    Note(String),
}

/// Read-only snapshot of engine state for display/telemetry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub ts_ms: i64,
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
    pub quotes: Vec<MarketQuote>,
}
