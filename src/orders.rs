// ===============================
// src/orders.rs
// ===============================
//
// Order command API: typed commands consumed by the engine, and pure FIX
// body construction for order entry, cancels and close-position commands.
// Everything here is validated locally against the security catalog before
// a single byte goes out.

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{Order, OrderType, Position, Security, Side};
use crate::fix::{self, field};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
    #[error("price required for limit/stop orders")]
    MissingPrice,
    #[error("unknown order id: {0}")]
    UnknownOrder(String),
    #[error("unknown position id: {0}")]
    UnknownPosition(String),
    #[error("{0} session not logged on")]
    NotConnected(&'static str),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("timed out waiting for venue report")]
    Timeout,
    #[error("engine stopped")]
    EngineClosed,
}

/// Commands consumed by the engine task. Each carries a oneshot for the
/// caller's typed result; fan-out commands reply with the client order ids
/// they produced. Fan-outs are not transactional: cancels already queued
/// stay in flight if a later one fails.
#[derive(Debug)]
pub enum TradeCommand {
    Open {
        symbol: String,
        side: Side,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
        pos_id: Option<String>,
        reply: oneshot::Sender<Result<String, CommandError>>,
    },
    Cancel {
        order_id: String,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    CancelAllForPosition {
        pos_id: String,
        reply: oneshot::Sender<Result<Vec<String>, CommandError>>,
    },
    CancelAllForSymbol {
        symbol: String,
        reply: oneshot::Sender<Result<Vec<String>, CommandError>>,
    },
    CancelAllForSymbols {
        symbols: Vec<String>,
        reply: oneshot::Sender<Result<Vec<String>, CommandError>>,
    },
    CancelAll {
        reply: oneshot::Sender<Result<Vec<String>, CommandError>>,
    },
    ClosePosition {
        pos_id: String,
        quantity: Option<f64>,
        reply: oneshot::Sender<Result<String, CommandError>>,
    },
    CloseAllPositions {
        reply: oneshot::Sender<Result<Vec<String>, CommandError>>,
    },
    CloseAllForSymbol {
        symbol: String,
        reply: oneshot::Sender<Result<Vec<String>, CommandError>>,
    },
    CloseAllForSymbols {
        symbols: Vec<String>,
        reply: oneshot::Sender<Result<Vec<String>, CommandError>>,
    },
    Subscribe {
        symbol: String,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    /// Resolve the venue position id assigned to a client order id, once
    /// the reconciliation sees the corresponding report.
    AwaitPositionId {
        cl_ord_id: String,
        reply: oneshot::Sender<Result<String, CommandError>>,
    },
}

/// Generate a client order id: unique per session, never assigned by the
/// venue, never reused.
pub fn gen_cl_ord_id() -> String {
    let ts = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    format!("CL-{}-{}", ts, rand::thread_rng().gen::<u32>())
}

/// Format a price with the instrument's decimal digits.
pub fn fmt_px(px: f64, digits: u32) -> String {
    format!("{:.*}", digits as usize, px)
}

/// Quantities are integral units for FX, fractional for metals/crypto.
pub fn fmt_qty(q: f64) -> String {
    if q.fract() == 0.0 {
        format!("{}", q as i64)
    } else {
        format!("{q}")
    }
}

/// NewOrderSingle (35=D) body. Limit orders carry Price (44), stop orders
/// StopPx (99), market orders neither; a position id attaches the order to
/// an existing position (close, partial close, protection).
pub fn new_order_fields(
    sec: &Security,
    side: Side,
    order_type: OrderType,
    quantity: f64,
    price: Option<f64>,
    pos_id: Option<&str>,
    cl_ord_id: &str,
    label: &str,
) -> Result<Vec<(u32, String)>, CommandError> {
    let mut f = vec![
        (field::CL_ORD_ID, cl_ord_id.to_string()),
        (field::SYMBOL, sec.id.to_string()),
        (field::SIDE, side.to_fix().to_string()),
        (field::TRANSACT_TIME, fix::fix_time()),
        (field::ORDER_QTY, fmt_qty(quantity)),
        (field::ORD_TYPE, order_type.to_fix().to_string()),
    ];
    match order_type {
        OrderType::Limit => {
            let px = price.ok_or(CommandError::MissingPrice)?;
            f.push((field::PRICE, fmt_px(px, sec.digits)));
        }
        OrderType::Stop => {
            let px = price.ok_or(CommandError::MissingPrice)?;
            f.push((field::STOP_PX, fmt_px(px, sec.digits)));
        }
        OrderType::Market => {}
    }
    if let Some(p) = pos_id {
        f.push((field::POS_MAINT_RPT_ID, p.to_string()));
    }
    f.push((field::DESIGNATION, format!("ClientID: {label}")));
    Ok(f)
}

/// OrderCancelRequest (35=F) body for one pending order.
pub fn cancel_fields(order: &Order, cl_ord_id: &str) -> Vec<(u32, String)> {
    vec![
        (field::ORIG_CL_ORD_ID, order.cl_ord_id.clone()),
        (field::ORDER_ID, order.order_id.clone()),
        (field::CL_ORD_ID, cl_ord_id.to_string()),
    ]
}

/// Close a position: opposite-direction market order for the full (or
/// given) quantity, tagged with the venue position id.
pub fn close_position_fields(
    pos: &Position,
    sec: &Security,
    quantity: Option<f64>,
    cl_ord_id: &str,
    label: &str,
) -> Result<Vec<(u32, String)>, CommandError> {
    new_order_fields(
        sec,
        pos.side.opposite(),
        OrderType::Market,
        quantity.unwrap_or(pos.quantity),
        None,
        Some(&pos.pos_id),
        cl_ord_id,
        label,
    )
}

/// MarketDataRequest (35=V) subscribing to best bid/ask for one symbol id.
pub fn market_data_subscribe_fields(sec: &Security, req_id: u64) -> Vec<(u32, String)> {
    vec![
        (field::MD_REQ_ID, req_id.to_string()),
        (field::SUBSCRIPTION_REQUEST_TYPE, "1".to_string()),
        (field::MARKET_DEPTH, "1".to_string()),
        (field::NO_MD_ENTRY_TYPES, "2".to_string()),
        (field::MD_ENTRY_TYPE, "0".to_string()),
        (field::MD_ENTRY_TYPE, "1".to_string()),
        (field::NO_RELATED_SYM, "1".to_string()),
        (field::SYMBOL, sec.id.to_string()),
    ]
}

/// SecurityListRequest (35=x): full symbol catalog.
pub fn security_list_request_fields(req_id: &str) -> Vec<(u32, String)> {
    vec![
        (field::SECURITY_REQ_ID, req_id.to_string()),
        (field::SECURITY_LIST_REQUEST_TYPE, "0".to_string()),
    ]
}

/// OrderMassStatusRequest (35=AF): status of all working orders.
pub fn order_mass_status_fields(req_id: &str) -> Vec<(u32, String)> {
    vec![
        (field::MASS_STATUS_REQ_ID, req_id.to_string()),
        (field::MASS_STATUS_REQ_TYPE, "7".to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eurusd() -> Security {
        Security {
            id: 1,
            name: "EURUSD".into(),
            digits: 5,
        }
    }

    #[test]
    fn market_order_has_no_price_field() {
        let f = new_order_fields(
            &eurusd(),
            Side::Buy,
            OrderType::Market,
            10000.0,
            None,
            None,
            "CL-1",
            "tester",
        )
        .unwrap();
        assert!(f.iter().all(|(t, _)| *t != field::PRICE && *t != field::STOP_PX));
        assert!(f.contains(&(field::ORD_TYPE, "1".to_string())));
        assert!(f.contains(&(field::ORDER_QTY, "10000".to_string())));
    }

    #[test]
    fn limit_without_price_is_rejected_locally() {
        let err = new_order_fields(
            &eurusd(),
            Side::Buy,
            OrderType::Limit,
            1000.0,
            None,
            None,
            "CL-1",
            "tester",
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::MissingPrice));
    }

    #[test]
    fn limit_price_uses_symbol_digits() {
        let f = new_order_fields(
            &eurusd(),
            Side::Sell,
            OrderType::Limit,
            1000.0,
            Some(1.08),
            None,
            "CL-1",
            "tester",
        )
        .unwrap();
        assert!(f.contains(&(field::PRICE, "1.08000".to_string())));
    }

    #[test]
    fn stop_price_goes_to_stop_px() {
        let f = new_order_fields(
            &eurusd(),
            Side::Sell,
            OrderType::Stop,
            1000.0,
            Some(1.05),
            None,
            "CL-1",
            "tester",
        )
        .unwrap();
        assert!(f.contains(&(field::STOP_PX, "1.05000".to_string())));
        assert!(f.iter().all(|(t, _)| *t != field::PRICE));
    }

    #[test]
    fn close_position_inverts_side_and_tags_position() {
        let pos = Position {
            pos_id: "P".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            quantity: 10000.0,
            cost_price: 1.08,
            digits: 5,
            convert: None,
            cl_ord_id: None,
        };
        let f = close_position_fields(&pos, &eurusd(), None, "CL-2", "tester").unwrap();
        assert!(f.contains(&(field::SIDE, "2".to_string())));
        assert!(f.contains(&(field::ORDER_QTY, "10000".to_string())));
        assert!(f.contains(&(field::POS_MAINT_RPT_ID, "P".to_string())));
        assert!(f.contains(&(field::ORD_TYPE, "1".to_string())));
    }

    #[test]
    fn cl_ord_ids_are_unique() {
        let a = gen_cl_ord_id();
        let b = gen_cl_ord_id();
        assert_ne!(a, b);
        assert!(a.starts_with("CL-"));
    }

    #[test]
    fn fractional_quantities_keep_their_fraction() {
        assert_eq!(fmt_qty(0.01), "0.01");
        assert_eq!(fmt_qty(100.0), "100");
    }
}
