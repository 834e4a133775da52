// ===============================
// src/ledger.rs
// ===============================
//
// Position/order ledger. Reconciles execution reports and position reports
// into records keyed by venue-assigned ids, cross-referenced to the
// client-generated order ids that created them. Only the engine task writes
// here; both sessions' traffic funnels through that single writer.

use ahash::AHashMap as HashMap;
use tracing::debug;

use crate::catalog::SecurityCatalog;
use crate::domain::{
    ExecReport, ExecType, Order, OrderStatus, OrderType, Position, PositionReport, Side,
    TimeInForce,
};
use crate::fix::{field, FixMessage};

/// Side effects the engine must carry out after applying an exec report.
#[derive(Debug, Default)]
pub struct ExecEffects {
    /// ClOrdID -> venue position id binding established by this report.
    pub bound_position: Option<(String, String)>,
    /// Symbol to spot-subscribe on first reference.
    pub subscribe: Option<String>,
    /// Venue position state changed; an immediate refresh is warranted.
    pub refresh_positions: bool,
    /// Command-level rejection to surface to the caller: (ClOrdID, reason).
    pub rejected: Option<(String, String)>,
}

/// PositionReport parse result. `Empty` is the venue's "no positions"
/// answer (PosReqResult=2) and produces no record.
#[derive(Debug)]
pub enum PositionParse {
    Empty,
    Report(PositionReport),
}

/// Parse an ExecutionReport (35=8). Returns `None` when the message lacks
/// an ExecType or references a symbol id the catalog does not know.
pub fn parse_exec_report(m: &FixMessage, catalog: &SecurityCatalog) -> Option<ExecReport> {
    let exec_type = ExecType::from_fix(m.get(field::EXEC_TYPE)?)?;

    let mut symbol = None;
    let mut digits = 5;
    if let Some(id) = m.get_i64(field::SYMBOL) {
        let sec = catalog.by_id(id)?;
        symbol = Some(sec.name.clone());
        digits = sec.digits;
    }

    Some(ExecReport {
        exec_type,
        order_id: m.get(field::ORDER_ID).map(str::to_string),
        cl_ord_id: m.get(field::CL_ORD_ID).map(str::to_string),
        pos_id: m.get(field::POS_MAINT_RPT_ID).map(str::to_string),
        symbol,
        digits,
        side: m.get(field::SIDE).and_then(Side::from_fix),
        order_type: m.get(field::ORD_TYPE).and_then(OrderType::from_fix),
        qty: m.get_f64(field::ORDER_QTY).unwrap_or(0.0),
        cum_qty: m.get_f64(field::CUM_QTY).unwrap_or(0.0),
        leaves_qty: m.get_f64(field::LEAVES_QTY).unwrap_or(0.0),
        status: m.get(field::ORD_STATUS).and_then(OrderStatus::from_fix),
        price: m.get_f64(field::PRICE),
        stop_price: m.get_f64(field::STOP_PX),
        time_in_force: m.get(field::TIME_IN_FORCE).and_then(TimeInForce::from_fix),
        text: m.get(field::TEXT).map(str::to_string),
    })
}

/// Parse a PositionReport (35=AP). Direction comes from whichever of
/// LongQty/ShortQty is non-zero.
pub fn parse_position_report(
    m: &FixMessage,
    catalog: &SecurityCatalog,
) -> Option<PositionParse> {
    if m.get(field::POS_REQ_RESULT) == Some("2") {
        return Some(PositionParse::Empty);
    }
    let pos_id = m.get(field::POS_MAINT_RPT_ID)?.to_string();
    let sec = catalog.by_id(m.get_i64(field::SYMBOL)?)?;

    let long_qty = m.get_f64(field::LONG_QTY).unwrap_or(0.0);
    let short_qty = m.get_f64(field::SHORT_QTY).unwrap_or(0.0);
    let (side, quantity) = if long_qty > 0.0 && short_qty == 0.0 {
        (Side::Buy, long_qty)
    } else if short_qty > 0.0 && long_qty == 0.0 {
        (Side::Sell, short_qty)
    } else {
        return None;
    };

    Some(PositionParse::Report(PositionReport {
        pos_id,
        symbol: sec.name.clone(),
        digits: sec.digits,
        side,
        quantity,
        cost_price: m.get_f64(field::SETTL_PRICE).unwrap_or(0.0),
        total_reports: m
            .get(field::TOTAL_NUM_POS_REPORTS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    }))
}

#[derive(Debug, Default)]
pub struct Ledger {
    positions: HashMap<String, Position>,
    orders: HashMap<String, Order>,
    /// ClOrdID of an opening order -> venue position id.
    clid_to_pos: HashMap<String, String>,
    /// ClOrdID of an opening order -> attached protection order ids.
    clid_to_orders: HashMap<String, Vec<String>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- read access ----

    pub fn position(&self, pos_id: &str) -> Option<&Position> {
        self.positions.get(pos_id)
    }

    pub fn order(&self, order_id: &str) -> Option<&Order> {
        self.orders.get(order_id)
    }

    pub fn positions(&self) -> Vec<Position> {
        let mut ps: Vec<Position> = self.positions.values().cloned().collect();
        ps.sort_by(|a, b| a.pos_id.cmp(&b.pos_id));
        ps
    }

    pub fn orders(&self) -> Vec<Order> {
        let mut os: Vec<Order> = self.orders.values().cloned().collect();
        os.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        os
    }

    pub fn position_ids_for_symbol(&self, symbol: &str) -> Vec<String> {
        self.positions
            .values()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.pos_id.clone())
            .collect()
    }

    pub fn order_ids_for_symbol(&self, symbol: &str) -> Vec<String> {
        self.orders
            .values()
            .filter(|o| o.symbol == symbol)
            .map(|o| o.order_id.clone())
            .collect()
    }

    pub fn order_ids_for_position(&self, pos_id: &str) -> Vec<String> {
        self.orders
            .values()
            .filter(|o| o.pos_id.as_deref() == Some(pos_id))
            .map(|o| o.order_id.clone())
            .collect()
    }

    pub fn position_id_for(&self, cl_ord_id: &str) -> Option<&String> {
        self.clid_to_pos.get(cl_ord_id)
    }

    /// Opening ClOrdID for a venue position id (reverse cross-reference).
    pub fn origin_for_position(&self, pos_id: &str) -> Option<String> {
        self.clid_to_pos
            .iter()
            .find(|(_, p)| p.as_str() == pos_id)
            .map(|(c, _)| c.clone())
    }

    /// Protection orders attached under an opening ClOrdID.
    pub fn attached_order_ids(&self, cl_ord_id: &str) -> Vec<String> {
        self.clid_to_orders
            .get(cl_ord_id)
            .cloned()
            .unwrap_or_default()
    }

    // ---- mutation ----

    /// Create or refresh a position. Idempotent: the same report applied
    /// twice leaves exactly one record keyed by its position id.
    pub fn upsert_position(&mut self, rep: &PositionReport, convert: Option<crate::domain::Conversion>) {
        let cl_ord_id = self.origin_for_position(&rep.pos_id);
        self.positions.insert(
            rep.pos_id.clone(),
            Position {
                pos_id: rep.pos_id.clone(),
                symbol: rep.symbol.clone(),
                side: rep.side,
                quantity: rep.quantity,
                cost_price: rep.cost_price,
                digits: rep.digits,
                convert,
                cl_ord_id,
            },
        );
    }

    /// Install the result of a full position refresh: positions omitted by
    /// the snapshot are dropped, along with their ClOrdID cross-references.
    pub fn replace_positions(&mut self, fresh: Vec<Position>) {
        self.positions.clear();
        for p in fresh {
            self.positions.insert(p.pos_id.clone(), p);
        }
        let positions = &self.positions;
        self.clid_to_pos
            .retain(|_, pos_id| positions.contains_key(pos_id));
    }

    /// Drop a position and its ClOrdID mapping (optimistic close).
    pub fn remove_position(&mut self, pos_id: &str) -> Option<Position> {
        self.clid_to_pos.retain(|_, p| p != pos_id);
        self.positions.remove(pos_id)
    }

    /// Drop an order and clean its cross-reference entry.
    pub fn remove_order(&mut self, order_id: &str) -> Option<Order> {
        let removed = self.orders.remove(order_id);
        if removed.is_some() {
            self.clid_to_orders.retain(|_, ids| {
                ids.retain(|id| id != order_id);
                !ids.is_empty()
            });
        }
        removed
    }

    /// Drop the opening-ClOrdID cross-references (position fully closed).
    pub fn unbind(&mut self, cl_ord_id: &str) {
        self.clid_to_pos.remove(cl_ord_id);
        self.clid_to_orders.remove(cl_ord_id);
    }

    /// Apply one execution report; the ExecType drives the per-order state
    /// machine. Rejects surface as command failures, never session failures.
    pub fn apply_exec(&mut self, rep: &ExecReport) -> ExecEffects {
        let mut fx = ExecEffects::default();
        match rep.exec_type {
            ExecType::New | ExecType::Replaced | ExecType::OrderStatus => {
                if self.upsert_order(rep) {
                    fx.subscribe = rep.symbol.clone();
                }
                self.bind_from(rep, &mut fx);
            }
            ExecType::Trade => {
                if let Some(oid) = rep.order_id.as_deref() {
                    let filled = {
                        if let Some(o) = self.orders.get_mut(oid) {
                            o.filled_qty = rep.cum_qty;
                            o.leaves_qty = rep.leaves_qty;
                            if let Some(st) = rep.status {
                                o.status = st;
                            }
                            rep.leaves_qty == 0.0 || rep.status == Some(OrderStatus::Filled)
                        } else {
                            false
                        }
                    };
                    if filled {
                        self.remove_order(oid);
                    }
                }
                self.bind_from(rep, &mut fx);
                fx.refresh_positions = true;
            }
            ExecType::Canceled | ExecType::Expired => {
                if let Some(oid) = rep.order_id.as_deref() {
                    self.remove_order(oid);
                } else if let Some(clid) = rep.cl_ord_id.as_deref() {
                    self.remove_orders_by_clid(clid);
                }
            }
            ExecType::Rejected => {
                if let Some(clid) = rep.cl_ord_id.clone() {
                    self.remove_orders_by_clid(&clid);
                    let reason = rep
                        .text
                        .clone()
                        .unwrap_or_else(|| "order rejected".to_string());
                    fx.rejected = Some((clid, reason));
                }
            }
        }
        fx
    }

    /// Record the ClOrdID <-> position/order cross-references carried by a
    /// report. Market orders map to the position they open; pending
    /// limit/stop orders are collected under their opening ClOrdID.
    fn bind_from(&mut self, rep: &ExecReport, fx: &mut ExecEffects) {
        let Some(clid) = rep.cl_ord_id.clone() else {
            return;
        };
        if let Some(pos_id) = rep.pos_id.clone() {
            if rep.order_type.map_or(true, |t| t == OrderType::Market) {
                if let Some(p) = self.positions.get_mut(&pos_id) {
                    p.cl_ord_id = Some(clid.clone());
                }
                self.clid_to_pos.insert(clid.clone(), pos_id.clone());
                fx.bound_position = Some((clid, pos_id));
                return;
            }
        }
        if let Some(oid) = rep.order_id.clone() {
            if rep.order_type.map_or(false, |t| t != OrderType::Market) {
                let ids = self.clid_to_orders.entry(clid).or_default();
                if !ids.contains(&oid) {
                    ids.push(oid);
                }
            }
        }
    }

    /// Returns true when the order was newly created.
    fn upsert_order(&mut self, rep: &ExecReport) -> bool {
        let (Some(oid), Some(symbol)) = (rep.order_id.clone(), rep.symbol.clone()) else {
            debug!("exec report without order id/symbol, skipping upsert");
            return false;
        };
        let created = !self.orders.contains_key(&oid);
        self.orders.insert(
            oid.clone(),
            Order {
                order_id: oid,
                cl_ord_id: rep.cl_ord_id.clone().unwrap_or_default(),
                pos_id: rep.pos_id.clone(),
                symbol,
                side: rep.side.unwrap_or(Side::Buy),
                order_type: rep.order_type.unwrap_or(OrderType::Market),
                qty: rep.qty,
                filled_qty: rep.cum_qty,
                leaves_qty: rep.leaves_qty,
                status: rep.status.unwrap_or(OrderStatus::New),
                price: rep.price,
                stop_price: rep.stop_price,
                time_in_force: rep.time_in_force,
                digits: rep.digits,
            },
        );
        created
    }

    fn remove_orders_by_clid(&mut self, cl_ord_id: &str) {
        let ids: Vec<String> = self
            .orders
            .values()
            .filter(|o| o.cl_ord_id == cl_ord_id)
            .map(|o| o.order_id.clone())
            .collect();
        for id in ids {
            self.remove_order(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Security;

    fn catalog() -> SecurityCatalog {
        let mut cat = SecurityCatalog::new();
        cat.insert(Security {
            id: 1,
            name: "EURUSD".into(),
            digits: 5,
        });
        cat
    }

    fn position_msg(pos_id: &str, long: &str, short: &str) -> FixMessage {
        FixMessage {
            fields: vec![
                (field::MSG_TYPE, "AP".into()),
                (field::POS_MAINT_RPT_ID, pos_id.into()),
                (field::SYMBOL, "1".into()),
                (field::LONG_QTY, long.into()),
                (field::SHORT_QTY, short.into()),
                (field::SETTL_PRICE, "1.0800".into()),
                (field::TOTAL_NUM_POS_REPORTS, "1".into()),
            ],
        }
    }

    fn exec_msg(exec_type: &str, extra: Vec<(u32, String)>) -> FixMessage {
        let mut fields = vec![
            (field::MSG_TYPE, "8".into()),
            (field::EXEC_TYPE, exec_type.to_string()),
            (field::SYMBOL, "1".into()),
        ];
        fields.extend(extra);
        FixMessage { fields }
    }

    #[test]
    fn position_report_applied_twice_yields_one_record() {
        let cat = catalog();
        let mut led = Ledger::new();
        let m = position_msg("P1", "10000", "0");
        for _ in 0..2 {
            match parse_position_report(&m, &cat).unwrap() {
                PositionParse::Report(rep) => led.upsert_position(&rep, None),
                PositionParse::Empty => panic!("unexpected empty"),
            }
        }
        assert_eq!(led.positions().len(), 1);
        let p = led.position("P1").unwrap();
        assert_eq!(p.side, Side::Buy);
        assert_eq!(p.quantity, 10000.0);
        assert_eq!(p.cost_price, 1.08);
    }

    #[test]
    fn no_position_result_is_empty() {
        let cat = catalog();
        let m = FixMessage {
            fields: vec![
                (field::MSG_TYPE, "AP".into()),
                (field::POS_REQ_RESULT, "2".into()),
            ],
        };
        assert!(matches!(
            parse_position_report(&m, &cat),
            Some(PositionParse::Empty)
        ));
    }

    #[test]
    fn short_quantity_gives_sell_direction() {
        let cat = catalog();
        let m = position_msg("P2", "0", "5000");
        let PositionParse::Report(rep) = parse_position_report(&m, &cat).unwrap() else {
            panic!("expected report");
        };
        assert_eq!(rep.side, Side::Sell);
        assert_eq!(rep.quantity, 5000.0);
    }

    #[test]
    fn new_exec_creates_order_and_requests_subscription() {
        let cat = catalog();
        let mut led = Ledger::new();
        let m = exec_msg(
            "0",
            vec![
                (field::ORDER_ID, "O1".into()),
                (field::CL_ORD_ID, "CL-1".into()),
                (field::SIDE, "1".into()),
                (field::ORD_TYPE, "2".into()),
                (field::ORDER_QTY, "10000".into()),
                (field::LEAVES_QTY, "10000".into()),
                (field::ORD_STATUS, "0".into()),
                (field::PRICE, "1.0750".into()),
            ],
        );
        let rep = parse_exec_report(&m, &cat).unwrap();
        let fx = led.apply_exec(&rep);
        assert_eq!(fx.subscribe.as_deref(), Some("EURUSD"));
        let o = led.order("O1").unwrap();
        assert_eq!(o.status, OrderStatus::New);
        assert_eq!(o.price, Some(1.075));
        assert_eq!(o.leaves_qty, 10000.0);
    }

    #[test]
    fn full_fill_removes_order_and_binds_position() {
        let cat = catalog();
        let mut led = Ledger::new();
        let new = parse_exec_report(
            &exec_msg(
                "0",
                vec![
                    (field::ORDER_ID, "O1".into()),
                    (field::CL_ORD_ID, "CL-1".into()),
                    (field::SIDE, "1".into()),
                    (field::ORD_TYPE, "1".into()),
                    (field::ORDER_QTY, "100".into()),
                    (field::LEAVES_QTY, "100".into()),
                ],
            ),
            &cat,
        )
        .unwrap();
        led.apply_exec(&new);
        assert!(led.order("O1").is_some());

        let fill = parse_exec_report(
            &exec_msg(
                "F",
                vec![
                    (field::ORDER_ID, "O1".into()),
                    (field::CL_ORD_ID, "CL-1".into()),
                    (field::ORD_TYPE, "1".into()),
                    (field::POS_MAINT_RPT_ID, "P7".into()),
                    (field::CUM_QTY, "100".into()),
                    (field::LEAVES_QTY, "0".into()),
                    (field::ORD_STATUS, "2".into()),
                ],
            ),
            &cat,
        )
        .unwrap();
        let fx = led.apply_exec(&fill);
        assert!(led.order("O1").is_none());
        assert!(fx.refresh_positions);
        assert_eq!(fx.bound_position, Some(("CL-1".into(), "P7".into())));
        assert_eq!(led.position_id_for("CL-1"), Some(&"P7".to_string()));
    }

    #[test]
    fn reject_removes_pending_order_and_surfaces_failure() {
        let cat = catalog();
        let mut led = Ledger::new();
        let new = parse_exec_report(
            &exec_msg(
                "0",
                vec![
                    (field::ORDER_ID, "O9".into()),
                    (field::CL_ORD_ID, "CL-9".into()),
                    (field::SIDE, "2".into()),
                    (field::ORD_TYPE, "2".into()),
                    (field::ORDER_QTY, "100".into()),
                    (field::PRICE, "1.2".into()),
                ],
            ),
            &cat,
        )
        .unwrap();
        led.apply_exec(&new);

        let rej = parse_exec_report(
            &exec_msg(
                "8",
                vec![
                    (field::CL_ORD_ID, "CL-9".into()),
                    (field::TEXT, "not enough margin".into()),
                ],
            ),
            &cat,
        )
        .unwrap();
        let fx = led.apply_exec(&rej);
        assert!(led.order("O9").is_none());
        assert_eq!(
            fx.rejected,
            Some(("CL-9".into(), "not enough margin".into()))
        );
    }

    #[test]
    fn cancel_cleans_cross_reference() {
        let cat = catalog();
        let mut led = Ledger::new();
        // Pending stop order attached under CL-1.
        let new = parse_exec_report(
            &exec_msg(
                "I",
                vec![
                    (field::ORDER_ID, "O2".into()),
                    (field::CL_ORD_ID, "CL-1".into()),
                    (field::SIDE, "2".into()),
                    (field::ORD_TYPE, "3".into()),
                    (field::ORDER_QTY, "100".into()),
                    (field::LEAVES_QTY, "100".into()),
                    (field::STOP_PX, "1.05".into()),
                ],
            ),
            &cat,
        )
        .unwrap();
        led.apply_exec(&new);
        assert_eq!(led.attached_order_ids("CL-1"), vec!["O2".to_string()]);

        let cancel = parse_exec_report(
            &exec_msg("4", vec![(field::ORDER_ID, "O2".into())]),
            &cat,
        )
        .unwrap();
        led.apply_exec(&cancel);
        assert!(led.order("O2").is_none());
        assert!(led.attached_order_ids("CL-1").is_empty());
    }

    #[test]
    fn replace_positions_drops_omitted_ids_and_mappings() {
        let cat = catalog();
        let mut led = Ledger::new();
        for (pid, clid) in [("P1", "CL-1"), ("P2", "CL-2")] {
            let m = position_msg(pid, "100", "0");
            let PositionParse::Report(rep) = parse_position_report(&m, &cat).unwrap() else {
                panic!();
            };
            led.upsert_position(&rep, None);
            led.clid_to_pos.insert(clid.to_string(), pid.to_string());
        }
        // Full refresh only mentions P2.
        let keep = led.position("P2").cloned().unwrap();
        led.replace_positions(vec![keep]);
        assert!(led.position("P1").is_none());
        assert!(led.position_id_for("CL-1").is_none());
        assert_eq!(led.position_id_for("CL-2"), Some(&"P2".to_string()));
    }

    #[test]
    fn unknown_symbol_id_fails_the_single_report() {
        let cat = catalog();
        let m = exec_msg("0", vec![(field::ORDER_ID, "O1".into())]);
        // Symbol id 1 is known; id 42 is not.
        let bad = FixMessage {
            fields: m
                .fields
                .iter()
                .map(|(t, v)| {
                    if *t == field::SYMBOL {
                        (*t, "42".to_string())
                    } else {
                        (*t, v.clone())
                    }
                })
                .collect(),
        };
        assert!(parse_exec_report(&bad, &cat).is_none());
    }
}
