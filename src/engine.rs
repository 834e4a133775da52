// ===============================
// src/engine.rs
// ===============================
//
// Single-writer reactor. Both sessions publish decoded messages here, and
// this task owns every mutation of the security catalog, the quote board
// and the position/order ledger — no shared state is touched from the read
// loops themselves. Commands from callers are validated against the
// catalog/ledger and turned into outbound messages routed to the owning
// session.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use chrono::Utc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::catalog::SecurityCatalog;
use crate::domain::{
    EngineSnapshot, Event, OrderType, Position, Side, StreamKind,
};
use crate::fix::{field, msg, FixMessage};
use crate::ledger::{self, Ledger, PositionParse};
use crate::metrics::{EXECS, OPEN_ORDERS, OPEN_POSITIONS, SUBSCRIBED_SYMBOLS};
use crate::orders::{self, CommandError, TradeCommand};
use crate::quotes::QuoteBoard;
use crate::session::{SessionCommand, SessionEvent};

/// Instructions produced by the engine core, executed by the run loop.
#[derive(Debug)]
pub enum Directive {
    Send {
        stream: StreamKind,
        msg_type: &'static str,
        fields: Vec<(u32, String)>,
    },
    /// Ask the Trade session to piggyback a positions refresh on every
    /// heartbeat (enabled once the catalog has loaded).
    EnablePositionRefresh,
    Record(Event),
}

fn send(stream: StreamKind, msg_type: &'static str, fields: Vec<(u32, String)>) -> Directive {
    Directive::Send {
        stream,
        msg_type,
        fields,
    }
}

pub struct Engine {
    currency: String,
    client_label: String,
    catalog: SecurityCatalog,
    quotes: QuoteBoard,
    ledger: Ledger,
    /// Symbols with an active spot subscription.
    subscribed: HashSet<String>,
    /// Configured symbols to subscribe once the catalog is up.
    wanted: Vec<String>,
    md_req_seq: u64,
    req_seq: u64,
    quote_up: bool,
    trade_up: bool,
    /// Callers waiting for the position id of a client order id.
    pending_pos_id: HashMap<String, oneshot::Sender<Result<String, CommandError>>>,
    /// Position-report batch accumulator for full-refresh replacement.
    pending_positions: HashMap<String, Position>,
}

impl Engine {
    pub fn new(currency: String, client_label: String, wanted: Vec<String>) -> Self {
        Self {
            currency,
            client_label,
            catalog: SecurityCatalog::new(),
            quotes: QuoteBoard::new(),
            ledger: Ledger::new(),
            subscribed: HashSet::new(),
            wanted,
            md_req_seq: 0,
            req_seq: 0,
            quote_up: false,
            trade_up: false,
            pending_pos_id: HashMap::new(),
            pending_positions: HashMap::new(),
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            ts_ms: Utc::now().timestamp_millis(),
            positions: self.ledger.positions(),
            orders: self.ledger.orders(),
            quotes: self.quotes.quotes(),
        }
    }

    fn next_req_id(&mut self) -> String {
        self.req_seq += 1;
        self.req_seq.to_string()
    }

    // ---- session lifecycle ----

    pub fn on_session_event(&mut self, ev: SessionEvent) -> Vec<Directive> {
        match ev {
            SessionEvent::LoggedOn { kind, .. } => self.on_logged_on(kind),
            SessionEvent::ConnectionLost { kind } => {
                match kind {
                    StreamKind::Quote => self.quote_up = false,
                    StreamKind::Trade => self.trade_up = false,
                }
                // Subscriptions die with the socket; they are restored on
                // the next logon.
                if kind == StreamKind::Quote {
                    self.subscribed.clear();
                }
                Vec::new()
            }
            SessionEvent::Fatal { .. } => Vec::new(),
            SessionEvent::Message { kind, msg } => self.on_message(kind, &msg),
        }
    }

    fn on_logged_on(&mut self, kind: StreamKind) -> Vec<Directive> {
        let mut out = Vec::new();
        match kind {
            StreamKind::Trade => {
                self.trade_up = true;
                // Catalog bootstrap: the symbol table gates everything that
                // references a symbol id, so it is requested first.
                let req = self.next_req_id();
                out.push(send(
                    StreamKind::Trade,
                    msg::SECURITY_LIST_REQUEST,
                    orders::security_list_request_fields(&req),
                ));
            }
            StreamKind::Quote => {
                self.quote_up = true;
                if self.catalog.is_loaded() {
                    out.extend(self.resubscribe_all());
                }
            }
        }
        out
    }

    /// (Re)issue spot subscriptions for configured symbols plus everything
    /// that was subscribed before a reconnect.
    fn resubscribe_all(&mut self) -> Vec<Directive> {
        let mut symbols: Vec<String> = self.wanted.clone();
        symbols.extend(self.subscribed.iter().cloned());
        self.subscribed.clear();
        let mut out = Vec::new();
        for s in symbols {
            out.extend(self.subscribe_spot(&s));
        }
        out
    }

    /// Subscribe a symbol's best bid/ask once; no-op if already subscribed
    /// or the catalog does not know the symbol.
    fn subscribe_spot(&mut self, symbol: &str) -> Option<Directive> {
        if self.subscribed.contains(symbol) {
            return None;
        }
        let sec = match self.catalog.by_name(symbol) {
            Some(s) => s.clone(),
            None => {
                warn!(symbol, "cannot subscribe unknown symbol");
                return None;
            }
        };
        self.md_req_seq += 1;
        self.subscribed.insert(symbol.to_string());
        SUBSCRIBED_SYMBOLS.set(self.subscribed.len() as i64);
        Some(send(
            StreamKind::Quote,
            msg::MARKET_DATA_REQUEST,
            orders::market_data_subscribe_fields(&sec, self.md_req_seq),
        ))
    }

    // ---- inbound application messages ----

    pub fn on_message(&mut self, kind: StreamKind, m: &FixMessage) -> Vec<Directive> {
        match m.msg_type() {
            msg::SECURITY_LIST => self.on_security_list(m),
            msg::MARKET_DATA_SNAPSHOT => self.on_market_data(m, false),
            msg::MARKET_DATA_INCREMENTAL => self.on_market_data(m, true),
            msg::POSITION_REPORT => self.on_position_report(m),
            msg::EXECUTION_REPORT => self.on_exec_report(m),
            msg::REJECT | msg::ORDER_CANCEL_REJECT | msg::BUSINESS_REJECT => {
                self.on_reject(m);
                Vec::new()
            }
            other => {
                debug!(stream = kind.label(), msg_type = other, "unhandled message");
                Vec::new()
            }
        }
    }

    fn on_security_list(&mut self, m: &FixMessage) -> Vec<Directive> {
        let n = self.catalog.load(m);
        info!(securities = n, "security catalog loaded");
        let mut out = vec![Directive::Record(Event::Note(format!(
            "security catalog loaded: {n} symbols"
        )))];
        if n == 0 {
            return out;
        }
        // The catalog barrier is down: kick off the initial position and
        // order refreshes, keep positions fresh with every heartbeat, and
        // start the configured market data subscriptions.
        let req = self.next_req_id();
        out.push(send(
            StreamKind::Trade,
            msg::REQUEST_FOR_POSITIONS,
            crate::session::positions_request_fields(&req),
        ));
        let req = self.next_req_id();
        out.push(send(
            StreamKind::Trade,
            msg::ORDER_MASS_STATUS_REQUEST,
            orders::order_mass_status_fields(&req),
        ));
        out.push(Directive::EnablePositionRefresh);
        if self.quote_up {
            out.extend(self.resubscribe_all());
        }
        out
    }

    fn on_market_data(&mut self, m: &FixMessage, incremental: bool) -> Vec<Directive> {
        let Some(sec) = m.get_i64(field::SYMBOL).and_then(|id| self.catalog.by_id(id))
        else {
            warn!(
                symbol = m.get(field::SYMBOL).unwrap_or("?"),
                "market data for unknown symbol id"
            );
            return Vec::new();
        };
        let symbol = sec.name.clone();
        let updated = if incremental {
            self.quotes.apply_incremental(&symbol, m)
        } else {
            self.quotes.apply_snapshot(&symbol, m)
        };
        match updated {
            Some(q) => vec![Directive::Record(Event::Quote(q))],
            None => Vec::new(),
        }
    }

    fn on_position_report(&mut self, m: &FixMessage) -> Vec<Directive> {
        let mut out = Vec::new();
        match ledger::parse_position_report(m, &self.catalog) {
            Some(PositionParse::Empty) => {
                // Venue reports no open positions: an empty full refresh.
                self.pending_positions.clear();
                self.ledger.replace_positions(Vec::new());
            }
            Some(PositionParse::Report(rep)) => {
                let convert = self.catalog.conversion_pair(&rep.symbol, &self.currency);
                self.ledger.upsert_position(&rep, convert.clone());

                if let Some(p) = self.ledger.position(&rep.pos_id).cloned() {
                    out.push(Directive::Record(Event::Position(p.clone())));
                    // Counted reports accumulate toward a full snapshot; a
                    // completed batch replaces the ledger, so positions the
                    // venue no longer reports are dropped.
                    if rep.total_reports > 0 {
                        self.pending_positions.insert(p.pos_id.clone(), p);
                        if self.pending_positions.len() >= rep.total_reports {
                            let fresh: Vec<Position> =
                                self.pending_positions.drain().map(|(_, p)| p).collect();
                            self.ledger.replace_positions(fresh);
                        }
                    }
                }

                out.extend(self.subscribe_spot(&rep.symbol));
                if let Some(conv) = convert {
                    out.extend(self.subscribe_spot(&conv.pair));
                }
            }
            None => {
                warn!(
                    pos_id = m.get(field::POS_MAINT_RPT_ID).unwrap_or("?"),
                    "dropping unparseable position report"
                );
            }
        }
        out
    }

    fn on_exec_report(&mut self, m: &FixMessage) -> Vec<Directive> {
        let Some(rep) = ledger::parse_exec_report(m, &self.catalog) else {
            warn!(
                cl_ord_id = m.get(field::CL_ORD_ID).unwrap_or("?"),
                "dropping unparseable execution report"
            );
            return Vec::new();
        };
        EXECS.with_label_values(&[rep.exec_type.label()]).inc();

        let fx = self.ledger.apply_exec(&rep);
        let mut out = vec![Directive::Record(Event::Exec(rep.clone()))];

        if let Some(symbol) = fx.subscribe {
            out.extend(self.subscribe_spot(&symbol));
        }
        if let Some((clid, pos_id)) = fx.bound_position {
            if let Some(tx) = self.pending_pos_id.remove(&clid) {
                let _ = tx.send(Ok(pos_id));
            }
        }
        if let Some((clid, reason)) = fx.rejected {
            warn!(cl_ord_id = %clid, %reason, "order rejected by venue");
            if let Some(tx) = self.pending_pos_id.remove(&clid) {
                let _ = tx.send(Err(CommandError::Rejected(reason)));
            }
        }
        if fx.refresh_positions && self.trade_up {
            let req = self.next_req_id();
            out.push(send(
                StreamKind::Trade,
                msg::REQUEST_FOR_POSITIONS,
                crate::session::positions_request_fields(&req),
            ));
        }
        out
    }

    fn on_reject(&mut self, m: &FixMessage) {
        let text = m.get(field::TEXT).unwrap_or("");
        // "ORDER_NOT_FOUND:no orders found" is routine after a mass-status
        // request with nothing pending.
        if text.ends_with("no orders found") {
            info!("no pending orders at venue");
        } else {
            warn!(
                msg_type = m.msg_type(),
                text,
                cl_ord_id = m.get(field::CL_ORD_ID).unwrap_or(""),
                "venue reject"
            );
        }
    }

    // ---- commands ----

    pub fn on_command(&mut self, cmd: TradeCommand) -> Vec<Directive> {
        match cmd {
            TradeCommand::Open {
                symbol,
                side,
                order_type,
                quantity,
                price,
                pos_id,
                reply,
            } => {
                let mut out = Vec::new();
                let res = self.open_order(
                    &symbol,
                    side,
                    order_type,
                    quantity,
                    price,
                    pos_id.as_deref(),
                    &mut out,
                );
                let _ = reply.send(res);
                out
            }
            TradeCommand::Cancel { order_id, reply } => {
                let mut out = Vec::new();
                let res = match self.cancel_order(&order_id, &mut out) {
                    Some(r) => r,
                    None => Err(CommandError::UnknownOrder(order_id)),
                };
                let _ = reply.send(res);
                out
            }
            TradeCommand::CancelAllForPosition { pos_id, reply } => {
                let ids = self.ledger.order_ids_for_position(&pos_id);
                self.cancel_many(ids, reply)
            }
            TradeCommand::CancelAllForSymbol { symbol, reply } => {
                let ids = self.ledger.order_ids_for_symbol(&symbol);
                self.cancel_many(ids, reply)
            }
            TradeCommand::CancelAllForSymbols { symbols, reply } => {
                let mut ids = Vec::new();
                for s in symbols {
                    ids.extend(self.ledger.order_ids_for_symbol(&s));
                }
                self.cancel_many(ids, reply)
            }
            TradeCommand::CancelAll { reply } => {
                let ids: Vec<String> =
                    self.ledger.orders().iter().map(|o| o.order_id.clone()).collect();
                self.cancel_many(ids, reply)
            }
            TradeCommand::ClosePosition {
                pos_id,
                quantity,
                reply,
            } => {
                let mut out = Vec::new();
                let res = self.close_position(&pos_id, quantity, &mut out);
                let _ = reply.send(res);
                out
            }
            TradeCommand::CloseAllPositions { reply } => {
                let ids: Vec<String> = self
                    .ledger
                    .positions()
                    .iter()
                    .map(|p| p.pos_id.clone())
                    .collect();
                self.close_many(ids, reply)
            }
            TradeCommand::CloseAllForSymbol { symbol, reply } => {
                let ids = self.ledger.position_ids_for_symbol(&symbol);
                self.close_many(ids, reply)
            }
            TradeCommand::CloseAllForSymbols { symbols, reply } => {
                let mut ids = Vec::new();
                for s in symbols {
                    ids.extend(self.ledger.position_ids_for_symbol(&s));
                }
                self.close_many(ids, reply)
            }
            TradeCommand::Subscribe { symbol, reply } => {
                let symbol = symbol.to_ascii_uppercase();
                if self.catalog.is_loaded() && self.catalog.by_name(&symbol).is_none() {
                    let _ = reply.send(Err(CommandError::UnknownSymbol(symbol)));
                    return Vec::new();
                }
                if !self.catalog.is_loaded() {
                    // Deferred until the catalog barrier is down.
                    if !self.wanted.contains(&symbol) {
                        self.wanted.push(symbol);
                    }
                    let _ = reply.send(Ok(()));
                    return Vec::new();
                }
                let out = self.subscribe_spot(&symbol).into_iter().collect();
                let _ = reply.send(Ok(()));
                out
            }
            TradeCommand::AwaitPositionId { cl_ord_id, reply } => {
                if let Some(p) = self.ledger.position_id_for(&cl_ord_id) {
                    let _ = reply.send(Ok(p.clone()));
                } else {
                    self.pending_pos_id.insert(cl_ord_id, reply);
                }
                Vec::new()
            }
        }
    }

    fn open_order(
        &mut self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
        pos_id: Option<&str>,
        out: &mut Vec<Directive>,
    ) -> Result<String, CommandError> {
        let sec = self
            .catalog
            .by_name(symbol)
            .cloned()
            .ok_or_else(|| CommandError::UnknownSymbol(symbol.to_string()))?;
        if !self.trade_up {
            return Err(CommandError::NotConnected("trade"));
        }
        let cl_ord_id = orders::gen_cl_ord_id();
        let fields = orders::new_order_fields(
            &sec,
            side,
            order_type,
            quantity,
            price,
            pos_id,
            &cl_ord_id,
            &self.client_label,
        )?;
        out.push(send(StreamKind::Trade, msg::NEW_ORDER_SINGLE, fields));
        Ok(cl_ord_id)
    }

    /// None = order id unknown. The pending order is removed optimistically;
    /// the authoritative confirmation still arrives via execution reports.
    fn cancel_order(
        &mut self,
        order_id: &str,
        out: &mut Vec<Directive>,
    ) -> Option<Result<(), CommandError>> {
        let order = self.ledger.order(order_id).cloned()?;
        if !self.trade_up {
            return Some(Err(CommandError::NotConnected("trade")));
        }
        let cl_ord_id = orders::gen_cl_ord_id();
        out.push(send(
            StreamKind::Trade,
            msg::ORDER_CANCEL_REQUEST,
            orders::cancel_fields(&order, &cl_ord_id),
        ));
        self.ledger.remove_order(order_id);
        Some(Ok(()))
    }

    fn cancel_many(
        &mut self,
        ids: Vec<String>,
        reply: oneshot::Sender<Result<Vec<String>, CommandError>>,
    ) -> Vec<Directive> {
        let mut out = Vec::new();
        let mut done = Vec::new();
        for id in ids {
            match self.cancel_order(&id, &mut out) {
                Some(Ok(())) => done.push(id),
                Some(Err(e)) => {
                    // Already-queued cancels stay in flight; the caller gets
                    // the partial result plus the error.
                    error!(order_id = %id, error = %e, "cancel fan-out stopped");
                    let _ = reply.send(Err(e));
                    return out;
                }
                None => {}
            }
        }
        let _ = reply.send(Ok(done));
        out
    }

    fn close_position(
        &mut self,
        pos_id: &str,
        quantity: Option<f64>,
        out: &mut Vec<Directive>,
    ) -> Result<String, CommandError> {
        let pos = self
            .ledger
            .position(pos_id)
            .cloned()
            .ok_or_else(|| CommandError::UnknownPosition(pos_id.to_string()))?;
        let sec = self
            .catalog
            .by_name(&pos.symbol)
            .cloned()
            .ok_or_else(|| CommandError::UnknownSymbol(pos.symbol.clone()))?;
        if !self.trade_up {
            return Err(CommandError::NotConnected("trade"));
        }

        // Cancel protection orders attached to the position before closing,
        // and drop the opening-ClOrdID cross-references.
        if let Some(origin) = self.ledger.origin_for_position(pos_id) {
            for oid in self.ledger.attached_order_ids(&origin) {
                let _ = self.cancel_order(&oid, out);
            }
            self.ledger.unbind(&origin);
        }

        let cl_ord_id = orders::gen_cl_ord_id();
        let fields =
            orders::close_position_fields(&pos, &sec, quantity, &cl_ord_id, &self.client_label)?;
        out.push(send(StreamKind::Trade, msg::NEW_ORDER_SINGLE, fields));

        let full_close = quantity.map_or(true, |q| q >= pos.quantity);
        if full_close {
            self.ledger.remove_position(pos_id);
        }
        Ok(cl_ord_id)
    }

    fn close_many(
        &mut self,
        ids: Vec<String>,
        reply: oneshot::Sender<Result<Vec<String>, CommandError>>,
    ) -> Vec<Directive> {
        let mut out = Vec::new();
        let mut clids = Vec::new();
        for id in ids {
            match self.close_position(&id, None, &mut out) {
                Ok(clid) => clids.push(clid),
                Err(e) => {
                    error!(pos_id = %id, error = %e, "close fan-out stopped");
                    let _ = reply.send(Err(e));
                    return out;
                }
            }
        }
        let _ = reply.send(Ok(clids));
        out
    }
}

/// Reactor task: applies events and commands, routes outbound messages to
/// the owning session, and publishes a fresh snapshot after every change.
pub async fn run(
    mut engine: Engine,
    mut ev_rx: mpsc::Receiver<SessionEvent>,
    mut cmd_rx: mpsc::Receiver<TradeCommand>,
    quote_tx: mpsc::Sender<SessionCommand>,
    trade_tx: mpsc::Sender<SessionCommand>,
    snap_tx: watch::Sender<EngineSnapshot>,
    rec_tx: Option<mpsc::Sender<Event>>,
) {
    loop {
        let directives = tokio::select! {
            maybe = ev_rx.recv() => match maybe {
                Some(SessionEvent::Fatal { kind, reason }) => {
                    error!(stream = kind.label(), %reason, "fatal connectivity error, engine stopping");
                    break;
                }
                Some(ev) => engine.on_session_event(ev),
                None => break,
            },
            maybe = cmd_rx.recv() => match maybe {
                Some(cmd) => engine.on_command(cmd),
                None => break,
            },
        };

        for d in directives {
            match d {
                Directive::Send {
                    stream,
                    msg_type,
                    fields,
                } => {
                    let tx = match stream {
                        StreamKind::Quote => &quote_tx,
                        StreamKind::Trade => &trade_tx,
                    };
                    if tx
                        .send(SessionCommand::Send {
                            msg_type: msg_type.to_string(),
                            fields,
                        })
                        .await
                        .is_err()
                    {
                        warn!(stream = stream.label(), "session channel closed");
                    }
                }
                Directive::EnablePositionRefresh => {
                    let _ = trade_tx
                        .send(SessionCommand::RefreshPositionsOnHeartbeat(true))
                        .await;
                }
                Directive::Record(ev) => {
                    if let Some(tx) = &rec_tx {
                        let _ = tx.try_send(ev);
                    }
                }
            }
        }

        let snap = engine.snapshot();
        OPEN_POSITIONS.set(snap.positions.len() as i64);
        OPEN_ORDERS.set(snap.orders.len() as i64);
        let _ = snap_tx.send(snap);
    }
}

/// Cloneable caller-facing handle: typed commands in, snapshots out.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<TradeCommand>,
    snap_rx: watch::Receiver<EngineSnapshot>,
}

impl EngineHandle {
    pub fn new(
        cmd_tx: mpsc::Sender<TradeCommand>,
        snap_rx: watch::Receiver<EngineSnapshot>,
    ) -> Self {
        Self { cmd_tx, snap_rx }
    }

    /// Current positions, orders and quotes.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.snap_rx.borrow().clone()
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, CommandError>>) -> TradeCommand,
    ) -> Result<T, CommandError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| CommandError::EngineClosed)?;
        rx.await.map_err(|_| CommandError::EngineClosed)?
    }

    /// Place an order; returns the generated client order id.
    pub async fn open(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
        pos_id: Option<String>,
    ) -> Result<String, CommandError> {
        let symbol = symbol.to_string();
        self.ask(move |reply| TradeCommand::Open {
            symbol,
            side,
            order_type,
            quantity,
            price,
            pos_id,
            reply,
        })
        .await
    }

    pub async fn cancel(&self, order_id: &str) -> Result<(), CommandError> {
        let order_id = order_id.to_string();
        self.ask(move |reply| TradeCommand::Cancel { order_id, reply })
            .await
    }

    pub async fn cancel_all_for_position(
        &self,
        pos_id: &str,
    ) -> Result<Vec<String>, CommandError> {
        let pos_id = pos_id.to_string();
        self.ask(move |reply| TradeCommand::CancelAllForPosition { pos_id, reply })
            .await
    }

    pub async fn cancel_all_for_symbol(&self, symbol: &str) -> Result<Vec<String>, CommandError> {
        let symbol = symbol.to_string();
        self.ask(move |reply| TradeCommand::CancelAllForSymbol { symbol, reply })
            .await
    }

    pub async fn cancel_all_for_symbols(
        &self,
        symbols: Vec<String>,
    ) -> Result<Vec<String>, CommandError> {
        self.ask(move |reply| TradeCommand::CancelAllForSymbols { symbols, reply })
            .await
    }

    pub async fn cancel_all(&self) -> Result<Vec<String>, CommandError> {
        self.ask(move |reply| TradeCommand::CancelAll { reply }).await
    }

    /// Close a position fully (or partially with `quantity`); returns the
    /// client order id of the closing market order.
    pub async fn close_position(
        &self,
        pos_id: &str,
        quantity: Option<f64>,
    ) -> Result<String, CommandError> {
        let pos_id = pos_id.to_string();
        self.ask(move |reply| TradeCommand::ClosePosition {
            pos_id,
            quantity,
            reply,
        })
        .await
    }

    pub async fn close_all_positions(&self) -> Result<Vec<String>, CommandError> {
        self.ask(move |reply| TradeCommand::CloseAllPositions { reply })
            .await
    }

    pub async fn close_all_for_symbol(&self, symbol: &str) -> Result<Vec<String>, CommandError> {
        let symbol = symbol.to_string();
        self.ask(move |reply| TradeCommand::CloseAllForSymbol { symbol, reply })
            .await
    }

    pub async fn close_all_for_symbols(
        &self,
        symbols: Vec<String>,
    ) -> Result<Vec<String>, CommandError> {
        self.ask(move |reply| TradeCommand::CloseAllForSymbols { symbols, reply })
            .await
    }

    pub async fn subscribe(&self, symbol: &str) -> Result<(), CommandError> {
        let symbol = symbol.to_string();
        self.ask(move |reply| TradeCommand::Subscribe { symbol, reply })
            .await
    }

    /// Await the venue position id assigned to a client order id, with an
    /// explicit timeout instead of a poll loop.
    pub async fn position_id_for(
        &self,
        cl_ord_id: &str,
        wait: Duration,
    ) -> Result<String, CommandError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(TradeCommand::AwaitPositionId {
                cl_ord_id: cl_ord_id.to_string(),
                reply: tx,
            })
            .await
            .map_err(|_| CommandError::EngineClosed)?;
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(CommandError::EngineClosed),
            Err(_) => Err(CommandError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Security;

    fn engine_with_catalog() -> Engine {
        let mut e = Engine::new("USD".into(), "tester".into(), Vec::new());
        e.catalog.insert(Security {
            id: 1,
            name: "EURUSD".into(),
            digits: 5,
        });
        e.catalog.insert(Security {
            id: 2,
            name: "GBPUSD".into(),
            digits: 5,
        });
        e.trade_up = true;
        e.quote_up = true;
        e
    }

    fn sends(directives: &[Directive]) -> Vec<(&'static str, &Vec<(u32, String)>)> {
        directives
            .iter()
            .filter_map(|d| match d {
                Directive::Send {
                    msg_type, fields, ..
                } => Some((*msg_type, fields)),
                _ => None,
            })
            .collect()
    }

    fn exec_new(order_id: &str, clid: &str, symbol_id: &str, ord_type: &str) -> FixMessage {
        FixMessage {
            fields: vec![
                (field::MSG_TYPE, "8".into()),
                (field::EXEC_TYPE, "0".into()),
                (field::ORDER_ID, order_id.into()),
                (field::CL_ORD_ID, clid.into()),
                (field::SYMBOL, symbol_id.into()),
                (field::SIDE, "1".into()),
                (field::ORD_TYPE, ord_type.into()),
                (field::ORDER_QTY, "1000".into()),
                (field::LEAVES_QTY, "1000".into()),
                (field::ORD_STATUS, "0".into()),
                (field::PRICE, "1.0000".into()),
            ],
        }
    }

    fn position_report(pos_id: &str, symbol_id: &str, long: &str) -> FixMessage {
        FixMessage {
            fields: vec![
                (field::MSG_TYPE, "AP".into()),
                (field::POS_MAINT_RPT_ID, pos_id.into()),
                (field::SYMBOL, symbol_id.into()),
                (field::LONG_QTY, long.into()),
                (field::SHORT_QTY, "0".into()),
                (field::SETTL_PRICE, "1.0800".into()),
            ],
        }
    }

    #[test]
    fn trade_logon_requests_security_list_first() {
        let mut e = Engine::new("USD".into(), "tester".into(), vec!["EURUSD".into()]);
        let out = e.on_session_event(SessionEvent::LoggedOn {
            kind: StreamKind::Trade,
            heartbeat_secs: 30,
        });
        let s = sends(&out);
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].0, msg::SECURITY_LIST_REQUEST);
    }

    #[test]
    fn security_list_opens_the_catalog_barrier() {
        let mut e = Engine::new("USD".into(), "tester".into(), vec!["EURUSD".into()]);
        e.quote_up = true;
        e.trade_up = true;
        let m = FixMessage {
            fields: vec![
                (field::MSG_TYPE, "y".into()),
                (field::NO_RELATED_SYM, "1".into()),
                (field::SYMBOL, "1".into()),
                (field::SYMBOL_NAME, "EURUSD".into()),
                (field::SYMBOL_DIGITS, "5".into()),
            ],
        };
        let out = e.on_message(StreamKind::Trade, &m);
        let s = sends(&out);
        let types: Vec<&str> = s.iter().map(|(t, _)| *t).collect();
        assert!(types.contains(&msg::REQUEST_FOR_POSITIONS));
        assert!(types.contains(&msg::ORDER_MASS_STATUS_REQUEST));
        // Configured symbol subscribed once the catalog is up.
        assert!(types.contains(&msg::MARKET_DATA_REQUEST));
        assert!(out
            .iter()
            .any(|d| matches!(d, Directive::EnablePositionRefresh)));
    }

    #[test]
    fn close_position_emits_one_opposite_market_order() {
        let mut e = engine_with_catalog();
        // Seed a long 10000 EURUSD position P.
        let out = e.on_message(StreamKind::Trade, &position_report("P", "1", "10000"));
        drop(out);

        let (tx, mut rx) = oneshot::channel();
        let out = e.on_command(TradeCommand::ClosePosition {
            pos_id: "P".into(),
            quantity: None,
            reply: tx,
        });
        let s = sends(&out);
        assert_eq!(s.len(), 1);
        let (mt, fields) = (s[0].0, s[0].1);
        assert_eq!(mt, msg::NEW_ORDER_SINGLE);
        assert!(fields.contains(&(field::SIDE, "2".to_string())));
        assert!(fields.contains(&(field::ORDER_QTY, "10000".to_string())));
        assert!(fields.contains(&(field::POS_MAINT_RPT_ID, "P".to_string())));
        assert!(rx.try_recv().unwrap().is_ok());
        // Optimistically removed from the ledger.
        assert!(e.ledger.position("P").is_none());
    }

    #[test]
    fn cancel_all_for_symbol_cancels_only_that_symbol() {
        let mut e = engine_with_catalog();
        e.on_message(StreamKind::Trade, &exec_new("O1", "CL-1", "1", "2"));
        e.on_message(StreamKind::Trade, &exec_new("O2", "CL-2", "2", "2"));
        e.on_message(StreamKind::Trade, &exec_new("O3", "CL-3", "1", "2"));

        let (tx, mut rx) = oneshot::channel();
        let out = e.on_command(TradeCommand::CancelAllForSymbol {
            symbol: "EURUSD".into(),
            reply: tx,
        });
        let cancels: Vec<_> = sends(&out)
            .into_iter()
            .filter(|(t, _)| *t == msg::ORDER_CANCEL_REQUEST)
            .collect();
        assert_eq!(cancels.len(), 2);

        let mut done = rx.try_recv().unwrap().unwrap();
        done.sort();
        assert_eq!(done, vec!["O1".to_string(), "O3".to_string()]);

        // Only the GBPUSD order is still pending.
        let remaining = e.ledger.orders();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].order_id, "O2");
    }

    #[test]
    fn open_unknown_symbol_rejected_before_any_send() {
        let mut e = engine_with_catalog();
        let (tx, mut rx) = oneshot::channel();
        let out = e.on_command(TradeCommand::Open {
            symbol: "XAUUSD".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: 100.0,
            price: None,
            pos_id: None,
            reply: tx,
        });
        assert!(sends(&out).is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(CommandError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn open_limit_without_price_rejected_locally() {
        let mut e = engine_with_catalog();
        let (tx, mut rx) = oneshot::channel();
        let out = e.on_command(TradeCommand::Open {
            symbol: "EURUSD".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: 100.0,
            price: None,
            pos_id: None,
            reply: tx,
        });
        assert!(sends(&out).is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(CommandError::MissingPrice)
        ));
    }

    #[test]
    fn open_while_disconnected_is_reported_not_retried() {
        let mut e = engine_with_catalog();
        e.trade_up = false;
        let (tx, mut rx) = oneshot::channel();
        let out = e.on_command(TradeCommand::Open {
            symbol: "EURUSD".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: 100.0,
            price: None,
            pos_id: None,
            reply: tx,
        });
        assert!(sends(&out).is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(CommandError::NotConnected("trade"))
        ));
    }

    #[test]
    fn position_report_auto_subscribes_symbol_and_conversion_pair() {
        let mut e = engine_with_catalog();
        e.catalog.insert(Security {
            id: 3,
            name: "GBPJPY".into(),
            digits: 3,
        });
        e.catalog.insert(Security {
            id: 4,
            name: "USDJPY".into(),
            digits: 3,
        });
        let out = e.on_message(StreamKind::Trade, &position_report("P9", "3", "1000"));
        let md: Vec<_> = sends(&out)
            .into_iter()
            .filter(|(t, _)| *t == msg::MARKET_DATA_REQUEST)
            .collect();
        // GBPJPY itself plus the USDJPY conversion pair.
        assert_eq!(md.len(), 2);
        let p = e.ledger.position("P9").unwrap();
        let conv = p.convert.clone().unwrap();
        assert_eq!(conv.pair, "USDJPY");
        assert!(conv.inverse);
    }

    #[test]
    fn await_position_id_resolves_when_fill_arrives() {
        let mut e = engine_with_catalog();
        let (tx, mut rx) = oneshot::channel();
        e.on_command(TradeCommand::AwaitPositionId {
            cl_ord_id: "CL-7".into(),
            reply: tx,
        });
        assert!(rx.try_recv().is_err()); // still pending

        let fill = FixMessage {
            fields: vec![
                (field::MSG_TYPE, "8".into()),
                (field::EXEC_TYPE, "F".into()),
                (field::ORDER_ID, "O7".into()),
                (field::CL_ORD_ID, "CL-7".into()),
                (field::SYMBOL, "1".into()),
                (field::ORD_TYPE, "1".into()),
                (field::POS_MAINT_RPT_ID, "P7".into()),
                (field::CUM_QTY, "100".into()),
                (field::LEAVES_QTY, "0".into()),
                (field::ORD_STATUS, "2".into()),
            ],
        };
        e.on_message(StreamKind::Trade, &fill);
        assert_eq!(rx.try_recv().unwrap().unwrap(), "P7");
    }

    #[test]
    fn quote_reconnect_restores_subscriptions() {
        let mut e = engine_with_catalog();
        // Subscribe via a position reference.
        e.on_message(StreamKind::Trade, &position_report("P", "1", "100"));
        assert!(e.subscribed.contains("EURUSD"));

        e.on_session_event(SessionEvent::ConnectionLost {
            kind: StreamKind::Quote,
        });
        assert!(e.subscribed.is_empty());

        // Subscriptions are re-issued on the next quote logon... but only
        // for configured symbols; position-driven ones come back with the
        // next position refresh.
        e.wanted.push("EURUSD".into());
        let out = e.on_session_event(SessionEvent::LoggedOn {
            kind: StreamKind::Quote,
            heartbeat_secs: 30,
        });
        let md: Vec<_> = sends(&out)
            .into_iter()
            .filter(|(t, _)| *t == msg::MARKET_DATA_REQUEST)
            .collect();
        assert_eq!(md.len(), 1);
    }
}
