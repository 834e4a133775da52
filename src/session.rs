// ===============================
// src/session.rs
// ===============================
//
// One FIX session per stream kind. The task owns the TCP connection, the
// outgoing sequence counter, and the logon/heartbeat/reconnect lifecycle:
//
//   Disconnected -> Connecting -> LoggingOn -> LoggedOn
//     -> LoggingOut -> Disconnected            (explicit logout)
//     -> ConnectionLost -> Reconnecting -> ... (transport failure)
//
// Admin traffic (heartbeats, test requests, resend requests) is answered
// here; decoded application messages are handed to the engine task over a
// channel. A reachability probe decides between reconnecting with backoff
// and surfacing a fatal connectivity error.

use rand::Rng;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::buffer::StreamBuffer;
use crate::domain::StreamKind;
use crate::fix::{self, field, msg, FixMessage};
use crate::metrics::{MSGS_IN, MSGS_OUT, PROTO_ERRORS, RECONNECTS, SESSION_UP};

/// Lifecycle states of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    LoggingOn,
    LoggedOn,
    LoggingOut,
    ConnectionLost,
    Reconnecting,
}

/// Per-session configuration, derived from `config::Args`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub kind: StreamKind,
    pub host: String,
    pub port: u16,
    pub sender_comp_id: String,
    pub username: String,
    pub password: String,
    pub heartbeat_secs: u64,
    pub probe_host: String,
    pub probe_port: u16,
}

/// Instructions from the engine to a session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Stamp the header onto `fields` and transmit.
    Send {
        msg_type: String,
        fields: Vec<(u32, String)>,
    },
    /// Piggyback a RequestForPositions on every heartbeat (Trade stream,
    /// enabled once the security catalog has loaded).
    RefreshPositionsOnHeartbeat(bool),
    /// Send a Logout, close the socket and stop the session task.
    Logout,
}

/// Notifications from a session to the engine.
#[derive(Debug)]
pub enum SessionEvent {
    LoggedOn {
        kind: StreamKind,
        heartbeat_secs: u64,
    },
    ConnectionLost {
        kind: StreamKind,
    },
    Fatal {
        kind: StreamKind,
        reason: String,
    },
    Message {
        kind: StreamKind,
        msg: FixMessage,
    },
}

/// Strictly increasing outgoing sequence numbers, starting at 1. Each
/// session owns one; the two streams never share sequence space, and a
/// number is never reused within a connection's lifetime.
#[derive(Debug)]
pub struct Sequencer {
    next: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn take(&mut self) -> u64 {
        let s = self.next;
        self.next += 1;
        s
    }

    pub fn peek(&self) -> u64 {
        self.next
    }
}

// ---- Admin message bodies (pure construction, tested without sockets) ----

pub fn logon_fields(cfg: &SessionConfig) -> Vec<(u32, String)> {
    vec![
        (field::ENCRYPT_METHOD, "0".to_string()),
        (field::HEART_BT_INT, cfg.heartbeat_secs.to_string()),
        (field::RESET_SEQ_NUM_FLAG, "Y".to_string()),
        (field::USERNAME, cfg.username.clone()),
        (field::PASSWORD, cfg.password.clone()),
    ]
}

pub fn heartbeat_fields(test_req_id: Option<&str>) -> Vec<(u32, String)> {
    match test_req_id {
        Some(id) => vec![(field::TEST_REQ_ID, id.to_string())],
        None => Vec::new(),
    }
}

/// Reply to an inbound TestRequest: one Heartbeat carrying back the same
/// TestReqID.
pub fn test_request_reply(m: &FixMessage) -> Vec<(u32, String)> {
    heartbeat_fields(m.get(field::TEST_REQ_ID))
}

/// Reply to a server ResendRequest. The engine keeps no outbound message
/// store, so the gap is closed with a SequenceReset-GapFill pointing at the
/// next outgoing sequence number.
pub fn gap_fill_fields(new_seq: u64) -> Vec<(u32, String)> {
    vec![
        (field::GAP_FILL_FLAG, "Y".to_string()),
        (field::NEW_SEQ_NO, new_seq.to_string()),
    ]
}

pub fn positions_request_fields(req_id: &str) -> Vec<(u32, String)> {
    vec![(field::POS_REQ_ID, req_id.to_string())]
}

// ---- Wire half: header stamping + sequencing on top of the write half ----

struct Wire {
    kind: StreamKind,
    sender_comp_id: String,
    seq: Sequencer,
    wr: OwnedWriteHalf,
}

impl Wire {
    async fn send(&mut self, msg_type: &str, fields: &[(u32, String)]) -> std::io::Result<()> {
        let seq = self.seq.take();
        let bytes = fix::encode(self.kind, msg_type, seq, &self.sender_comp_id, fields);
        self.wr.write_all(&bytes).await?;
        MSGS_OUT.with_label_values(&[self.kind.label()]).inc();
        debug!(stream = self.kind.label(), msg_type, seq, "SEND >>>");
        Ok(())
    }
}

/// Plain TCP connect to a well-known endpoint, deciding reconnect vs fatal.
async fn probe(host: &str, port: u16) -> bool {
    matches!(
        timeout(Duration::from_secs(2), TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Exponential backoff with jitter between reconnect attempts (0.5s..32s).
async fn backoff_sleep(attempt: u32) {
    let shift = attempt.min(6);
    let factor = 1u64 << shift;
    let base_ms = 500u64.saturating_mul(factor);
    let jitter = rand::thread_rng().gen_range(0..=250);
    sleep(Duration::from_millis(base_ms + jitter)).await;
}

fn heartbeat_interval(secs: u64) -> Interval {
    let period = Duration::from_secs(secs.max(1));
    let mut iv = interval_at(Instant::now() + period, period);
    iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
    iv
}

fn set_state(kind: StreamKind, state: &mut SessionState, next: SessionState) {
    if *state != next {
        debug!(stream = kind.label(), from = ?state, to = ?next, "session state");
        *state = next;
    }
    SESSION_UP
        .with_label_values(&[kind.label()])
        .set(i64::from(next == SessionState::LoggedOn));
}

/// Session task: keeps one stream connected and logged on until a Logout
/// command arrives or the reachability probe declares the network dead.
pub async fn run(
    cfg: SessionConfig,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    ev_tx: mpsc::Sender<SessionEvent>,
) {
    let kind = cfg.kind;
    let mut state = SessionState::Disconnected;
    let mut attempt: u32 = 0;

    loop {
        set_state(kind, &mut state, SessionState::Connecting);
        info!(stream = kind.label(), host = %cfg.host, port = cfg.port, "connecting");
        let stream = match TcpStream::connect((cfg.host.as_str(), cfg.port)).await {
            Ok(s) => s,
            Err(e) => {
                error!(stream = kind.label(), ?e, "connect failed");
                set_state(kind, &mut state, SessionState::ConnectionLost);
                if !probe(&cfg.probe_host, cfg.probe_port).await {
                    let _ = ev_tx
                        .send(SessionEvent::Fatal {
                            kind,
                            reason: format!("connect failed and probe unreachable: {e}"),
                        })
                        .await;
                    return;
                }
                set_state(kind, &mut state, SessionState::Reconnecting);
                attempt = attempt.saturating_add(1);
                RECONNECTS.with_label_values(&[kind.label()]).inc();
                backoff_sleep(attempt).await;
                continue;
            }
        };
        attempt = 0;

        let (mut rd, wr) = stream.into_split();
        // Fresh connection: new sequence space, logon carries 141=Y.
        let mut wire = Wire {
            kind,
            sender_comp_id: cfg.sender_comp_id.clone(),
            seq: Sequencer::new(),
            wr,
        };
        let mut buf = StreamBuffer::new();
        let mut logged_on = false;
        let mut refresh_positions = false;
        let mut hb = heartbeat_interval(cfg.heartbeat_secs);
        let mut chunk = vec![0u8; 65535];

        set_state(kind, &mut state, SessionState::LoggingOn);
        if let Err(e) = wire.send(msg::LOGON, &logon_fields(&cfg)).await {
            error!(stream = kind.label(), ?e, "logon send failed");
        } else {
            'conn: loop {
                tokio::select! {
                    r = rd.read(&mut chunk) => match r {
                        Ok(0) => {
                            info!(stream = kind.label(), "peer closed connection");
                            break 'conn;
                        }
                        Ok(n) => {
                            buf.write(&chunk[..n]);
                            loop {
                                match fix::extract_frame(&mut buf) {
                                    Ok(Some(raw)) => {
                                        MSGS_IN.with_label_values(&[kind.label()]).inc();
                                        match fix::decode(&raw) {
                                            Ok(m) => {
                                                if handle_message(
                                                    &cfg, m, &mut wire, &mut hb,
                                                    &mut logged_on, &mut state, &ev_tx,
                                                )
                                                .await
                                                .is_err()
                                                {
                                                    break 'conn;
                                                }
                                            }
                                            Err(e) => {
                                                PROTO_ERRORS.inc();
                                                warn!(
                                                    stream = kind.label(),
                                                    error = %e,
                                                    raw = %String::from_utf8_lossy(&raw),
                                                    "dropping undecodable message"
                                                );
                                            }
                                        }
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        PROTO_ERRORS.inc();
                                        warn!(
                                            stream = kind.label(),
                                            error = %e,
                                            raw = %String::from_utf8_lossy(buf.peek(64)),
                                            "framing error, resyncing"
                                        );
                                        fix::resync(&mut buf);
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            error!(stream = kind.label(), ?e, "read error");
                            break 'conn;
                        }
                    },
                    maybe = cmd_rx.recv() => match maybe {
                        Some(SessionCommand::Send { msg_type, fields }) => {
                            if let Err(e) = wire.send(&msg_type, &fields).await {
                                error!(stream = kind.label(), ?e, %msg_type, "send failed");
                                break 'conn;
                            }
                        }
                        Some(SessionCommand::RefreshPositionsOnHeartbeat(on)) => {
                            refresh_positions = on;
                        }
                        Some(SessionCommand::Logout) | None => {
                            set_state(kind, &mut state, SessionState::LoggingOut);
                            let _ = wire.send(msg::LOGOUT, &[]).await;
                            info!(stream = kind.label(), "logged out");
                            set_state(kind, &mut state, SessionState::Disconnected);
                            return;
                        }
                    },
                    _ = hb.tick() => {
                        if logged_on {
                            if wire.send(msg::HEARTBEAT, &heartbeat_fields(None)).await.is_err() {
                                break 'conn;
                            }
                            if kind == StreamKind::Trade && refresh_positions {
                                let req_id = wire.seq.peek().to_string();
                                if wire
                                    .send(msg::REQUEST_FOR_POSITIONS, &positions_request_fields(&req_id))
                                    .await
                                    .is_err()
                                {
                                    break 'conn;
                                }
                            }
                        }
                    }
                }
            }
        }

        set_state(kind, &mut state, SessionState::ConnectionLost);
        let _ = ev_tx.send(SessionEvent::ConnectionLost { kind }).await;
        if !probe(&cfg.probe_host, cfg.probe_port).await {
            let _ = ev_tx
                .send(SessionEvent::Fatal {
                    kind,
                    reason: "connection lost and probe unreachable".to_string(),
                })
                .await;
            return;
        }
        set_state(kind, &mut state, SessionState::Reconnecting);
        attempt = attempt.saturating_add(1);
        RECONNECTS.with_label_values(&[kind.label()]).inc();
        backoff_sleep(attempt).await;
    }
}

/// Dispatch one decoded inbound message. Admin messages are answered in
/// place; everything else is forwarded to the engine. An Err return means
/// the connection is no longer usable.
async fn handle_message(
    cfg: &SessionConfig,
    m: FixMessage,
    wire: &mut Wire,
    hb: &mut Interval,
    logged_on: &mut bool,
    state: &mut SessionState,
    ev_tx: &mpsc::Sender<SessionEvent>,
) -> std::io::Result<()> {
    let kind = cfg.kind;
    match m.msg_type() {
        msg::LOGON => {
            *logged_on = true;
            set_state(kind, state, SessionState::LoggedOn);
            // Heartbeat at the venue's negotiated interval.
            let secs = m.get_u64(field::HEART_BT_INT).unwrap_or(cfg.heartbeat_secs);
            *hb = heartbeat_interval(secs);
            info!(stream = kind.label(), heartbeat_secs = secs, "logged on");
            let _ = ev_tx
                .send(SessionEvent::LoggedOn {
                    kind,
                    heartbeat_secs: secs,
                })
                .await;
        }
        msg::HEARTBEAT => {
            debug!(stream = kind.label(), "heartbeat");
        }
        msg::TEST_REQUEST => {
            wire.send(msg::HEARTBEAT, &test_request_reply(&m)).await?;
        }
        msg::RESEND_REQUEST => {
            warn!(
                stream = kind.label(),
                from = m.get(field::BEGIN_SEQ_NO).unwrap_or("?"),
                to = m.get(field::END_SEQ_NO).unwrap_or("?"),
                "resend requested, answering with gap fill"
            );
            // NewSeqNo points past the SequenceReset message itself.
            let fields = gap_fill_fields(wire.seq.peek() + 1);
            wire.send(msg::SEQUENCE_RESET, &fields).await?;
        }
        msg::LOGOUT => {
            *logged_on = false;
            warn!(
                stream = kind.label(),
                text = m.get(field::TEXT).unwrap_or(""),
                "venue sent logout"
            );
        }
        _ => {
            let _ = ev_tx.send(SessionEvent::Message { kind, msg: m }).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg(kind: StreamKind) -> SessionConfig {
        SessionConfig {
            kind,
            host: "127.0.0.1".to_string(),
            port: 5202,
            sender_comp_id: "demo.icmarkets.123".to_string(),
            username: "123".to_string(),
            password: "secret".to_string(),
            heartbeat_secs: 30,
            probe_host: "127.0.0.1".to_string(),
            probe_port: 80,
        }
    }

    #[test]
    fn sequencer_is_monotonic_from_one() {
        let mut s = Sequencer::new();
        let seqs: Vec<u64> = (0..5).map(|_| s.take()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(s.peek(), 6);
    }

    #[test]
    fn sessions_do_not_share_sequence_space() {
        let mut q = Sequencer::new();
        let mut t = Sequencer::new();
        assert_eq!(q.take(), 1);
        assert_eq!(q.take(), 2);
        // The trade counter is unaffected by quote sends.
        assert_eq!(t.take(), 1);
    }

    #[test]
    fn consecutive_sends_stamp_gapless_seq_nums() {
        let cfg = test_cfg(StreamKind::Trade);
        let mut seq = Sequencer::new();
        for expect in 1..=4u64 {
            let bytes = fix::encode(
                cfg.kind,
                msg::HEARTBEAT,
                seq.take(),
                &cfg.sender_comp_id,
                &[],
            );
            let m = fix::decode(&bytes).unwrap();
            assert_eq!(m.get_u64(field::MSG_SEQ_NUM), Some(expect));
        }
    }

    #[test]
    fn logon_carries_credentials_and_reset_flag() {
        let cfg = test_cfg(StreamKind::Quote);
        let fields = logon_fields(&cfg);
        let bytes = fix::encode(cfg.kind, msg::LOGON, 1, &cfg.sender_comp_id, &fields);
        let m = fix::decode(&bytes).unwrap();
        assert_eq!(m.msg_type(), "A");
        assert_eq!(m.get(field::ENCRYPT_METHOD), Some("0"));
        assert_eq!(m.get(field::HEART_BT_INT), Some("30"));
        assert_eq!(m.get(field::RESET_SEQ_NUM_FLAG), Some("Y"));
        assert_eq!(m.get(field::USERNAME), Some("123"));
        assert_eq!(m.get(field::PASSWORD), Some("secret"));
        assert_eq!(m.get(field::SENDER_SUB_ID), Some("QUOTE"));
    }

    #[test]
    fn test_request_echoes_test_req_id_exactly_once() {
        let inbound = FixMessage {
            fields: vec![
                (field::MSG_TYPE, "1".into()),
                (field::TEST_REQ_ID, "42".into()),
            ],
        };
        let reply = test_request_reply(&inbound);
        let echoes: Vec<_> = reply
            .iter()
            .filter(|(t, _)| *t == field::TEST_REQ_ID)
            .collect();
        assert_eq!(echoes.len(), 1);
        assert_eq!(echoes[0].1, "42");

        // Encoded as a Heartbeat, not a TestRequest.
        let bytes = fix::encode(StreamKind::Trade, msg::HEARTBEAT, 9, "s", &reply);
        let m = fix::decode(&bytes).unwrap();
        assert_eq!(m.msg_type(), "0");
        assert_eq!(m.get(field::TEST_REQ_ID), Some("42"));
    }

    #[test]
    fn gap_fill_points_at_next_outgoing_seq() {
        let fields = gap_fill_fields(17);
        assert!(fields.contains(&(field::GAP_FILL_FLAG, "Y".to_string())));
        assert!(fields.contains(&(field::NEW_SEQ_NO, "17".to_string())));
    }
}
