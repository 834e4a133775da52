// ===============================
// src/fix.rs
// ===============================
//
// FIX 4.4 wire codec: tag constants, message encoding with computed
// BodyLength/CheckSum, BodyLength-driven inbound framing, decoding into an
// ordered field list, and repeating-group extraction.

use ahash::AHashMap as HashMap;
use chrono::Utc;
use thiserror::Error;

use crate::buffer::StreamBuffer;
use crate::domain::StreamKind;

/// Field delimiter between tag=value pairs.
pub const SOH: u8 = 0x01;
/// Protocol version sent as BeginString.
pub const BEGIN_STRING: &str = "FIX.4.4";
/// Venue-side CompID.
pub const TARGET_COMP_ID: &str = "CSERVER";
/// Wire size of the trailing `10=XXX<SOH>` field.
const CHECKSUM_FIELD_LEN: usize = 7;

/// Tag numbers used by the engine (FIX 4.4 subset).
pub mod field {
    pub const BEGIN_SEQ_NO: u32 = 7;
    pub const BEGIN_STRING: u32 = 8;
    pub const BODY_LENGTH: u32 = 9;
    pub const CHECK_SUM: u32 = 10;
    pub const CL_ORD_ID: u32 = 11;
    pub const CUM_QTY: u32 = 14;
    pub const END_SEQ_NO: u32 = 16;
    pub const MSG_SEQ_NUM: u32 = 34;
    pub const MSG_TYPE: u32 = 35;
    pub const NEW_SEQ_NO: u32 = 36;
    pub const ORDER_ID: u32 = 37;
    pub const ORDER_QTY: u32 = 38;
    pub const ORD_STATUS: u32 = 39;
    pub const ORD_TYPE: u32 = 40;
    pub const ORIG_CL_ORD_ID: u32 = 41;
    pub const PRICE: u32 = 44;
    pub const SENDER_COMP_ID: u32 = 49;
    pub const SENDER_SUB_ID: u32 = 50;
    pub const SENDING_TIME: u32 = 52;
    pub const SIDE: u32 = 54;
    pub const SYMBOL: u32 = 55;
    pub const TARGET_COMP_ID: u32 = 56;
    pub const TARGET_SUB_ID: u32 = 57;
    pub const TEXT: u32 = 58;
    pub const TIME_IN_FORCE: u32 = 59;
    pub const TRANSACT_TIME: u32 = 60;
    pub const ENCRYPT_METHOD: u32 = 98;
    pub const STOP_PX: u32 = 99;
    pub const HEART_BT_INT: u32 = 108;
    pub const TEST_REQ_ID: u32 = 112;
    pub const GAP_FILL_FLAG: u32 = 123;
    pub const RESET_SEQ_NUM_FLAG: u32 = 141;
    pub const NO_RELATED_SYM: u32 = 146;
    pub const EXEC_TYPE: u32 = 150;
    pub const LEAVES_QTY: u32 = 151;
    pub const MD_REQ_ID: u32 = 262;
    pub const SUBSCRIPTION_REQUEST_TYPE: u32 = 263;
    pub const MARKET_DEPTH: u32 = 264;
    pub const NO_MD_ENTRY_TYPES: u32 = 267;
    pub const NO_MD_ENTRIES: u32 = 268;
    pub const MD_ENTRY_TYPE: u32 = 269;
    pub const MD_ENTRY_PX: u32 = 270;
    pub const MD_ENTRY_SIZE: u32 = 271;
    pub const MD_ENTRY_ID: u32 = 278;
    pub const MD_UPDATE_ACTION: u32 = 279;
    pub const SECURITY_REQ_ID: u32 = 320;
    pub const DESIGNATION: u32 = 494;
    pub const USERNAME: u32 = 553;
    pub const PASSWORD: u32 = 554;
    pub const SECURITY_LIST_REQUEST_TYPE: u32 = 559;
    pub const MASS_STATUS_REQ_ID: u32 = 584;
    pub const MASS_STATUS_REQ_TYPE: u32 = 585;
    pub const LONG_QTY: u32 = 704;
    pub const SHORT_QTY: u32 = 705;
    pub const POS_REQ_ID: u32 = 710;
    pub const POS_MAINT_RPT_ID: u32 = 721;
    pub const TOTAL_NUM_POS_REPORTS: u32 = 727;
    pub const POS_REQ_RESULT: u32 = 728;
    pub const SETTL_PRICE: u32 = 730;
    pub const SYMBOL_NAME: u32 = 1007;
    pub const SYMBOL_DIGITS: u32 = 1008;
}

/// MsgType (tag 35) codes.
pub mod msg {
    pub const HEARTBEAT: &str = "0";
    pub const TEST_REQUEST: &str = "1";
    pub const RESEND_REQUEST: &str = "2";
    pub const REJECT: &str = "3";
    pub const SEQUENCE_RESET: &str = "4";
    pub const LOGOUT: &str = "5";
    pub const EXECUTION_REPORT: &str = "8";
    pub const ORDER_CANCEL_REJECT: &str = "9";
    pub const LOGON: &str = "A";
    pub const NEW_ORDER_SINGLE: &str = "D";
    pub const ORDER_CANCEL_REQUEST: &str = "F";
    pub const MARKET_DATA_REQUEST: &str = "V";
    pub const MARKET_DATA_SNAPSHOT: &str = "W";
    pub const MARKET_DATA_INCREMENTAL: &str = "X";
    pub const BUSINESS_REJECT: &str = "j";
    pub const SECURITY_LIST_REQUEST: &str = "x";
    pub const SECURITY_LIST: &str = "y";
    pub const ORDER_MASS_STATUS_REQUEST: &str = "AF";
    pub const REQUEST_FOR_POSITIONS: &str = "AN";
    pub const POSITION_REPORT: &str = "AP";
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("framing error: {0}")]
    Framing(String),
    #[error("malformed field: {0}")]
    MalformedField(String),
    #[error("checksum mismatch: declared {declared:03}, computed {computed:03}")]
    Checksum { declared: u8, computed: u8 },
}

/// Current UTC time in the FIX timestamp format (YYYYMMDD-HH:MM:SS).
pub fn fix_time() -> String {
    Utc::now().format("%Y%m%d-%H:%M:%S").to_string()
}

/// Byte sum modulo 256 over everything before the CheckSum field.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u32, |s, &b| s.wrapping_add(b as u32)) as u8
}

/// A decoded FIX message: tag/value pairs in wire order. Header field order
/// matters; body lookups are first-match.
#[derive(Debug, Clone, Default)]
pub struct FixMessage {
    pub fields: Vec<(u32, String)>,
}

impl FixMessage {
    /// First value for `tag`, if present.
    pub fn get(&self, tag: u32) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == tag)
            .map(|(_, v)| v.as_str())
    }

    pub fn msg_type(&self) -> &str {
        self.get(field::MSG_TYPE).unwrap_or("")
    }

    pub fn get_i64(&self, tag: u32) -> Option<i64> {
        self.get(tag).and_then(|v| v.parse().ok())
    }

    pub fn get_u64(&self, tag: u32) -> Option<u64> {
        self.get(tag).and_then(|v| v.parse().ok())
    }

    pub fn get_f64(&self, tag: u32) -> Option<f64> {
        self.get(tag).and_then(|v| v.parse().ok())
    }

    /// Extract repeating groups: scan forward to `count_tag`, then split the
    /// following fields into instances each time `start_tag` reappears (or
    /// `end_tag` is seen), until `count` instances have been collected.
    pub fn groups(
        &self,
        count_tag: u32,
        start_tag: u32,
        end_tag: Option<u32>,
    ) -> Vec<HashMap<u32, String>> {
        let mut count: Option<i64> = None;
        let mut result: Vec<HashMap<u32, String>> = Vec::new();
        let mut item: HashMap<u32, String> = HashMap::new();

        for (k, v) in &self.fields {
            match count {
                None => {
                    if *k == count_tag {
                        count = Some(v.parse().unwrap_or(0));
                    }
                }
                Some(c) if c <= 0 => break,
                Some(ref mut c) => {
                    if (*k == start_tag && !item.is_empty()) || Some(*k) == end_tag {
                        result.push(std::mem::take(&mut item));
                        *c -= 1;
                        if *c == 0 {
                            // Declared count reached; trailing fields are
                            // not part of any group.
                            return result;
                        }
                    }
                    item.insert(*k, v.clone());
                }
            }
        }
        if !item.is_empty() {
            result.push(item);
        }
        result
    }
}

fn push_field(buf: &mut Vec<u8>, tag: u32, value: &str) {
    buf.extend_from_slice(tag.to_string().as_bytes());
    buf.push(b'=');
    buf.extend_from_slice(value.as_bytes());
    buf.push(SOH);
}

/// Encode one outbound message. Header fields are stamped in fixed order:
/// BeginString, BodyLength, MsgType, SenderCompID, SenderSubID,
/// TargetCompID, TargetSubID, MsgSeqNum, SendingTime, then `body`.
/// BodyLength counts the bytes from MsgType through the last body field
/// (delimiters included); CheckSum is the mod-256 byte sum over everything
/// before it, rendered as exactly three digits.
pub fn encode(
    stream: StreamKind,
    msg_type: &str,
    seq: u64,
    sender_comp_id: &str,
    body: &[(u32, String)],
) -> Vec<u8> {
    let mut inner: Vec<u8> = Vec::with_capacity(128);
    push_field(&mut inner, field::MSG_TYPE, msg_type);
    push_field(&mut inner, field::SENDER_COMP_ID, sender_comp_id);
    push_field(&mut inner, field::SENDER_SUB_ID, stream.sub_id());
    push_field(&mut inner, field::TARGET_COMP_ID, TARGET_COMP_ID);
    push_field(&mut inner, field::TARGET_SUB_ID, stream.sub_id());
    push_field(&mut inner, field::MSG_SEQ_NUM, &seq.to_string());
    push_field(&mut inner, field::SENDING_TIME, &fix_time());
    for (t, v) in body {
        push_field(&mut inner, *t, v);
    }

    let mut out: Vec<u8> = Vec::with_capacity(inner.len() + 32);
    push_field(&mut out, field::BEGIN_STRING, BEGIN_STRING);
    push_field(&mut out, field::BODY_LENGTH, &inner.len().to_string());
    out.extend_from_slice(&inner);
    let sum = checksum(&out);
    out.extend_from_slice(format!("10={sum:03}").as_bytes());
    out.push(SOH);
    out
}

/// Pull one complete message off the buffer, if fully received.
///
/// A message's exact length is only known after the BodyLength value has
/// been fully buffered: wait for the SOH terminating tag 9, then require
/// `BodyLength` plus the 7-byte CheckSum field. BodyLength's digit count
/// varies, so no fixed-size header read is ever assumed.
pub fn extract_frame(buf: &mut StreamBuffer) -> Result<Option<Vec<u8>>, CodecError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let bytes = buf.peek(buf.count());

    let begin = b"8=FIX.4.4\x01";
    if bytes.len() < begin.len() {
        return if begin.starts_with(bytes) {
            Ok(None)
        } else {
            Err(CodecError::Framing("missing BeginString".into()))
        };
    }
    if !bytes.starts_with(begin) {
        return Err(CodecError::Framing("missing BeginString".into()));
    }

    let rest = &bytes[begin.len()..];
    if rest.len() < 2 {
        return Ok(None);
    }
    if &rest[..2] != b"9=" {
        return Err(CodecError::Framing("missing BodyLength".into()));
    }
    // BodyLength value is complete only once its SOH has arrived.
    let soh_at = match rest.iter().position(|&b| b == SOH) {
        Some(p) => p,
        None => return Ok(None),
    };
    let digits = &rest[2..soh_at];
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        return Err(CodecError::Framing("bad BodyLength".into()));
    }
    let body_len: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CodecError::Framing("BodyLength overflow".into()))?;

    let total = begin.len() + soh_at + 1 + body_len + CHECKSUM_FIELD_LEN;
    if buf.count() < total {
        return Ok(None);
    }
    Ok(Some(buf.read(total)))
}

/// After a framing error, drop buffered bytes up to the next BeginString so
/// one corrupt run cannot poison the rest of the stream.
pub fn resync(buf: &mut StreamBuffer) {
    let bytes = buf.peek(buf.count());
    let pat = b"8=FIX";
    let pos = bytes
        .windows(pat.len())
        .skip(1)
        .position(|w| w == pat)
        .map(|p| p + 1);
    match pos {
        Some(p) => buf.discard(p),
        None => {
            let n = buf.count();
            buf.discard(n);
        }
    }
}

/// Decode one framed message into an ordered field list, verifying the
/// checksum. A failure drops this message only, never the session.
pub fn decode(raw: &[u8]) -> Result<FixMessage, CodecError> {
    if raw.len() < CHECKSUM_FIELD_LEN || raw.last() != Some(&SOH) {
        return Err(CodecError::Framing("truncated message".into()));
    }
    let chk_offset = raw.len() - CHECKSUM_FIELD_LEN;
    if !raw[chk_offset..].starts_with(b"10=") {
        return Err(CodecError::Framing("missing CheckSum".into()));
    }
    let computed = checksum(&raw[..chk_offset]);

    let mut fields: Vec<(u32, String)> = Vec::with_capacity(16);
    let mut declared: Option<u8> = None;
    for part in raw.split(|&b| b == SOH).filter(|p| !p.is_empty()) {
        let eq = part.iter().position(|&b| b == b'=').ok_or_else(|| {
            CodecError::MalformedField(String::from_utf8_lossy(part).into_owned())
        })?;
        let tag: u32 = std::str::from_utf8(&part[..eq])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                CodecError::MalformedField(String::from_utf8_lossy(part).into_owned())
            })?;
        let value = String::from_utf8_lossy(&part[eq + 1..]).into_owned();
        if tag == field::CHECK_SUM {
            declared = value.parse::<u16>().ok().map(|v| (v & 0xff) as u8);
        }
        fields.push((tag, value));
    }

    match declared {
        Some(d) if d == computed => Ok(FixMessage { fields }),
        Some(d) => Err(CodecError::Checksum {
            declared: d,
            computed,
        }),
        None => Err(CodecError::Framing("missing CheckSum".into())),
    }
}
