//! Binary codec for protocol v1 (payload inside a length-delimited frame).
//!
//! Payload layout: a 16-byte header (`u32 version`, `u8 kind`, `u8 flags`,
//! `u16 reserved`, `u64 call_id`) followed by at most one self-describing
//! value. Values are tagged; maps and arrays nest.

use thiserror::Error;

use crate::protocol::{
    BatchRequest, EvaluationResult, MsgKind, KEY_INDICES, KEY_OFFSETS, KEY_POLICY_BINARY,
    KEY_POLICY_LEGACY, KEY_POLICY_OPPONENT, KEY_POLICY_PLAYER, KEY_POLICY_TARGET, KEY_VALUE,
    PROTOCOL_VERSION,
};

const TAG_F32: u8 = 0x01;
const TAG_F32_ARRAY: u8 = 0x02;
const TAG_I64_ARRAY: u8 = 0x03;
const TAG_MAP: u8 = 0x04;
const TAG_ARRAY: u8 = 0x05;
const TAG_STR: u8 = 0x06;

const HEADER_LEN: usize = 16;
const MAX_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload too short")]
    TooShort,
    #[error("unsupported protocol version: {0}")]
    BadVersion(u32),
    #[error("unexpected message kind: {0}")]
    BadKind(u8),
    #[error("unknown value tag: {0:#04x}")]
    BadTag(u8),
    #[error("value nesting exceeds {MAX_DEPTH}")]
    TooDeep,
    #[error("invalid utf-8 in key or string")]
    BadUtf8,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),
    #[error("field `{0}` is not finite")]
    NonFinite(&'static str),
    #[error("offsets are not a valid partition of indices")]
    BadOffsets,
    #[error("expected a map or an array of maps")]
    BadShape,
    #[error("trailing bytes after value")]
    Trailing,
}

/// A decoded protocol value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    F32(f32),
    F32Array(Vec<f32>),
    I64Array(Vec<i64>),
    Map(Vec<(String, Value)>),
    Array(Vec<Value>),
    Str(String),
}

impl Value {
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MsgKind,
    pub call_id: u64,
    pub body: Option<Value>,
}

pub fn encode_message(kind: MsgKind, call_id: u64, body: Option<&Value>) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    encode_message_into(&mut out, kind, call_id, body);
    out
}

pub fn encode_message_into(out: &mut Vec<u8>, kind: MsgKind, call_id: u64, body: Option<&Value>) {
    out.clear();
    out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    out.push(kind as u8);
    out.push(0); // flags
    out.extend_from_slice(&[0, 0]); // reserved
    out.extend_from_slice(&call_id.to_le_bytes());
    if let Some(v) = body {
        encode_value_into(out, v);
    }
}

/// Parse only the fixed header, so a reply with a broken body can still be
/// routed to its call.
pub fn decode_header(bytes: &[u8]) -> Result<(MsgKind, u64), DecodeError> {
    let mut c = Cursor::new(bytes);
    read_header(&mut c)
}

fn read_header(c: &mut Cursor<'_>) -> Result<(MsgKind, u64), DecodeError> {
    let version = c.read_u32()?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::BadVersion(version));
    }
    let kind_byte = c.read_u8()?;
    let kind = MsgKind::from_u8(kind_byte).ok_or(DecodeError::BadKind(kind_byte))?;
    let _flags = c.read_u8()?;
    c.skip(2)?;
    let call_id = c.read_u64()?;
    Ok((kind, call_id))
}

pub fn decode_message(bytes: &[u8]) -> Result<Message, DecodeError> {
    let mut c = Cursor::new(bytes);
    let (kind, call_id) = read_header(&mut c)?;
    let body = if c.remaining() == 0 {
        None
    } else {
        let v = decode_value(&mut c, 0)?;
        if c.remaining() != 0 {
            return Err(DecodeError::Trailing);
        }
        Some(v)
    };
    Ok(Message {
        kind,
        call_id,
        body,
    })
}

/// Encode an `Evaluate` message for one batch.
pub fn encode_batch_request(call_id: u64, req: &BatchRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + 32 + (req.indices.len() + req.offsets.len()) * 8);
    encode_message_into(&mut out, MsgKind::Evaluate, call_id, None);
    // Written by hand to avoid cloning the index arrays into a `Value`.
    out.push(TAG_MAP);
    out.extend_from_slice(&2u32.to_le_bytes());
    put_key(&mut out, KEY_INDICES);
    put_i64_array(&mut out, &req.indices);
    put_key(&mut out, KEY_OFFSETS);
    put_i64_array(&mut out, &req.offsets);
    out
}

/// Parse the body of an `Evaluate` message.
pub fn decode_batch_request(body: &Value) -> Result<BatchRequest, DecodeError> {
    let indices = match body.get(KEY_INDICES) {
        Some(Value::I64Array(v)) => v.clone(),
        Some(_) => return Err(DecodeError::WrongType(KEY_INDICES)),
        None => return Err(DecodeError::MissingField(KEY_INDICES)),
    };
    let offsets = match body.get(KEY_OFFSETS) {
        Some(Value::I64Array(v)) => v.clone(),
        Some(_) => return Err(DecodeError::WrongType(KEY_OFFSETS)),
        None => return Err(DecodeError::MissingField(KEY_OFFSETS)),
    };
    let mut prev = 0i64;
    for &o in &offsets {
        if o < prev || o as usize > indices.len() {
            return Err(DecodeError::BadOffsets);
        }
        prev = o;
    }
    if offsets.first().is_some_and(|&o| o != 0) {
        return Err(DecodeError::BadOffsets);
    }
    Ok(BatchRequest { indices, offsets })
}

/// Body value for a `Result` message: a single map, or an array of maps.
pub fn results_value(results: &[EvaluationResult], as_array: bool) -> Value {
    if !as_array && results.len() == 1 {
        return result_to_value(&results[0]);
    }
    Value::Array(results.iter().map(result_to_value).collect())
}

/// Demultiplex a `Result` body into per-sample results in submission order.
pub fn decode_results(body: &Value) -> Result<Vec<EvaluationResult>, DecodeError> {
    match body {
        Value::Map(_) => Ok(vec![value_to_result(body)?]),
        Value::Array(items) => items.iter().map(value_to_result).collect(),
        _ => Err(DecodeError::BadShape),
    }
}

fn result_to_value(r: &EvaluationResult) -> Value {
    let mut entries = vec![(KEY_VALUE.to_string(), Value::F32(r.value))];
    let policies = [
        (KEY_POLICY_PLAYER, &r.policy_player),
        (KEY_POLICY_OPPONENT, &r.policy_opponent),
        (KEY_POLICY_TARGET, &r.policy_target),
        (KEY_POLICY_BINARY, &r.policy_binary),
    ];
    for (k, p) in policies {
        if let Some(p) = p {
            entries.push((k.to_string(), Value::F32Array(p.clone())));
        }
    }
    Value::Map(entries)
}

fn value_to_result(v: &Value) -> Result<EvaluationResult, DecodeError> {
    if !matches!(v, Value::Map(_)) {
        return Err(DecodeError::BadShape);
    }
    let value = match v.get(KEY_VALUE) {
        Some(Value::F32(x)) => *x,
        Some(Value::F32Array(a)) if a.len() == 1 => a[0],
        Some(_) => return Err(DecodeError::WrongType(KEY_VALUE)),
        None => return Err(DecodeError::MissingField(KEY_VALUE)),
    };
    if !value.is_finite() {
        return Err(DecodeError::NonFinite(KEY_VALUE));
    }
    let policy_player = match policy_field(v, KEY_POLICY_PLAYER)? {
        Some(p) => Some(p),
        None => policy_field(v, KEY_POLICY_LEGACY)?,
    };
    Ok(EvaluationResult {
        value,
        policy_player,
        policy_opponent: policy_field(v, KEY_POLICY_OPPONENT)?,
        policy_target: policy_field(v, KEY_POLICY_TARGET)?,
        policy_binary: policy_field(v, KEY_POLICY_BINARY)?,
    })
}

fn policy_field(v: &Value, key: &'static str) -> Result<Option<Vec<f32>>, DecodeError> {
    match v.get(key) {
        Some(Value::F32Array(p)) => Ok(Some(p.clone())),
        Some(_) => Err(DecodeError::WrongType(key)),
        None => Ok(None),
    }
}

pub fn encode_value_into(out: &mut Vec<u8>, v: &Value) {
    match v {
        Value::F32(x) => {
            out.push(TAG_F32);
            out.extend_from_slice(&x.to_le_bytes());
        }
        Value::F32Array(a) => {
            out.push(TAG_F32_ARRAY);
            out.extend_from_slice(&(a.len() as u32).to_le_bytes());
            for &x in a {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        Value::I64Array(a) => put_i64_array(out, a),
        Value::Map(entries) => {
            out.push(TAG_MAP);
            out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for (k, v) in entries {
                put_key(out, k);
                encode_value_into(out, v);
            }
        }
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for v in items {
                encode_value_into(out, v);
            }
        }
        Value::Str(s) => {
            out.push(TAG_STR);
            put_key(out, s);
        }
    }
}

fn put_key(out: &mut Vec<u8>, k: &str) {
    let bytes = &k.as_bytes()[..k.len().min(u16::MAX as usize)];
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn put_i64_array(out: &mut Vec<u8>, a: &[i64]) {
    out.push(TAG_I64_ARRAY);
    out.extend_from_slice(&(a.len() as u32).to_le_bytes());
    for &x in a {
        out.extend_from_slice(&x.to_le_bytes());
    }
}

fn decode_value(c: &mut Cursor<'_>, depth: usize) -> Result<Value, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::TooDeep);
    }
    let tag = c.read_u8()?;
    match tag {
        TAG_F32 => Ok(Value::F32(c.read_f32()?)),
        TAG_F32_ARRAY => {
            let n = c.read_len(4)?;
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(c.read_f32()?);
            }
            Ok(Value::F32Array(v))
        }
        TAG_I64_ARRAY => {
            let n = c.read_len(8)?;
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(c.read_i64()?);
            }
            Ok(Value::I64Array(v))
        }
        TAG_MAP => {
            let n = c.read_len(3)?;
            let mut entries = Vec::with_capacity(n);
            for _ in 0..n {
                let k = c.read_str()?;
                let v = decode_value(c, depth + 1)?;
                entries.push((k, v));
            }
            Ok(Value::Map(entries))
        }
        TAG_ARRAY => {
            let n = c.read_len(1)?;
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(decode_value(c, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        TAG_STR => Ok(Value::Str(c.read_str()?)),
        other => Err(DecodeError::BadTag(other)),
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, off: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.off
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::TooShort);
        }
        let s = &self.bytes[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.take(n).map(|_| ())
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(self.read_u64()? as i64)
    }

    fn read_f32(&mut self) -> Result<f32, DecodeError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Element count, rejected early if the remaining bytes cannot hold it.
    fn read_len(&mut self, min_elem_bytes: usize) -> Result<usize, DecodeError> {
        let n = self.read_u32()? as usize;
        if n.saturating_mul(min_elem_bytes) > self.remaining() {
            return Err(DecodeError::TooShort);
        }
        Ok(n)
    }

    fn read_str(&mut self) -> Result<String, DecodeError> {
        let n = self.read_u16()? as usize;
        let b = self.take(n)?;
        String::from_utf8(b.to_vec()).map_err(|_| DecodeError::BadUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_request_survives_the_wire() {
        let req = BatchRequest::from_samples(&[vec![3i64, 1, 4], vec![1], vec![5, 9]]);
        let bytes = encode_batch_request(77, &req);
        let msg = decode_message(&bytes).unwrap();
        assert_eq!(msg.kind, MsgKind::Evaluate);
        assert_eq!(msg.call_id, 77);
        let got = decode_batch_request(msg.body.as_ref().unwrap()).unwrap();
        assert_eq!(got, req);
    }

    #[test]
    fn single_map_and_array_bodies_both_demultiplex() {
        let r = EvaluationResult {
            value: 0.25,
            policy_player: Some(vec![0.1, 0.2]),
            policy_binary: Some(vec![-1.0, 1.0]),
            ..EvaluationResult::default()
        };
        let single = results_value(std::slice::from_ref(&r), false);
        assert!(matches!(single, Value::Map(_)));
        assert_eq!(decode_results(&single).unwrap(), vec![r.clone()]);

        let many = results_value(&[r.clone(), EvaluationResult::value_only(-0.5)], true);
        let got = decode_results(&many).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], r);
        assert_eq!(got[1].value, -0.5);
        assert!(got[1].policy_player.is_none());
    }

    #[test]
    fn legacy_policy_key_maps_to_player_policy() {
        let body = Value::Map(vec![
            ("value".to_string(), Value::F32(0.5)),
            ("policy".to_string(), Value::F32Array(vec![1.0, 2.0, 3.0])),
        ]);
        let got = decode_results(&body).unwrap();
        assert_eq!(got[0].policy_player.as_deref(), Some(&[1.0f32, 2.0, 3.0][..]));
    }

    #[test]
    fn non_finite_value_is_rejected() {
        for x in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let body = Value::Array(vec![
                Value::Map(vec![("value".to_string(), Value::F32(0.1))]),
                Value::Map(vec![("value".to_string(), Value::F32(x))]),
            ]);
            assert!(matches!(
                decode_results(&body),
                Err(DecodeError::NonFinite("value"))
            ));
        }
    }

    #[test]
    fn missing_value_is_an_error() {
        let body = Value::Map(vec![(
            "policy_player".to_string(),
            Value::F32Array(vec![0.0]),
        )]);
        assert!(matches!(
            decode_results(&body),
            Err(DecodeError::MissingField("value"))
        ));
        assert!(matches!(
            decode_results(&Value::F32(1.0)),
            Err(DecodeError::BadShape)
        ));
    }

    #[test]
    fn truncated_and_malformed_payloads_are_rejected() {
        let req = BatchRequest::from_samples(&[vec![1i64, 2, 3]]);
        let bytes = encode_batch_request(1, &req);
        assert!(matches!(
            decode_message(&bytes[..bytes.len() - 3]),
            Err(DecodeError::TooShort)
        ));

        let mut bad_version = bytes.clone();
        bad_version[0] = 9;
        assert!(matches!(
            decode_message(&bad_version),
            Err(DecodeError::BadVersion(9))
        ));

        let mut bad_tag = encode_message(MsgKind::Result, 1, None);
        bad_tag.push(0x7f);
        assert!(matches!(decode_message(&bad_tag), Err(DecodeError::BadTag(0x7f))));

        // A huge declared length must not allocate.
        let mut huge = encode_message(MsgKind::Result, 1, None);
        huge.push(TAG_I64_ARRAY);
        huge.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(decode_message(&huge), Err(DecodeError::TooShort)));
    }

    #[test]
    fn non_monotonic_offsets_are_rejected() {
        let body = Value::Map(vec![
            ("indices".to_string(), Value::I64Array(vec![1, 2, 3])),
            ("offsets".to_string(), Value::I64Array(vec![0, 2, 1])),
        ]);
        assert!(matches!(
            decode_batch_request(&body),
            Err(DecodeError::BadOffsets)
        ));
    }

    #[test]
    fn health_messages_have_no_body() {
        let bytes = encode_message(MsgKind::Health, 0, None);
        assert_eq!(bytes.len(), HEADER_LEN);
        let msg = decode_message(&bytes).unwrap();
        assert_eq!(msg.kind, MsgKind::Health);
        assert!(msg.body.is_none());
    }
}
