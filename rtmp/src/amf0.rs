//! AMF0 value encoding, used for every RTMP command/data message
//! (`connect`, `createStream`, `publish`, `play`, `_result`, `onStatus`,
//! `onMetaData`, ...).
//!
//! Grounded in `format/rtmp/rtmp.go`'s use of its (unretrieved) `amf` package
//! for `writeMsgHdr`/parsing `NetConnection.connect`/etc: the marker bytes and
//! grammar below are AMF0's well-known wire format (Adobe AMF0 spec), encoded
//! the way that file's call sites expect (`AMFMap`/`AMFArray` keyed maps and
//! nested primitives).

use failure::{bail, Error};
use std::collections::BTreeMap;
use std::convert::TryInto;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0a;

/// An AMF0 value. `Object`/`EcmaArray` use a `BTreeMap` so field order is
/// deterministic for tests; real players don't depend on field order.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(BTreeMap<String, Value>),
    Null,
    Undefined,
    EcmaArray(BTreeMap<String, Value>),
    StrictArray(Vec<Value>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(m) | Value::EcmaArray(m) => Some(m),
            _ => None,
        }
    }
}

fn write_string_raw(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_object_body(out: &mut Vec<u8>, m: &BTreeMap<String, Value>) {
    for (k, v) in m {
        write_string_raw(out, k);
        encode(v, out);
    }
    write_string_raw(out, "");
    out.push(MARKER_OBJECT_END);
}

/// Appends the AMF0 encoding of `v` to `out`.
pub fn encode(v: &Value, out: &mut Vec<u8>) {
    match v {
        Value::Number(n) => {
            out.push(MARKER_NUMBER);
            out.extend_from_slice(&n.to_be_bytes());
        }
        Value::Boolean(b) => {
            out.push(MARKER_BOOLEAN);
            out.push(*b as u8);
        }
        Value::String(s) => {
            out.push(MARKER_STRING);
            write_string_raw(out, s);
        }
        Value::Object(m) => {
            out.push(MARKER_OBJECT);
            write_object_body(out, m);
        }
        Value::Null => out.push(MARKER_NULL),
        Value::Undefined => out.push(MARKER_UNDEFINED),
        Value::EcmaArray(m) => {
            out.push(MARKER_ECMA_ARRAY);
            out.extend_from_slice(&(m.len() as u32).to_be_bytes());
            write_object_body(out, m);
        }
        Value::StrictArray(items) => {
            out.push(MARKER_STRICT_ARRAY);
            out.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                encode(item, out);
            }
        }
    }
}

/// Encodes a sequence of AMF0 values back to back (one RTMP command message
/// body is typically several values: name, transaction id, object, ...).
pub fn encode_all(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        encode(v, &mut out);
    }
    out
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.pos + n > self.buf.len() {
            bail!("AMF0: unexpected end of buffer (need {} more bytes)", n);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn take_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn take_string(&mut self) -> Result<String, Error> {
        let len_bytes = self.take(2)?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn take_object_body(&mut self) -> Result<BTreeMap<String, Value>, Error> {
        let mut m = BTreeMap::new();
        loop {
            let key = self.take_string()?;
            if key.is_empty() {
                let end_marker = self.take_u8()?;
                if end_marker != MARKER_OBJECT_END {
                    bail!("AMF0: expected object-end marker, got {}", end_marker);
                }
                return Ok(m);
            }
            let v = self.take_value()?;
            m.insert(key, v);
        }
    }

    fn take_value(&mut self) -> Result<Value, Error> {
        let marker = self.take_u8()?;
        Ok(match marker {
            MARKER_NUMBER => {
                let b = self.take(8)?;
                Value::Number(f64::from_be_bytes(b.try_into().unwrap()))
            }
            MARKER_BOOLEAN => Value::Boolean(self.take_u8()? != 0),
            MARKER_STRING => Value::String(self.take_string()?),
            MARKER_OBJECT => Value::Object(self.take_object_body()?),
            MARKER_NULL => Value::Null,
            MARKER_UNDEFINED => Value::Undefined,
            MARKER_ECMA_ARRAY => {
                let _count = self.take(4)?;
                Value::EcmaArray(self.take_object_body()?)
            }
            MARKER_STRICT_ARRAY => {
                let count_bytes = self.take(4)?;
                let count = u32::from_be_bytes(count_bytes.try_into().unwrap());
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(self.take_value()?);
                }
                Value::StrictArray(items)
            }
            _ => bail!("AMF0: unknown marker {}", marker),
        })
    }
}

/// Decodes every AMF0 value from `buf` (a full command/data message body may
/// hold several back to back: name, transaction id, object, ...).
pub fn decode_all(buf: &[u8]) -> Result<Vec<Value>, Error> {
    let mut r = Reader { buf, pos: 0 };
    let mut out = Vec::new();
    while r.pos < r.buf.len() {
        out.push(r.take_value()?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalars() {
        let values = vec![Value::Number(3.5), Value::Boolean(true), Value::String("hello".into()), Value::Null, Value::Undefined];
        let bytes = encode_all(&values);
        let decoded = decode_all(&bytes).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn round_trips_object_and_arrays() {
        let mut obj = BTreeMap::new();
        obj.insert("app".to_string(), Value::String("live".to_string()));
        obj.insert("fpad".to_string(), Value::Boolean(false));
        let values = vec![
            Value::String("connect".to_string()),
            Value::Number(1.0),
            Value::Object(obj.clone()),
            Value::StrictArray(vec![Value::Number(1.0), Value::Number(2.0)]),
            Value::EcmaArray(obj),
        ];
        let bytes = encode_all(&values);
        let decoded = decode_all(&bytes).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn connect_command_round_trips_like_a_real_client() {
        let mut obj = BTreeMap::new();
        obj.insert("app".to_string(), Value::String("live".to_string()));
        obj.insert("tcUrl".to_string(), Value::String("rtmp://localhost/live".to_string()));
        let values = vec![Value::String("connect".to_string()), Value::Number(1.0), Value::Object(obj)];
        let bytes = encode_all(&values);
        let decoded = decode_all(&bytes).unwrap();
        assert_eq!(decoded[0].as_str(), Some("connect"));
        assert_eq!(decoded[1].as_f64(), Some(1.0));
        assert_eq!(decoded[2].as_object().unwrap().get("app").unwrap().as_str(), Some("live"));
    }
}
