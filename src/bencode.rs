//! Strict bencode codec shared by the KRPC layer and the metadata decoder.
//!
//! Everything decoded here comes from untrusted peers, so the parser is a
//! recursive-descent reader with a hard nesting limit that rejects anything
//! outside canonical bencoding instead of guessing.

use std::collections::BTreeMap;
use thiserror::Error;

/// Deepest list/dict nesting accepted from the network.
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEof(usize),

    #[error("unexpected byte {byte:#04x} at offset {pos}")]
    UnexpectedByte { byte: u8, pos: usize },

    #[error("invalid integer at offset {0}")]
    InvalidInteger(usize),

    #[error("invalid string length at offset {0}")]
    InvalidLength(usize),

    #[error("dictionary key is not a byte string at offset {0}")]
    NonStringKey(usize),

    #[error("duplicate dictionary key at offset {0}")]
    DuplicateKey(usize),

    #[error("nesting deeper than {MAX_DEPTH}")]
    TooDeep,

    #[error("{0} trailing bytes after value")]
    TrailingData(usize),
}

/// A decoded value borrowing its byte strings from the input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value<'a> {
    Int(i64),
    Bytes(&'a [u8]),
    List(Vec<Value<'a>>),
    Dict(BTreeMap<&'a [u8], Value<'a>>),
}

impl<'a> Value<'a> {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Value::Bytes(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value<'a>]> {
        match self {
            Value::List(l) => Some(l.as_slice()),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<&'a [u8], Value<'a>>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` for missing keys and non-dict values.
    pub fn get(&self, key: &[u8]) -> Option<&Value<'a>> {
        self.as_dict()?.get(key)
    }
}

/// Decodes exactly one value spanning the whole input.
pub fn decode(raw: &[u8]) -> Result<Value<'_>, BencodeError> {
    let (value, used) = decode_prefix(raw)?;
    if used != raw.len() {
        return Err(BencodeError::TrailingData(raw.len() - used));
    }
    Ok(value)
}

/// Decodes one value from the front of `raw`, returning it together with the
/// number of bytes it occupied.
pub fn decode_prefix(raw: &[u8]) -> Result<(Value<'_>, usize), BencodeError> {
    let mut p = Parser { raw, pos: 0 };
    let value = p.value(0)?;
    Ok((value, p.pos))
}

struct Parser<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.raw
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof(self.pos))
    }

    fn value(&mut self, depth: usize) -> Result<Value<'a>, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => self.int().map(Value::Int),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            byte => Err(BencodeError::UnexpectedByte {
                byte,
                pos: self.pos,
            }),
        }
    }

    fn int(&mut self) -> Result<i64, BencodeError> {
        let start = self.pos;
        self.pos += 1; // 'i'
        let digits_start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let text = &self.raw[digits_start..self.pos];
        self.pos += 1; // 'e'

        let unsigned = text.strip_prefix(b"-").unwrap_or(text);
        let canonical = !unsigned.is_empty()
            && unsigned.iter().all(u8::is_ascii_digit)
            && !(unsigned.len() > 1 && unsigned[0] == b'0')
            && text != b"-0";
        if !canonical {
            return Err(BencodeError::InvalidInteger(start));
        }

        std::str::from_utf8(text)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(BencodeError::InvalidInteger(start))
    }

    fn bytes(&mut self) -> Result<&'a [u8], BencodeError> {
        let start = self.pos;
        let mut len: usize = 0;
        let mut digits = 0usize;
        loop {
            let b = self.peek()?;
            if b == b':' {
                break;
            }
            if !b.is_ascii_digit() || (digits == 1 && len == 0) {
                return Err(BencodeError::InvalidLength(start));
            }
            len = len
                .checked_mul(10)
                .and_then(|n| n.checked_add((b - b'0') as usize))
                .ok_or(BencodeError::InvalidLength(start))?;
            digits += 1;
            self.pos += 1;
        }
        if digits == 0 {
            return Err(BencodeError::InvalidLength(start));
        }
        self.pos += 1; // ':'

        let end = self
            .pos
            .checked_add(len)
            .ok_or(BencodeError::InvalidLength(start))?;
        let out = self
            .raw
            .get(self.pos..end)
            .ok_or(BencodeError::UnexpectedEof(self.raw.len()))?;
        self.pos = end;
        Ok(out)
    }

    fn list(&mut self, depth: usize) -> Result<Value<'a>, BencodeError> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value<'a>, BencodeError> {
        self.pos += 1; // 'd'
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            let key_pos = self.pos;
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::NonStringKey(key_pos));
            }
            let key = self.bytes()?;
            let value = self.value(depth + 1)?;
            if map.insert(key, value).is_some() {
                return Err(BencodeError::DuplicateKey(key_pos));
            }
        }
        self.pos += 1;
        Ok(Value::Dict(map))
    }
}

// ------------------------------
// Encoding
// ------------------------------

/// Encodes a value; dictionary keys come out sorted because of the BTreeMap.
pub fn encode(value: &Value<'_>) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(&mut out, value);
    out
}

fn encode_into(out: &mut Vec<u8>, value: &Value<'_>) {
    match value {
        Value::Int(n) => put_int(out, *n),
        Value::Bytes(b) => put_bytes(out, b),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(out, item);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            for (k, v) in map {
                put_bytes(out, k);
                encode_into(out, v);
            }
            out.push(b'e');
        }
    }
}

pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

pub fn put_int(out: &mut Vec<u8>, n: i64) {
    out.push(b'i');
    out.extend_from_slice(n.to_string().as_bytes());
    out.push(b'e');
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decodes_nested_structures() {
        let raw = b"d4:infod4:name3:abc6:lengthi42ee4:listli1ei-2e0:ee";
        let v = decode(raw).unwrap();
        let info = v.get(b"info").unwrap();
        assert_eq!(info.get(b"name").unwrap().as_str(), Some("abc"));
        assert_eq!(info.get(b"length").unwrap().as_int(), Some(42));
        let list = v.get(b"list").unwrap().as_list().unwrap();
        assert_eq!(list, &[Value::Int(1), Value::Int(-2), Value::Bytes(b"")]);
    }

    #[test]
    fn rejects_non_canonical_integers() {
        let cases: [&[u8]; 6] = [
            b"i-0e",
            b"i03e",
            b"ie",
            b"i-e",
            b"i1x2e",
            b"i99999999999999999999e",
        ];
        for raw in cases {
            assert!(
                matches!(decode(raw), Err(BencodeError::InvalidInteger(0))),
                "{:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn rejects_truncated_and_bad_lengths() {
        assert_eq!(decode(b"5:abc"), Err(BencodeError::UnexpectedEof(5)));
        assert_eq!(decode(b"05:abcde"), Err(BencodeError::InvalidLength(0)));
        assert!(decode(b"99999999999999999999999:x").is_err());
        assert!(decode(b"l4:spam").is_err());
        assert!(decode(b"d3:key").is_err());
    }

    #[test]
    fn rejects_structural_violations() {
        assert_eq!(decode(b"di1ei2ee"), Err(BencodeError::NonStringKey(1)));
        assert_eq!(
            decode(b"d1:ai1e1:ai2ee"),
            Err(BencodeError::DuplicateKey(7))
        );
        assert_eq!(decode(b"i1ei2e"), Err(BencodeError::TrailingData(3)));
        assert!(matches!(
            decode(b"x"),
            Err(BencodeError::UnexpectedByte { byte: b'x', pos: 0 })
        ));
    }

    #[test]
    fn enforces_depth_limit() {
        let ok = format!("{}{}", "l".repeat(MAX_DEPTH), "e".repeat(MAX_DEPTH));
        assert!(decode(ok.as_bytes()).is_ok());

        let deep = format!("{}{}", "l".repeat(MAX_DEPTH + 2), "e".repeat(MAX_DEPTH + 2));
        assert_eq!(decode(deep.as_bytes()), Err(BencodeError::TooDeep));
    }

    #[test]
    fn decode_prefix_reports_consumed_length() {
        let raw = b"d8:msg_typei1e5:piecei0eeRAWDATA";
        let (v, used) = decode_prefix(raw).unwrap();
        assert_eq!(v.get(b"msg_type").unwrap().as_int(), Some(1));
        assert_eq!(&raw[used..], b"RAWDATA");
    }

    #[test]
    fn encode_sorts_keys() {
        let mut map = BTreeMap::new();
        map.insert(&b"zz"[..], Value::Int(1));
        map.insert(&b"aa"[..], Value::Bytes(b"x"));
        assert_eq!(encode(&Value::Dict(map)), b"d2:aa1:x2:zzi1ee".to_vec());
    }

    proptest! {
        #[test]
        fn never_panics_on_arbitrary_input(raw in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = decode(&raw);
        }

        #[test]
        fn decoded_values_reencode_to_the_same_bytes(
            ints in proptest::collection::vec(any::<i64>(), 0..8),
            strs in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..16), 0..8),
        ) {
            let mut raw = b"l".to_vec();
            for n in &ints {
                put_int(&mut raw, *n);
            }
            for s in &strs {
                put_bytes(&mut raw, s);
            }
            raw.push(b'e');
            let v = decode(&raw).unwrap();
            prop_assert_eq!(encode(&v), raw);
        }
    }
}
